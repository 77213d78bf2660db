//! Persistent settings: defaults, then a TOML file, then `AUTOCONFIG_*`
//! environment variables. Command-line flags are applied last by the binary.
//!
//! ```toml
//! interactive = "auto"
//! strict = true
//! charset = "iso-8859-1"
//! workers = 4
//! listing_concurrency = 8
//! shared_properties = ["http://config.example.com/shared.properties"]
//!
//! [http]
//! timeout_secs = 30
//!
//! [sftp]
//! connect_timeout_secs = 15
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::charset::Charset;
use crate::resource::SessionSettings;
use crate::resource::http::HttpSettings;
use crate::resource::sftp::SftpSettings;
use crate::runtime::{DEFAULT_LISTING_CONCURRENCY, DEFAULT_WORKERS, InteractiveMode};

/// Errors that can occur when loading or validating settings.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Config file not found: {0}")]
    Missing(PathBuf),

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid environment variable {name}={value:?}: {reason}")]
    InvalidEnv {
        name: &'static str,
        value: String,
        reason: String,
    },

    #[error("Validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub timeout_secs: u64,
    /// Defaults to `autoconfig/<version>`.
    pub user_agent: Option<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: HttpSettings::default().timeout.as_secs(),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SftpConfig {
    pub connect_timeout_secs: u64,
    pub io_timeout_secs: u64,
}

impl Default for SftpConfig {
    fn default() -> Self {
        let defaults = SftpSettings::default();
        Self {
            connect_timeout_secs: defaults.connect_timeout.as_secs(),
            io_timeout_secs: defaults.io_timeout.as_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub interactive: InteractiveMode,
    pub strict: bool,
    /// Charset label for property files; unset means each resource's own.
    pub charset: Option<String>,
    pub workers: usize,
    pub listing_concurrency: usize,
    /// Shared property locations, consulted after the user properties.
    pub shared_properties: Vec<String>,
    pub http: HttpConfig,
    pub sftp: SftpConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            interactive: InteractiveMode::Auto,
            strict: false,
            charset: None,
            workers: DEFAULT_WORKERS,
            listing_concurrency: DEFAULT_LISTING_CONCURRENCY,
            shared_properties: Vec::new(),
            http: HttpConfig::default(),
            sftp: SftpConfig::default(),
        }
    }
}

impl Settings {
    /// `<config dir>/auto-config/config.toml`, when a home directory exists.
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "auto-config", "auto-config")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load from `path` or the default location, then apply environment
    /// overrides.
    ///
    /// A missing file at the default location yields defaults; a missing
    /// explicit path is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let explicit = path.is_some();
        let path = path.map(Path::to_path_buf).or_else(Self::default_path);

        let mut settings = match path {
            Some(path) if path.exists() => Self::from_file(&path)?,
            Some(path) if explicit => return Err(ConfigError::Missing(path)),
            _ => Self::default(),
        };
        settings.apply_env_overrides_from(|name| {
            dotenvy::var(name).ok().filter(|raw| !raw.trim().is_empty())
        })?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        let settings = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "loaded settings");
        Ok(settings)
    }

    pub fn apply_env_overrides_from<F>(&mut self, mut lookup: F) -> Result<(), ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        const INTERACTIVE: &str = "AUTOCONFIG_INTERACTIVE";
        const STRICT: &str = "AUTOCONFIG_STRICT";
        const CHARSET: &str = "AUTOCONFIG_CHARSET";
        const WORKERS: &str = "AUTOCONFIG_WORKERS";
        const HTTP_TIMEOUT: &str = "AUTOCONFIG_HTTP_TIMEOUT_SECS";
        const SFTP_TIMEOUT: &str = "AUTOCONFIG_SFTP_TIMEOUT_SECS";

        if let Some(raw) = lookup(INTERACTIVE) {
            self.interactive = InteractiveMode::parse(&raw).ok_or_else(|| ConfigError::InvalidEnv {
                name: INTERACTIVE,
                value: raw.clone(),
                reason: "expected auto, on or off".to_string(),
            })?;
        }
        if let Some(raw) = lookup(STRICT) {
            self.strict = parse_bool(STRICT, &raw)?;
        }
        if let Some(raw) = lookup(CHARSET) {
            Charset::parse(&raw).map_err(|e| ConfigError::InvalidEnv {
                name: CHARSET,
                value: raw.clone(),
                reason: e.to_string(),
            })?;
            self.charset = Some(raw);
        }
        if let Some(raw) = lookup(WORKERS) {
            self.workers = parse_number(WORKERS, &raw)?;
        }
        if let Some(raw) = lookup(HTTP_TIMEOUT) {
            self.http.timeout_secs = parse_number(HTTP_TIMEOUT, &raw)?;
        }
        if let Some(raw) = lookup(SFTP_TIMEOUT) {
            self.sftp.connect_timeout_secs = parse_number(SFTP_TIMEOUT, &raw)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Validation("workers must be at least 1".into()));
        }
        if self.listing_concurrency == 0 {
            return Err(ConfigError::Validation(
                "listing_concurrency must be at least 1".into(),
            ));
        }
        if self.http.timeout_secs == 0 || self.sftp.connect_timeout_secs == 0 {
            return Err(ConfigError::Validation("timeouts must be positive".into()));
        }
        self.charset()?;
        Ok(())
    }

    pub fn charset(&self) -> Result<Option<Charset>, ConfigError> {
        self.charset
            .as_deref()
            .map(Charset::parse)
            .transpose()
            .map_err(|e| ConfigError::Validation(e.to_string()))
    }

    pub fn session_settings(&self) -> SessionSettings {
        let mut http = HttpSettings {
            timeout: Duration::from_secs(self.http.timeout_secs),
            ..HttpSettings::default()
        };
        if let Some(agent) = &self.http.user_agent {
            http.user_agent = agent.clone();
        }
        SessionSettings {
            http,
            sftp: SftpSettings {
                connect_timeout: Duration::from_secs(self.sftp.connect_timeout_secs),
                io_timeout: Duration::from_secs(self.sftp.io_timeout_secs),
            },
        }
    }
}

fn parse_bool(name: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            name,
            value: raw.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}

fn parse_number<T>(name: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse::<T>().map_err(|e| ConfigError::InvalidEnv {
        name,
        value: raw.to_string(),
        reason: e.to_string(),
    })
}
