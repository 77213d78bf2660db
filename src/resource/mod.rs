//! Uniform access to configuration resources.
//!
//! Descriptors, property files and packaged artifacts may live on the local
//! filesystem, behind an HTTP(S) directory index, or on an SFTP server. This
//! module hides the difference behind two traits:
//!
//! - [`Session`]: one per backend per run; owns connections and credentials
//! - [`Resource`]: one node (file or directory) reachable through a session
//!
//! # Architecture
//!
//! - **uri**: location parsing and derivation
//! - **context**: run-scoped state shared by every session (visited set,
//!   prompt serialization, cancellation)
//! - **auth**: the credential prompt protocol
//! - **file** / **http** / **sftp**: the three backends
//! - **listing**: HTML directory-index parsers used by the HTTP backend
//!
//! # Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use auto_config::resource::{ResourceManager, SessionSettings};
//! use auto_config::resource::auth::NoAuthentication;
//! use auto_config::resource::context::RunContext;
//!
//! let context = Arc::new(RunContext::new(Arc::new(NoAuthentication)));
//! let manager = ResourceManager::new(context, SessionSettings::default());
//!
//! let dir = manager.open("http://repo.example.com/conf/")?;
//! for child in dir.list()?.unwrap_or_default() {
//!     println!("{} (dir: {})", child.name(), child.is_directory());
//! }
//! manager.close_all();
//! ```

pub mod auth;
pub mod context;
pub mod file;
pub mod http;
pub mod listing;
pub mod sftp;
pub mod uri;

use std::collections::HashMap;
use std::fmt;
use std::io::{Cursor, Read, Write};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info};

use crate::charset::{Charset, EncodingError};
use context::RunContext;
use file::FileSession;
use http::{HttpSession, HttpSettings};
use sftp::{SftpSession, SftpSettings};
pub use uri::{ResourceUri, Scheme};

/// Shared handle to a resource.
pub type ResourceRef = Arc<dyn Resource>;

/// Errors raised by sessions and resources.
///
/// Backends never retry; the caller decides what a failure means.
#[derive(Error, Debug)]
pub enum ResourceError {
    #[error("invalid location `{location}`: {reason}")]
    InvalidUri { location: String, reason: String },

    #[error("not found: {uri}")]
    NotFound { uri: String },

    #[error("authentication failed for {uri}{}: {reason}", realm_suffix(.realm))]
    Authentication {
        uri: String,
        realm: Option<String>,
        reason: String,
    },

    #[error("I/O error on {uri}: {source}")]
    Io {
        uri: String,
        #[source]
        source: std::io::Error,
    },

    #[error("transport error on {uri}: {message}")]
    Transport { uri: String, message: String },

    #[error("cannot decode {uri}: {source}")]
    Encoding {
        uri: String,
        #[source]
        source: EncodingError,
    },

    #[error("{operation} is not supported for {uri}")]
    Unsupported {
        operation: &'static str,
        uri: String,
    },

    #[error("option `{option}` is not accepted by the {scheme} backend")]
    UnsupportedOption { option: String, scheme: Scheme },

    #[error("operation cancelled")]
    Cancelled,

    #[error("the {scheme} session is closed")]
    Closed { scheme: Scheme },
}

fn realm_suffix(realm: &Option<String>) -> String {
    realm
        .as_deref()
        .map(|r| format!(" (realm \"{r}\")"))
        .unwrap_or_default()
}

impl ResourceError {
    /// Map an I/O error, keeping "not found" distinguishable.
    pub fn io(uri: &ResourceUri, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            Self::NotFound {
                uri: uri.to_string(),
            }
        } else {
            Self::Io {
                uri: uri.to_string(),
                source,
            }
        }
    }

    pub fn not_found(uri: &ResourceUri) -> Self {
        Self::NotFound {
            uri: uri.to_string(),
        }
    }

    pub fn transport(uri: &ResourceUri, message: impl Into<String>) -> Self {
        Self::Transport {
            uri: uri.to_string(),
            message: message.into(),
        }
    }

    pub fn encoding(uri: &ResourceUri, source: EncodingError) -> Self {
        Self::Encoding {
            uri: uri.to_string(),
            source,
        }
    }

    pub fn unsupported(operation: &'static str, uri: &ResourceUri) -> Self {
        Self::Unsupported {
            operation,
            uri: uri.to_string(),
        }
    }

    /// The entity does not exist. Scans treat this as non-fatal.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_authentication(&self) -> bool {
        matches!(self, Self::Authentication { .. })
    }
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Unauthenticated,
    Authenticating,
    Ready,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unauthenticated => "unauthenticated",
            Self::Authenticating => "authenticating",
            Self::Ready => "ready",
            Self::Closed => "closed",
        };
        write!(f, "{s}")
    }
}

/// One file or directory reachable through a [`Session`].
///
/// Resources are cheap to create and hold no state beyond lazily fetched
/// content and metadata; `content()` fetches at most once per instance.
pub trait Resource: Send + Sync + fmt::Debug {
    fn uri(&self) -> &ResourceUri;

    fn name(&self) -> &str {
        self.uri().name()
    }

    /// Full content, fetched on first call and cached afterwards.
    fn content(&self) -> Result<&[u8], ResourceError>;

    /// Streaming read. Backends without a native stream read through the
    /// cached content.
    fn input_stream(&self) -> Result<Box<dyn Read + Send + '_>, ResourceError> {
        Ok(Box::new(Cursor::new(self.content()?)))
    }

    /// Streaming write, replacing the entity. Read-only backends fail with
    /// [`ResourceError::Unsupported`].
    fn output_stream(&self) -> Result<Box<dyn Write + Send>, ResourceError> {
        Err(ResourceError::unsupported("writing", self.uri()))
    }

    /// Authoritative where the backend has metadata; otherwise the URI hint.
    fn is_directory(&self) -> bool;

    fn exists(&self) -> bool;

    /// Children sorted by name, or `None` when this is not a listable
    /// directory.
    fn list(&self) -> Result<Option<Vec<ResourceRef>>, ResourceError>;

    /// A child or sibling resource. Performs no I/O.
    fn related(&self, sub_path: &str, is_dir: Option<bool>) -> ResourceRef;

    /// Effective text charset: the `charset` option, then backend metadata,
    /// then the run default.
    fn charset(&self) -> Charset;

    /// Content decoded with [`charset`](Self::charset). Bytes the charset
    /// cannot read give [`ResourceError::Encoding`].
    fn text(&self) -> Result<String, ResourceError> {
        self.charset()
            .decode(self.content()?)
            .map_err(|e| ResourceError::encoding(self.uri(), e))
    }
}

/// A backend connection owner.
pub trait Session: Send + Sync {
    fn scheme(&self) -> Scheme;

    fn state(&self) -> SessionState;

    /// Whether a location option is meaningful for this backend.
    fn accepts_option(&self, name: &str) -> bool;

    /// Whether an option is carried into derived child locations.
    fn propagates_option(&self, _name: &str) -> bool {
        true
    }

    /// Resource for a location. Does not touch the network.
    fn resource(&self, uri: ResourceUri) -> Result<ResourceRef, ResourceError>;

    /// Release every connection. Never fails; problems are logged.
    fn close(&self);
}

/// Backend tuning shared by all sessions of a run.
#[derive(Debug, Clone, Default)]
pub struct SessionSettings {
    pub http: HttpSettings,
    pub sftp: SftpSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Backend {
    File,
    Http,
    Sftp,
}

impl Backend {
    fn for_scheme(scheme: Scheme) -> Self {
        match scheme {
            Scheme::File => Self::File,
            Scheme::Http | Scheme::Https => Self::Http,
            Scheme::Sftp => Self::Sftp,
        }
    }
}

/// Creates sessions on first use and hands out resources by location.
pub struct ResourceManager {
    context: Arc<RunContext>,
    settings: SessionSettings,
    sessions: Mutex<HashMap<Backend, Arc<dyn Session>>>,
}

impl ResourceManager {
    pub fn new(context: Arc<RunContext>, settings: SessionSettings) -> Self {
        Self {
            context,
            settings,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn context(&self) -> &Arc<RunContext> {
        &self.context
    }

    /// Parse a location and return its resource.
    pub fn open(&self, location: &str) -> Result<ResourceRef, ResourceError> {
        self.resource(ResourceUri::parse(location)?)
    }

    /// Resource for an already parsed location. Options the backend does not
    /// accept are rejected.
    pub fn resource(&self, uri: ResourceUri) -> Result<ResourceRef, ResourceError> {
        let session = self.session(uri.scheme())?;
        for name in uri.options().keys() {
            if !session.accepts_option(name) {
                return Err(ResourceError::UnsupportedOption {
                    option: name.clone(),
                    scheme: uri.scheme(),
                });
            }
        }
        if let Some(label) = uri.option("charset") {
            Charset::parse(label).map_err(|e| ResourceError::InvalidUri {
                location: uri.to_string(),
                reason: e.to_string(),
            })?;
        }
        session.resource(uri)
    }

    /// Session serving a scheme, created on first use.
    pub fn session(&self, scheme: Scheme) -> Result<Arc<dyn Session>, ResourceError> {
        let backend = Backend::for_scheme(scheme);
        let mut sessions = self.sessions.lock();
        if let Some(session) = sessions.get(&backend) {
            return Ok(session.clone());
        }

        let session: Arc<dyn Session> = match backend {
            Backend::File => Arc::new(FileSession::new(self.context.clone())),
            Backend::Http => Arc::new(HttpSession::new(
                self.context.clone(),
                self.settings.http.clone(),
            )?),
            Backend::Sftp => Arc::new(SftpSession::new(
                self.context.clone(),
                self.settings.sftp.clone(),
            )),
        };
        debug!(scheme = %scheme, "opened session");
        sessions.insert(backend, session.clone());
        Ok(session)
    }

    /// Close every session opened so far.
    pub fn close_all(&self) {
        let sessions: Vec<Arc<dyn Session>> =
            self.sessions.lock().drain().map(|(_, s)| s).collect();
        if sessions.is_empty() {
            return;
        }
        for session in &sessions {
            session.close();
        }
        info!(count = sessions.len(), "closed sessions");
    }
}

impl Drop for ResourceManager {
    fn drop(&mut self) {
        self.close_all();
    }
}

/// Sort resources by name, then by full location for stability.
pub(crate) fn sort_by_name(resources: &mut [ResourceRef]) {
    resources.sort_by(|a, b| {
        a.name()
            .cmp(b.name())
            .then_with(|| a.uri().path().cmp(b.uri().path()))
    });
}
