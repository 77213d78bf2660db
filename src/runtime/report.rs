//! Run outcome: what was found, resolved, written and what failed.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::time::Duration;

use colored::Colorize;
use serde::{Serialize, Serializer};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("{} placeholder(s) undefined: {}", .names.len(), .names.join(", "))]
    UndefinedPlaceholders { names: Vec<String> },

    #[error("run failed with {failed} error(s)")]
    Failed { failed: usize },

    #[error("building worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

/// Where in the pipeline a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureStage {
    /// Opening or listing a destination root.
    Open,
    /// Listing a directory below the root.
    Scan,
    /// Reading one descriptor.
    Read,
    Properties,
    Write,
    Package,
}

impl FailureStage {
    /// Resource-level scan problems are logged and the scan continues;
    /// everything else fails the run.
    pub fn is_fatal(self) -> bool {
        matches!(self, Self::Properties | Self::Write | Self::Package)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Scan => "scan",
            Self::Read => "read",
            Self::Properties => "properties",
            Self::Write => "write",
            Self::Package => "package",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DestinationFailure {
    pub location: String,
    /// Path relative to the destination, for resource-level failures.
    pub path: Option<String>,
    pub stage: FailureStage,
    pub message: String,
}

impl DestinationFailure {
    pub fn new(
        location: impl Into<String>,
        path: Option<String>,
        stage: FailureStage,
        message: impl ToString,
    ) -> Self {
        Self {
            location: location.into(),
            path,
            stage,
            message: message.to_string(),
        }
    }
}

/// Which source supplied a resolved value. Values themselves are never
/// reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueSource {
    User,
    Shared,
    Interactive,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntrySummary {
    pub destination: String,
    pub path: String,
    pub placeholders: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    /// Destinations selected for scanning.
    pub destinations: usize,
    /// Destinations filtered out by the package patterns.
    pub skipped: Vec<String>,
    pub entries: Vec<EntrySummary>,
    pub values: BTreeMap<String, ValueSource>,
    pub undefined: BTreeSet<String>,
    pub failures: Vec<DestinationFailure>,
    pub written: Vec<String>,
    pub strict: bool,
    pub dry_run: bool,
    #[serde(rename = "elapsed_secs", serialize_with = "serialize_secs")]
    pub elapsed: Duration,
}

fn serialize_secs<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

impl RunReport {
    /// Every placeholder found has a value.
    pub fn fully_resolved(&self) -> bool {
        self.undefined.is_empty()
    }

    /// Every selected destination failed to open.
    pub fn all_destinations_failed(&self) -> bool {
        let failed: BTreeSet<&str> = self
            .failures
            .iter()
            .filter(|f| f.stage == FailureStage::Open)
            .map(|f| f.location.as_str())
            .collect();
        self.destinations > 0 && failed.len() >= self.destinations
    }

    pub fn fatal_failures(&self) -> usize {
        self.failures.iter().filter(|f| f.stage.is_fatal()).count()
    }

    pub fn succeeded(&self) -> bool {
        !self.all_destinations_failed()
            && self.fatal_failures() == 0
            && (!self.strict || self.fully_resolved())
    }

    /// `Ok` when the run succeeded, otherwise the reason.
    pub fn into_result(self) -> Result<Self, RuntimeError> {
        if self.strict && !self.fully_resolved() {
            return Err(RuntimeError::UndefinedPlaceholders {
                names: self.undefined.into_iter().collect(),
            });
        }
        if !self.succeeded() {
            return Err(RuntimeError::Failed {
                failed: self.failures.len(),
            });
        }
        Ok(self)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Human-readable summary for the terminal.
    pub fn render_summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{} {} descriptor(s) in {} destination(s)",
            "Scanned".bold(),
            self.entries.len(),
            self.destinations
        );
        for skipped in &self.skipped {
            let _ = writeln!(out, "  {} {skipped} (not selected)", "-".dimmed());
        }
        for entry in &self.entries {
            let _ = writeln!(
                out,
                "  {} {} [{}]",
                entry.destination.cyan(),
                entry.path,
                entry.placeholders.join(", ")
            );
        }

        if !self.values.is_empty() {
            let _ = writeln!(out, "{} {} value(s)", "Resolved".bold(), self.values.len());
        }
        if !self.undefined.is_empty() {
            let names: Vec<&str> = self.undefined.iter().map(String::as_str).collect();
            let label = if self.strict {
                "Undefined".red().bold()
            } else {
                "Undefined".yellow().bold()
            };
            let _ = writeln!(out, "{label} {}", names.join(", "));
        }
        for path in &self.written {
            let _ = writeln!(out, "  {} {path}", "wrote".green());
        }
        if self.dry_run && !self.entries.is_empty() {
            let _ = writeln!(out, "  {}", "dry run: nothing written".dimmed());
        }
        for failure in &self.failures {
            let location = match &failure.path {
                Some(path) => format!("{}!{path}", failure.location),
                None => failure.location.clone(),
            };
            let _ = writeln!(
                out,
                "  {} [{}] {location}: {}",
                "error".red(),
                failure.stage.as_str(),
                failure.message
            );
        }

        let status = if self.succeeded() {
            "succeeded".green().bold()
        } else {
            "failed".red().bold()
        };
        let _ = write!(
            out,
            "Run {status} in {:.2}s",
            self.elapsed.as_secs_f64()
        );
        out
    }
}
