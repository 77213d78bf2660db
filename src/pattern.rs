//! Include/exclude glob sets.
//!
//! A candidate matches when it matches at least one include (or there are no
//! includes) and no exclude. `**` crosses `/`, `*` and `?` do not, and `?`
//! is exactly one character.

use glob::{MatchOptions, Pattern};
use thiserror::Error;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid pattern `{pattern}`: {reason}")]
pub struct PatternError {
    pub pattern: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct PatternSet {
    includes: Vec<Pattern>,
    excludes: Vec<Pattern>,
}

impl PatternSet {
    /// Compile a set. Empty `includes` means "everything".
    pub fn new<I, E>(includes: I, excludes: E) -> Result<Self, PatternError>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
        E: IntoIterator,
        E::Item: AsRef<str>,
    {
        Ok(Self {
            includes: compile(includes)?,
            excludes: compile(excludes)?,
        })
    }

    /// Compile from comma-separated lists, as given on the command line.
    pub fn parse_list(includes: Option<&str>, excludes: Option<&str>) -> Result<Self, PatternError> {
        Self::new(split_list(includes), split_list(excludes))
    }

    /// Matches everything.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn is_match_all(&self) -> bool {
        self.includes.is_empty() && self.excludes.is_empty()
    }

    /// Whether a `/`-separated relative path is in scope.
    pub fn matches(&self, candidate: &str) -> bool {
        let candidate = normalize(candidate);
        let included = self.includes.is_empty()
            || self
                .includes
                .iter()
                .any(|p| p.matches_with(&candidate, MATCH_OPTIONS));
        included
            && !self
                .excludes
                .iter()
                .any(|p| p.matches_with(&candidate, MATCH_OPTIONS))
    }

    /// Destination selection: the full location or its final name may match.
    pub fn matches_location(&self, location: &str, name: &str) -> bool {
        self.matches(location) || self.matches(name)
    }
}

fn split_list(list: Option<&str>) -> Vec<String> {
    list.map(|l| {
        l.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

fn compile<I>(patterns: I) -> Result<Vec<Pattern>, PatternError>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    patterns
        .into_iter()
        .map(|raw| {
            let raw = raw.as_ref();
            let mut source = normalize(raw.trim());
            // `dir/` selects everything below `dir`.
            if source.ends_with('/') {
                source.push_str("**");
            }
            Pattern::new(&source).map_err(|e| PatternError {
                pattern: raw.to_string(),
                reason: e.msg.to_string(),
            })
        })
        .collect()
}

fn normalize(path: &str) -> String {
    let path = path.replace('\\', "/");
    let mut rest = path.as_str();
    loop {
        if let Some(r) = rest.strip_prefix("./") {
            rest = r;
        } else if let Some(r) = rest.strip_prefix('/') {
            rest = r;
        } else {
            break;
        }
    }
    rest.to_string()
}
