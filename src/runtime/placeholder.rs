//! `${name}` placeholders.
//!
//! Names are `[A-Za-z0-9_.-]+`. `$${` is an escaped literal `${` and never
//! starts a placeholder.

use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

static PLACEHOLDER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\$\{|\$\{([A-Za-z0-9_.\-]+)\}").expect("placeholder regex")
});

/// Distinct placeholder names in `text`.
pub fn extract(text: &str) -> BTreeSet<String> {
    PLACEHOLDER_RE
        .captures_iter(text)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
        .collect()
}

/// Replace every placeholder `lookup` knows; unknown ones stay verbatim and
/// escapes collapse to `${`.
pub fn substitute<'a>(text: &str, lookup: impl Fn(&str) -> Option<&'a str>) -> String {
    PLACEHOLDER_RE
        .replace_all(text, |caps: &Captures<'_>| match caps.get(1) {
            None => "${".to_string(),
            Some(name) => lookup(name.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| caps[0].to_string()),
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_extract() {
        let names = extract("<db host=\"${db.host}\" port=\"${db-port}\"/>${db.host} ${ bad } ${}");
        assert_eq!(
            names.into_iter().collect::<Vec<_>>(),
            vec!["db-port".to_string(), "db.host".to_string()]
        );
    }

    #[test]
    fn test_escape_is_not_a_placeholder() {
        assert!(extract("literal $${not.me}").is_empty());
        let out = substitute("literal $${not.me} and ${me}", |n| (n == "me").then_some("x"));
        assert_eq!(out, "literal ${not.me} and x");
    }

    #[test]
    fn test_substitute_leaves_unknown_verbatim() {
        let values: BTreeMap<&str, &str> = [("db.host", "localhost")].into_iter().collect();
        let out = substitute("${db.host}:${db.port}", |n| values.get(n).copied());
        assert_eq!(out, "localhost:${db.port}");
    }
}
