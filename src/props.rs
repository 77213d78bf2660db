//! `.properties` files.
//!
//! Supports the usual syntax: `#`/`!` comments, `key=value`, `key: value`
//! and `key value` separators, backslash line continuation, and the escapes
//! `\t \n \r \f \\ \uXXXX`. A later duplicate key replaces an earlier one.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::charset::Charset;
use crate::resource::{Resource, ResourceError};

#[derive(Error, Debug)]
pub enum PropertiesError {
    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error("{source_name}:{line}: {message}")]
    Syntax {
        source_name: String,
        line: usize,
        message: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    values: BTreeMap<String, String>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse text. `source_name` only labels syntax errors.
    pub fn parse(text: &str, source_name: &str) -> Result<Self, PropertiesError> {
        let mut values = BTreeMap::new();
        let mut lines = text.lines().enumerate();

        while let Some((idx, raw)) = lines.next() {
            let first = raw.trim_start();
            if first.is_empty() || first.starts_with('#') || first.starts_with('!') {
                continue;
            }

            let mut logical = String::new();
            let mut current = first;
            loop {
                if ends_with_continuation(current) {
                    logical.push_str(&current[..current.len() - 1]);
                    match lines.next() {
                        Some((_, next)) => current = next.trim_start(),
                        None => break,
                    }
                } else {
                    logical.push_str(current);
                    break;
                }
            }

            let (key, value) = split_entry(&logical);
            let syntax = |message: String| PropertiesError::Syntax {
                source_name: source_name.to_string(),
                line: idx + 1,
                message,
            };
            let key = unescape(key).map_err(syntax)?;
            let value = unescape(value).map_err(syntax)?;
            values.insert(key, value);
        }

        Ok(Self { values })
    }

    /// Read and parse a resource, decoding with `charset` or the resource's
    /// own charset.
    pub fn load(resource: &dyn Resource, charset: Option<Charset>) -> Result<Self, PropertiesError> {
        let bytes = resource.content()?;
        let charset = charset.unwrap_or_else(|| resource.charset());
        let text = charset
            .decode(bytes)
            .map_err(|e| ResourceError::encoding(resource.uri(), e))?;
        let props = Self::parse(text.trim_start_matches('\u{feff}'), &resource.uri().to_string())?;
        tracing::debug!(uri = %resource.uri(), entries = props.len(), "loaded properties");
        Ok(props)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }
}

impl FromIterator<(String, String)> for Properties {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

/// An odd number of trailing backslashes continues the line.
fn ends_with_continuation(line: &str) -> bool {
    line.chars().rev().take_while(|&c| c == '\\').count() % 2 == 1
}

/// Split a logical line at the first unescaped `=`, `:` or whitespace.
fn split_entry(line: &str) -> (&str, &str) {
    let mut escaped = false;
    let mut key_end = line.len();
    for (i, c) in line.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '=' | ':' | ' ' | '\t' | '\u{c}' => {
                key_end = i;
                break;
            }
            _ => {}
        }
    }

    let key = &line[..key_end];
    let mut rest = line[key_end..].trim_start_matches([' ', '\t', '\u{c}']);
    if let Some(r) = rest.strip_prefix(['=', ':']) {
        rest = r.trim_start_matches([' ', '\t', '\u{c}']);
    }
    (key, rest)
}

fn unescape(raw: &str) -> Result<String, String> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('f') => out.push('\u{c}'),
            Some('u') => {
                let hex: String = chars.by_ref().take(4).collect();
                let code = u32::from_str_radix(&hex, 16)
                    .ok()
                    .filter(|_| hex.len() == 4)
                    .ok_or_else(|| format!("malformed \\u escape `\\u{hex}`"))?;
                out.push(char::from_u32(code).unwrap_or(char::REPLACEMENT_CHARACTER));
            }
            Some(other) => out.push(other),
            None => {}
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_separators_and_comments() {
        let props = Properties::parse(
            "# comment\n! also comment\n\na=1\nb : 2\nc 3\n  d=\ne\n",
            "test",
        )
        .unwrap();
        assert_eq!(props.get("a"), Some("1"));
        assert_eq!(props.get("b"), Some("2"));
        assert_eq!(props.get("c"), Some("3"));
        assert_eq!(props.get("d"), Some(""));
        assert_eq!(props.get("e"), Some(""));
        assert_eq!(props.len(), 5);
    }

    #[test]
    fn test_continuation_lines() {
        let props = Properties::parse("list = a,\\\n       b,\\\n       c\nnext=x\n", "t").unwrap();
        assert_eq!(props.get("list"), Some("a,b,c"));
        assert_eq!(props.get("next"), Some("x"));
    }

    #[test]
    fn test_escaped_backslash_is_not_continuation() {
        let props = Properties::parse("path=C:\\\\tmp\\\\\nnext=1\n", "t").unwrap();
        assert_eq!(props.get("path"), Some("C:\\tmp\\"));
        assert_eq!(props.get("next"), Some("1"));
    }

    #[test]
    fn test_escapes_in_keys_and_values() {
        let props = Properties::parse("my\\ key\\=x = tab\\there \\u00e9t\\u00E9\n", "t").unwrap();
        assert_eq!(props.get("my key=x"), Some("tab\there été"));
    }

    #[test]
    fn test_later_duplicate_wins() {
        let props = Properties::parse("k=1\nk=2\n", "t").unwrap();
        assert_eq!(props.get("k"), Some("2"));
    }

    #[test]
    fn test_malformed_unicode_escape() {
        let err = Properties::parse("ok=1\nbad=\\u12\n", "app.properties").unwrap_err();
        assert!(err.to_string().starts_with("app.properties:2:"));
    }
}
