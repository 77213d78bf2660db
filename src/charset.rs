//! Text charsets for descriptors, property files and fetched pages.
//!
//! Labels resolve through the WHATWG registry in `encoding_rs`, so `gbk`,
//! `shift_jis` and `iso-8859-1` all work. Descriptors are decoded strictly
//! before substitution: bytes the charset cannot read are an error, never a
//! silent U+FFFD that would be written back to disk.

use std::fmt;

use encoding_rs::{Encoding, UTF_8, WINDOWS_1252};
use thiserror::Error;

/// A charset name that is not supported.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unsupported charset `{0}`")]
pub struct UnsupportedCharset(pub String);

/// Text that does not survive a trip through a charset.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    #[error("content is not valid {charset}")]
    Malformed { charset: &'static str },

    #[error("text has characters {charset} cannot represent")]
    Unmappable { charset: &'static str },

    #[error("writing {charset} is not supported")]
    WriteUnsupported { charset: &'static str },
}

/// A text encoding.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Charset(&'static Encoding);

impl Default for Charset {
    fn default() -> Self {
        Self::UTF_8
    }
}

impl Charset {
    pub const UTF_8: Self = Self(UTF_8);
    /// ISO-8859-1, the traditional `.properties` encoding. Decoded as its
    /// windows-1252 superset, which maps every byte.
    pub const LATIN1: Self = Self(WINDOWS_1252);

    /// Parse a charset label (case-insensitive, WHATWG aliases accepted).
    pub fn parse(name: &str) -> Result<Self, UnsupportedCharset> {
        Encoding::for_label_no_replacement(name.trim().as_bytes())
            .map(Self)
            .ok_or_else(|| UnsupportedCharset(name.to_string()))
    }

    /// Charset named by the process locale (`LC_ALL`, `LC_CTYPE`, `LANG`),
    /// falling back to UTF-8.
    pub fn from_locale() -> Self {
        ["LC_ALL", "LC_CTYPE", "LANG"]
            .iter()
            .filter_map(|var| std::env::var(var).ok())
            .find(|value| !value.is_empty())
            .and_then(|locale| Self::from_locale_name(&locale))
            .unwrap_or_default()
    }

    /// Extract the codeset from a locale name such as `en_US.ISO-8859-1@euro`.
    fn from_locale_name(locale: &str) -> Option<Self> {
        let codeset = locale.split_once('.')?.1;
        let codeset = codeset.split('@').next().unwrap_or(codeset);
        Self::parse(codeset).ok()
    }

    pub fn name(&self) -> &'static str {
        self.0.name()
    }

    /// Decode bytes, failing on any sequence the charset cannot read.
    pub fn decode(&self, bytes: &[u8]) -> Result<String, EncodingError> {
        self.0
            .decode_without_bom_handling_and_without_replacement(bytes)
            .map(|text| text.into_owned())
            .ok_or(EncodingError::Malformed {
                charset: self.name(),
            })
    }

    /// Decode bytes for reading only. Invalid sequences become U+FFFD.
    pub fn decode_lossy(&self, bytes: &[u8]) -> String {
        self.0.decode_without_bom_handling(bytes).0.into_owned()
    }

    /// Encode text, failing when a character has no mapping.
    pub fn encode(&self, text: &str) -> Result<Vec<u8>, EncodingError> {
        if self.0.output_encoding() != self.0 {
            return Err(EncodingError::WriteUnsupported {
                charset: self.name(),
            });
        }
        let (bytes, _, unmappable) = self.0.encode(text);
        if unmappable {
            return Err(EncodingError::Unmappable {
                charset: self.name(),
            });
        }
        Ok(bytes.into_owned())
    }
}

impl fmt::Debug for Charset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Charset").field(&self.name()).finish()
    }
}

impl fmt::Display for Charset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
