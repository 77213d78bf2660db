//! Interactivity policy and the value-prompt seam.

use std::fmt;

use serde::{Deserialize, Serialize};

/// How placeholder values may be asked for.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum InteractiveMode {
    /// Prompt for undefined values when attached to a terminal.
    #[default]
    Auto,
    /// Prompt for every value, offering the resolved one as default.
    On,
    /// Never prompt.
    Off,
}

/// Effective prompting policy after the terminal check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptPolicy {
    Never,
    UndefinedOnly,
    Always,
}

impl InteractiveMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "on" | "true" | "yes" => Some(Self::On),
            "off" | "false" | "no" => Some(Self::Off),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::On => "on",
            Self::Off => "off",
        }
    }

    /// Whether any prompting happens at all.
    pub fn should_prompt(self, is_terminal: bool) -> bool {
        self.policy(is_terminal) != PromptPolicy::Never
    }

    pub fn policy(self, is_terminal: bool) -> PromptPolicy {
        match self {
            Self::Off => PromptPolicy::Never,
            Self::On => PromptPolicy::Always,
            Self::Auto if is_terminal => PromptPolicy::UndefinedOnly,
            Self::Auto => PromptPolicy::Never,
        }
    }
}

impl fmt::Display for InteractiveMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One placeholder value request.
#[derive(Debug, Clone, Copy)]
pub struct ValueRequest<'a> {
    pub name: &'a str,
    /// Value resolved from property files, if any.
    pub default: Option<&'a str>,
    /// Relative paths of the descriptors that reference the placeholder.
    pub descriptors: &'a [String],
}

/// Supplies placeholder values interactively.
pub trait InteractionHandler: Send + Sync {
    /// `None` keeps the current state (resolved or undefined).
    fn prompt_value(&self, request: &ValueRequest<'_>) -> Option<String>;
}

/// Answers nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoInteraction;

impl InteractionHandler for NoInteraction {
    fn prompt_value(&self, _request: &ValueRequest<'_>) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_table() {
        assert_eq!(InteractiveMode::Off.policy(true), PromptPolicy::Never);
        assert_eq!(InteractiveMode::On.policy(false), PromptPolicy::Always);
        assert_eq!(InteractiveMode::Auto.policy(true), PromptPolicy::UndefinedOnly);
        assert_eq!(InteractiveMode::Auto.policy(false), PromptPolicy::Never);
        assert!(!InteractiveMode::Auto.should_prompt(false));
        assert!(InteractiveMode::On.should_prompt(false));
    }

    #[test]
    fn test_parse_and_serde() {
        assert_eq!(InteractiveMode::parse(" ON "), Some(InteractiveMode::On));
        assert_eq!(InteractiveMode::parse("false"), Some(InteractiveMode::Off));
        assert_eq!(InteractiveMode::parse("sometimes"), None);
        let json = serde_json::to_string(&InteractiveMode::Auto).unwrap();
        assert_eq!(json, "\"auto\"");
    }
}
