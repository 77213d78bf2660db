//! Terminal prompts for credentials and placeholder values.
//!
//! Prompts render on stderr so stdout carries only the report. When stdin is
//! not a terminal every prompt answers `None`, which callers treat as an
//! aborted prompt.

use std::io::IsTerminal;

use colored::Colorize;
use dialoguer::theme::ColorfulTheme;
use dialoguer::{Input, Password};
use tracing::debug;

use crate::resource::auth::{AuthRequest, AuthenticationHandler, Credentials};
use crate::runtime::{InteractionHandler, ValueRequest};

/// Prompts on the controlling terminal with dialoguer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminalPrompter;

impl TerminalPrompter {
    pub fn new() -> Self {
        Self
    }

    fn attached() -> bool {
        std::io::stdin().is_terminal() && std::io::stderr().is_terminal()
    }
}

impl AuthenticationHandler for TerminalPrompter {
    fn authenticate(&self, request: &AuthRequest<'_>) -> Option<Credentials> {
        if !Self::attached() {
            debug!(uri = %request.uri, "no terminal; credential prompt aborted");
            return None;
        }

        let theme = ColorfulTheme::default();
        eprintln!();
        eprintln!("{}", request.message.bold());
        if let Some(realm) = request.realm {
            eprintln!("  realm: {}", realm.cyan());
        }
        if request.already_visited {
            eprintln!("  {}", "The previous credentials were rejected.".yellow());
        }

        let mut username = Input::<String>::with_theme(&theme).with_prompt("Username");
        if let Some(known) = request.known_username {
            username = username.default(known.to_string());
        }
        let username = username
            .interact_text()
            .map_err(|e| debug!(error = %e, "username prompt aborted"))
            .ok()?;

        let password = Password::with_theme(&theme)
            .with_prompt("Password")
            .allow_empty_password(true)
            .interact()
            .map_err(|e| debug!(error = %e, "password prompt aborted"))
            .ok()?;

        Some(Credentials::new(username, password))
    }
}

impl InteractionHandler for TerminalPrompter {
    fn prompt_value(&self, request: &ValueRequest<'_>) -> Option<String> {
        if !Self::attached() {
            return None;
        }

        let theme = ColorfulTheme::default();
        if !request.descriptors.is_empty() {
            eprintln!(
                "{} {}",
                "used in".dimmed(),
                request.descriptors.join(", ").dimmed()
            );
        }

        let mut input = Input::<String>::with_theme(&theme)
            .with_prompt(format!("Value for {}", request.name.bold()))
            .allow_empty(true);
        if let Some(default) = request.default {
            input = input.default(default.to_string());
        }
        let answer = input
            .interact_text()
            .map_err(|e| debug!(error = %e, name = request.name, "value prompt aborted"))
            .ok()?;

        // An empty answer with nothing to default to leaves the name undefined.
        if answer.is_empty() && request.default.is_none() {
            None
        } else {
            Some(answer)
        }
    }
}
