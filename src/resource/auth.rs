//! Credential prompts and the visited-set protocol.
//!
//! Every backend that needs credentials goes through [`authenticate_with`]:
//!
//! 1. consult the visited set for the endpoint key (never mutate it here)
//! 2. prompt, passing `already_visited` so the front end can say "retry"
//! 3. try the credentials
//! 4. on success remove the key; on rejection or abort insert it
//!
//! The result is that one run never asks twice for an endpoint that has
//! already been unlocked, and a failed endpoint is re-prompted with the retry
//! flag set.

use std::fmt;

use zeroize::{Zeroize, ZeroizeOnDrop};

use super::ResourceError;
use super::context::RunContext;
use super::uri::ResourceUri;

/// A username and password. The password is wiped on drop and never printed.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// What a front end needs to render a credential prompt.
#[derive(Debug, Clone, Copy)]
pub struct AuthRequest<'a> {
    pub message: &'a str,
    pub uri: &'a ResourceUri,
    pub realm: Option<&'a str>,
    pub known_username: Option<&'a str>,
    /// The previous attempt for this endpoint failed during this run.
    pub already_visited: bool,
}

/// Supplies credentials. Implemented by the terminal front end and by tests.
pub trait AuthenticationHandler: Send + Sync {
    /// Returning `None` aborts the operation with an authentication error.
    fn authenticate(&self, request: &AuthRequest<'_>) -> Option<Credentials>;
}

/// Never supplies credentials (batch runs).
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAuthentication;

impl AuthenticationHandler for NoAuthentication {
    fn authenticate(&self, _request: &AuthRequest<'_>) -> Option<Credentials> {
        None
    }
}

/// Parameters of one authentication round.
#[derive(Debug, Clone, Copy)]
pub struct AuthPrompt<'a> {
    pub key: &'a str,
    pub message: &'a str,
    pub uri: &'a ResourceUri,
    pub realm: Option<&'a str>,
    pub known_username: Option<&'a str>,
}

/// Run one prompt-and-attempt round for an endpoint key.
///
/// `attempt` returns `Ok(Some(value))` when the credentials were accepted,
/// `Ok(None)` when they were rejected, and `Err` for failures unrelated to
/// the credentials (those leave the visited set untouched). Nothing is
/// retried here; a rejected round is an [`ResourceError::Authentication`]
/// and the next access to the same key prompts again.
pub fn authenticate_with<T>(
    context: &RunContext,
    prompt: AuthPrompt<'_>,
    attempt: impl FnOnce(&Credentials) -> Result<Option<T>, ResourceError>,
) -> Result<(T, Credentials), ResourceError> {
    let already_visited = context.was_visited(prompt.key);
    let request = AuthRequest {
        message: prompt.message,
        uri: prompt.uri,
        realm: prompt.realm,
        known_username: prompt.known_username,
        already_visited,
    };

    let Some(credentials) = context.prompt(&request)? else {
        context.mark_failed(prompt.key);
        return Err(failure(&prompt, "no credentials supplied"));
    };

    match attempt(&credentials)? {
        Some(value) => {
            context.mark_succeeded(prompt.key);
            tracing::info!(
                uri = %prompt.uri,
                user = credentials.username(),
                "authenticated"
            );
            Ok((value, credentials))
        }
        None => {
            context.mark_failed(prompt.key);
            tracing::warn!(
                uri = %prompt.uri,
                user = credentials.username(),
                "credentials rejected"
            );
            Err(failure(&prompt, "credentials rejected"))
        }
    }
}

fn failure(prompt: &AuthPrompt<'_>, reason: &str) -> ResourceError {
    ResourceError::Authentication {
        uri: prompt.uri.to_string(),
        realm: prompt.realm.map(str::to_string),
        reason: reason.to_string(),
    }
}
