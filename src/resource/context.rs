//! Run-scoped state shared by every session.
//!
//! A [`RunContext`] is created once per run and passed by reference into each
//! session and resource. It holds the only cross-thread mutable state besides
//! the SFTP channel pool: the authentication visited set. Nothing here is
//! persisted; dropping the context forgets it.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use super::ResourceError;
use super::auth::{AuthRequest, AuthenticationHandler, Credentials};
use crate::charset::Charset;

/// Cooperative cancellation flag, cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once cancelled.
    pub fn check(&self) -> Result<(), ResourceError> {
        if self.is_cancelled() {
            Err(ResourceError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// State shared by all sessions of one run.
pub struct RunContext {
    handler: Arc<dyn AuthenticationHandler>,
    /// Endpoint keys whose last authentication attempt failed.
    visited: Mutex<HashSet<String>>,
    /// Held while a prompt is on screen so prompts never interleave.
    prompt_lock: Mutex<()>,
    cancel: CancelToken,
    default_charset: Charset,
}

impl RunContext {
    pub fn new(handler: Arc<dyn AuthenticationHandler>) -> Self {
        Self {
            handler,
            visited: Mutex::new(HashSet::new()),
            prompt_lock: Mutex::new(()),
            cancel: CancelToken::new(),
            default_charset: Charset::default(),
        }
    }

    /// Use an externally owned cancellation token.
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// Charset for resources without a `charset` option or backend metadata.
    pub fn with_default_charset(mut self, charset: Charset) -> Self {
        self.default_charset = charset;
        self
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn check_cancelled(&self) -> Result<(), ResourceError> {
        self.cancel.check()
    }

    pub fn default_charset(&self) -> Charset {
        self.default_charset
    }

    /// Whether a prompt for `key` already happened and failed this run.
    pub fn was_visited(&self, key: &str) -> bool {
        self.visited.lock().contains(key)
    }

    /// Forget `key` after a successful authentication, so a later unrelated
    /// failure prompts afresh.
    pub fn mark_succeeded(&self, key: &str) {
        if self.visited.lock().remove(key) {
            debug!(key, "authentication recovered");
        }
    }

    /// Remember `key` after a failed or aborted authentication; the next
    /// prompt for it is flagged as a retry.
    pub fn mark_failed(&self, key: &str) {
        self.visited.lock().insert(key.to_string());
    }

    /// Ask the handler for credentials. Prompts are serialized and observe
    /// cancellation both before and after waiting for the prompt lock.
    pub(crate) fn prompt(&self, request: &AuthRequest<'_>) -> Result<Option<Credentials>, ResourceError> {
        self.check_cancelled()?;
        let _guard = self.prompt_lock.lock();
        self.check_cancelled()?;
        Ok(self.handler.authenticate(request))
    }
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("visited", &self.visited.lock().len())
            .field("cancelled", &self.cancel.is_cancelled())
            .field("default_charset", &self.default_charset)
            .finish()
    }
}
