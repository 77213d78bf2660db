//! SFTP backend over `ssh2`.
//!
//! One SSH connection is opened per `user@host:port` and kept in a
//! [`ChannelPool`] until the session closes. Authentication tries the
//! `identity` key file first (when the location names one) and falls back to
//! a password prompt through the shared visited-set protocol. Accepted
//! passwords are kept per connection, so a dropped channel reconnects
//! without asking again.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use ssh2::{ErrorCode, FileStat, Sftp};
use tracing::{debug, info, warn};

use super::auth::{AuthPrompt, Credentials, authenticate_with};
use super::context::{CancelToken, RunContext};
use super::uri::{ResourceUri, Scheme, expand_home};
use super::{Resource, ResourceError, ResourceRef, Session, SessionState, sort_by_name};
use crate::charset::Charset;

const ACCEPTED_OPTIONS: &[&str] = &["charset", "identity"];

/// libssh2 `LIBSSH2_ERROR_AUTHENTICATION_FAILED`.
const AUTH_FAILED: i32 = -18;
/// SFTP status codes meaning the entity is absent.
const FX_NO_SUCH_FILE: i32 = 2;
const FX_NO_SUCH_PATH: i32 = 10;

#[derive(Debug, Clone)]
pub struct SftpSettings {
    pub connect_timeout: Duration,
    /// Applied to every blocking libssh2 call after the handshake.
    pub io_timeout: Duration,
}

impl Default for SftpSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            io_timeout: Duration::from_secs(60),
        }
    }
}

/// A connection that can be kept in a [`ChannelPool`].
pub trait PooledChannel: Send + Sync {
    fn disconnect(&self) -> Result<(), String>;
}

/// Connections keyed by `user@host:port`.
///
/// Concurrent acquisitions of one key connect once; the others wait on a
/// per-key gate and reuse the result. Different keys connect in parallel.
pub struct ChannelPool<C> {
    channels: Mutex<HashMap<String, Arc<C>>>,
    gates: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    closed: AtomicBool,
}

impl<C: PooledChannel> Default for ChannelPool<C> {
    fn default() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }
}

impl<C: PooledChannel> ChannelPool<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// The pooled channel for `key`, connecting with `connect` when absent.
    ///
    /// A channel that finishes connecting after cancellation or after the
    /// pool closed is disconnected instead of cached.
    pub fn acquire(
        &self,
        key: &str,
        cancel: &CancelToken,
        connect: impl FnOnce() -> Result<C, ResourceError>,
    ) -> Result<Arc<C>, ResourceError> {
        cancel.check()?;
        self.ensure_open()?;
        if let Some(channel) = self.channels.lock().get(key) {
            return Ok(channel.clone());
        }

        let gate = self
            .gates
            .lock()
            .entry(key.to_string())
            .or_default()
            .clone();
        let _gate = gate.lock();
        if let Some(channel) = self.channels.lock().get(key) {
            return Ok(channel.clone());
        }

        cancel.check()?;
        let channel = connect()?;
        if cancel.is_cancelled() || self.closed.load(Ordering::SeqCst) {
            if let Err(e) = channel.disconnect() {
                debug!(key, error = %e, "disconnect of discarded channel failed");
            }
            cancel.check()?;
            return Err(ResourceError::Closed {
                scheme: Scheme::Sftp,
            });
        }

        let channel = Arc::new(channel);
        self.channels.lock().insert(key.to_string(), channel.clone());
        Ok(channel)
    }

    /// Drop and disconnect the channel for `key`, e.g. after a transport
    /// failure. The next acquisition reconnects.
    pub fn release(&self, key: &str) {
        if let Some(channel) = self.channels.lock().remove(key)
            && let Err(e) = channel.disconnect()
        {
            debug!(key, error = %e, "disconnect failed");
        }
    }

    /// Disconnect everything and refuse further acquisitions.
    pub fn close_all(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        let drained: Vec<(String, Arc<C>)> = self.channels.lock().drain().collect();
        for (key, channel) in &drained {
            if let Err(e) = channel.disconnect() {
                warn!(key, error = %e, "disconnect failed");
            }
        }
        self.gates.lock().clear();
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.channels.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_open(&self) -> Result<(), ResourceError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(ResourceError::Closed {
                scheme: Scheme::Sftp,
            })
        } else {
            Ok(())
        }
    }
}

/// An authenticated SSH connection with its SFTP subsystem.
pub struct SftpChannel {
    key: String,
    session: ssh2::Session,
    sftp: Mutex<Sftp>,
}

impl PooledChannel for SftpChannel {
    fn disconnect(&self) -> Result<(), String> {
        debug!(key = %self.key, "closing sftp channel");
        self.session
            .disconnect(None, "closing", None)
            .map_err(|e| e.to_string())
    }
}

struct SftpShared {
    context: Arc<RunContext>,
    settings: SftpSettings,
    pool: ChannelPool<SftpChannel>,
    /// Accepted passwords per `user@host:port`.
    credentials: Mutex<HashMap<String, Credentials>>,
    state: Mutex<SessionState>,
}

/// Session for `sftp` locations.
pub struct SftpSession {
    shared: Arc<SftpShared>,
}

impl SftpSession {
    pub fn new(context: Arc<RunContext>, settings: SftpSettings) -> Self {
        Self {
            shared: Arc::new(SftpShared {
                context,
                settings,
                pool: ChannelPool::new(),
                credentials: Mutex::new(HashMap::new()),
                state: Mutex::new(SessionState::Unauthenticated),
            }),
        }
    }

    /// Number of open connections.
    pub fn open_channels(&self) -> usize {
        self.shared.pool.len()
    }
}

impl Session for SftpSession {
    fn scheme(&self) -> Scheme {
        Scheme::Sftp
    }

    fn state(&self) -> SessionState {
        *self.shared.state.lock()
    }

    fn accepts_option(&self, name: &str) -> bool {
        ACCEPTED_OPTIONS.contains(&name)
    }

    fn resource(&self, uri: ResourceUri) -> Result<ResourceRef, ResourceError> {
        if *self.shared.state.lock() == SessionState::Closed {
            return Err(ResourceError::Closed {
                scheme: Scheme::Sftp,
            });
        }
        Ok(Arc::new(SftpResource::new(self.shared.clone(), uri, None)))
    }

    fn close(&self) {
        *self.shared.state.lock() = SessionState::Closed;
        let closed = self.shared.pool.close_all();
        self.shared.credentials.lock().clear();
        if closed > 0 {
            info!(connections = closed, "sftp session closed");
        }
    }
}

impl SftpShared {
    fn set_state(&self, next: SessionState) {
        let mut state = self.state.lock();
        if *state != SessionState::Closed {
            *state = next;
        }
    }

    fn channel(&self, uri: &ResourceUri) -> Result<Arc<SftpChannel>, ResourceError> {
        let key = uri.connection_key();
        self.pool
            .acquire(&key, self.context.cancel_token(), || self.connect(uri, &key))
    }

    fn connect(&self, uri: &ResourceUri, key: &str) -> Result<SftpChannel, ResourceError> {
        let host = uri.host().unwrap_or_default();
        let port = uri.port().unwrap_or(22);
        debug!(host, port, "connecting");

        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|e| ResourceError::transport(uri, format!("resolving {host}: {e}")))?
            .next()
            .ok_or_else(|| ResourceError::transport(uri, format!("no address for {host}")))?;
        let tcp = TcpStream::connect_timeout(&addr, self.settings.connect_timeout)
            .map_err(|e| ResourceError::transport(uri, format!("connecting to {addr}: {e}")))?;

        let mut session = ssh2::Session::new()
            .map_err(|e| ResourceError::transport(uri, e.to_string()))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(u32::try_from(self.settings.io_timeout.as_millis()).unwrap_or(u32::MAX));
        session
            .handshake()
            .map_err(|e| ResourceError::transport(uri, format!("ssh handshake: {e}")))?;

        if let (Some(identity), Some(user)) = (uri.option("identity"), uri.user()) {
            let private_key = expand_home(identity);
            match session.userauth_pubkey_file(user, None, &private_key, None) {
                Ok(()) => info!(uri = %uri, user, "authenticated with key file"),
                Err(e) => debug!(uri = %uri, error = %e, "key file rejected; falling back to password"),
            }
        }

        if !session.authenticated() {
            self.set_state(SessionState::Authenticating);
            let result = self.password_login(uri, key, |creds| {
                match session.userauth_password(creds.username(), creds.password()) {
                    Ok(()) => Ok(true),
                    Err(e) if is_auth_rejection(&e) => Ok(false),
                    Err(e) => Err(ResourceError::transport(uri, e.to_string())),
                }
            });
            if let Err(e) = result {
                self.set_state(if self.pool.is_empty() {
                    SessionState::Unauthenticated
                } else {
                    SessionState::Ready
                });
                let _ = session.disconnect(None, "authentication failed", None);
                return Err(e);
            }
        }

        let sftp = session
            .sftp()
            .map_err(|e| ResourceError::transport(uri, format!("starting sftp subsystem: {e}")))?;
        self.set_state(SessionState::Ready);
        Ok(SftpChannel {
            key: key.to_string(),
            session,
            sftp: Mutex::new(sftp),
        })
    }

    /// Password authentication for a new connection. A password accepted
    /// earlier in the run is replayed first; only when it is missing or
    /// rejected does the user get a prompt.
    ///
    /// `try_password` returns `Ok(false)` when the server rejects the
    /// credentials.
    fn password_login(
        &self,
        uri: &ResourceUri,
        key: &str,
        mut try_password: impl FnMut(&Credentials) -> Result<bool, ResourceError>,
    ) -> Result<(), ResourceError> {
        let cached = self.credentials.lock().get(key).cloned();
        if let Some(creds) = cached {
            if try_password(&creds)? {
                debug!(key, "reused accepted credentials");
                return Ok(());
            }
            self.credentials.lock().remove(key);
            debug!(key, "stored credentials rejected; prompting");
        }

        let endpoint = uri.endpoint_key();
        let message = format!("Password for sftp://{key}");
        let ((), creds) = authenticate_with(
            &self.context,
            AuthPrompt {
                key: &endpoint,
                message: &message,
                uri,
                realm: None,
                known_username: uri.user(),
            },
            |creds| Ok(try_password(creds)?.then_some(())),
        )?;
        self.credentials.lock().insert(key.to_string(), creds);
        Ok(())
    }

    /// Run one SFTP operation. A session-level failure drops the pooled
    /// connection so the next operation reconnects.
    fn with_sftp<T>(
        &self,
        uri: &ResourceUri,
        op: impl FnOnce(&Sftp) -> Result<T, ssh2::Error>,
    ) -> Result<T, ResourceError> {
        self.context.check_cancelled()?;
        let channel = self.channel(uri)?;
        let result = op(&channel.sftp.lock());
        result.map_err(|e| {
            if is_missing(&e) {
                return ResourceError::not_found(uri);
            }
            if matches!(e.code(), ErrorCode::Session(_)) {
                self.pool.release(&channel.key);
            }
            ResourceError::transport(uri, e.to_string())
        })
    }
}

fn is_auth_rejection(e: &ssh2::Error) -> bool {
    matches!(e.code(), ErrorCode::Session(AUTH_FAILED))
}

fn is_missing(e: &ssh2::Error) -> bool {
    matches!(e.code(), ErrorCode::SFTP(FX_NO_SUCH_FILE | FX_NO_SUCH_PATH))
}

/// A file or directory on an SFTP server.
pub struct SftpResource {
    shared: Arc<SftpShared>,
    uri: ResourceUri,
    stat: OnceCell<Option<FileStat>>,
    content: OnceCell<Vec<u8>>,
}

impl SftpResource {
    fn new(shared: Arc<SftpShared>, uri: ResourceUri, stat: Option<FileStat>) -> Self {
        let cell = OnceCell::new();
        if let Some(stat) = stat {
            let _ = cell.set(Some(stat));
        }
        Self {
            shared,
            uri,
            stat: cell,
            content: OnceCell::new(),
        }
    }

    fn remote_path(&self) -> PathBuf {
        let path = self.uri.path().trim_end_matches('/');
        PathBuf::from(if path.is_empty() { "/" } else { path })
    }

    /// Remote attributes, `None` when the entity does not exist.
    fn stat(&self) -> Result<Option<&FileStat>, ResourceError> {
        self.stat
            .get_or_try_init(|| {
                let path = self.remote_path();
                match self.shared.with_sftp(&self.uri, |sftp| sftp.stat(&path)) {
                    Ok(stat) => Ok(Some(stat)),
                    Err(e) if e.is_not_found() => Ok(None),
                    Err(e) => Err(e),
                }
            })
            .map(Option::as_ref)
    }
}

impl std::fmt::Debug for SftpResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SftpResource")
            .field("uri", &self.uri.to_string())
            .field("cached", &self.content.get().is_some())
            .finish()
    }
}

impl Resource for SftpResource {
    fn uri(&self) -> &ResourceUri {
        &self.uri
    }

    fn content(&self) -> Result<&[u8], ResourceError> {
        self.content
            .get_or_try_init(|| {
                let path = self.remote_path();
                let mut file = self.shared.with_sftp(&self.uri, |sftp| sftp.open(&path))?;
                let mut buf = Vec::new();
                file.read_to_end(&mut buf)
                    .map_err(|e| ResourceError::io(&self.uri, e))?;
                debug!(uri = %self.uri, bytes = buf.len(), "fetched");
                Ok(buf)
            })
            .map(Vec::as_slice)
    }

    fn output_stream(&self) -> Result<Box<dyn Write + Send>, ResourceError> {
        let path = self.remote_path();
        let file = self.shared.with_sftp(&self.uri, |sftp| sftp.create(&path))?;
        Ok(Box::new(file))
    }

    fn is_directory(&self) -> bool {
        match self.stat() {
            Ok(Some(stat)) => stat.is_dir(),
            Ok(None) => false,
            Err(e) => {
                debug!(uri = %self.uri, error = %e, "stat failed; using location hint");
                self.uri.guess_directory()
            }
        }
    }

    fn exists(&self) -> bool {
        matches!(self.stat(), Ok(Some(_)))
    }

    fn list(&self) -> Result<Option<Vec<ResourceRef>>, ResourceError> {
        match self.stat()? {
            Some(stat) if stat.is_dir() => {}
            _ => return Ok(None),
        }
        let path = self.remote_path();
        let entries = self.shared.with_sftp(&self.uri, |sftp| sftp.readdir(&path))?;

        let base = self.uri.clone().with_directory_hint(true);
        let mut children: Vec<ResourceRef> = Vec::with_capacity(entries.len());
        for (entry, stat) in entries {
            let Some(name) = entry_name(&entry) else {
                continue;
            };
            let is_dir = stat.is_dir();
            children.push(Arc::new(SftpResource::new(
                self.shared.clone(),
                base.sub_uri(&name, Some(is_dir)),
                Some(stat),
            )));
        }
        sort_by_name(&mut children);
        Ok(Some(children))
    }

    fn related(&self, sub_path: &str, is_dir: Option<bool>) -> ResourceRef {
        let base = match self.stat.get() {
            Some(Some(stat)) if stat.is_dir() => self.uri.clone().with_directory_hint(true),
            _ => self.uri.clone(),
        };
        Arc::new(SftpResource::new(
            self.shared.clone(),
            base.sub_uri(sub_path, is_dir),
            None,
        ))
    }

    fn charset(&self) -> Charset {
        self.uri
            .option("charset")
            .and_then(|label| Charset::parse(label).ok())
            .unwrap_or_else(|| self.shared.context.default_charset())
    }
}

fn entry_name(entry: &Path) -> Option<String> {
    let raw = entry.to_string_lossy();
    let name = raw.trim_end_matches('/').rsplit('/').next()?;
    (!name.is_empty() && name != "." && name != "..").then(|| name.to_string())
}

#[cfg(test)]
mod tests {
    use super::super::auth::{AuthRequest, AuthenticationHandler, NoAuthentication};
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Default)]
    struct FakeChannel {
        disconnects: Arc<AtomicUsize>,
    }

    impl PooledChannel for FakeChannel {
        fn disconnect(&self) -> Result<(), String> {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_pool_connects_once_per_key() {
        let pool: ChannelPool<FakeChannel> = ChannelPool::new();
        let cancel = CancelToken::new();
        let connects = AtomicUsize::new(0);
        let connect = || {
            connects.fetch_add(1, Ordering::SeqCst);
            Ok(FakeChannel::default())
        };

        let a = pool.acquire("u@h:22", &cancel, connect).unwrap();
        let b = pool
            .acquire("u@h:22", &cancel, || panic!("must reuse"))
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(connects.load(Ordering::SeqCst), 1);

        pool.acquire("v@h:22", &cancel, || Ok(FakeChannel::default()))
            .unwrap();
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_pool_parallel_acquire_single_connect() {
        let pool: Arc<ChannelPool<FakeChannel>> = Arc::new(ChannelPool::new());
        let connects = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                let connects = connects.clone();
                std::thread::spawn(move || {
                    pool.acquire("u@h:22", &CancelToken::new(), || {
                        connects.fetch_add(1, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(20));
                        Ok(FakeChannel::default())
                    })
                    .map(|_| ())
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }
        assert_eq!(connects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_pool_discards_channel_connected_after_cancel() {
        let pool: ChannelPool<FakeChannel> = ChannelPool::new();
        let cancel = CancelToken::new();
        let disconnects = Arc::new(AtomicUsize::new(0));
        let counter = disconnects.clone();
        let err = pool
            .acquire("u@h:22", &cancel, || {
                cancel.cancel();
                Ok(FakeChannel {
                    disconnects: counter,
                })
            })
            .unwrap_err();
        assert!(matches!(err, ResourceError::Cancelled));
        assert!(pool.is_empty());
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_pool_close_and_release() {
        let pool: ChannelPool<FakeChannel> = ChannelPool::new();
        let cancel = CancelToken::new();
        let disconnects = Arc::new(AtomicUsize::new(0));
        for key in ["a", "b"] {
            let counter = disconnects.clone();
            pool.acquire(key, &cancel, || {
                Ok(FakeChannel {
                    disconnects: counter,
                })
            })
            .unwrap();
        }
        pool.release("a");
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.close_all(), 1);
        assert_eq!(disconnects.load(Ordering::SeqCst), 2);

        let err = pool
            .acquire("a", &cancel, || Ok(FakeChannel::default()))
            .unwrap_err();
        assert!(matches!(err, ResourceError::Closed { .. }));
    }

    #[test]
    fn test_session_options_and_close() {
        let ctx = Arc::new(RunContext::new(Arc::new(NoAuthentication)));
        let session = SftpSession::new(ctx, SftpSettings::default());
        assert!(session.accepts_option("identity"));
        assert!(session.accepts_option("charset"));
        assert!(!session.accepts_option("index"));

        let res = session
            .resource(ResourceUri::parse("sftp://u@h/srv/conf/").unwrap())
            .unwrap();
        assert_eq!(res.related("a.xml", None).uri().path(), "/srv/conf/a.xml");

        session.close();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session
            .resource(ResourceUri::parse("sftp://u@h/x").unwrap())
            .is_err());
    }

    /// Answers every prompt with the next password and records the
    /// `already_visited` flags it saw.
    struct Passwords {
        answers: Mutex<Vec<&'static str>>,
        seen: Mutex<Vec<bool>>,
    }

    impl AuthenticationHandler for Passwords {
        fn authenticate(&self, request: &AuthRequest<'_>) -> Option<Credentials> {
            self.seen.lock().push(request.already_visited);
            let mut answers = self.answers.lock();
            (!answers.is_empty()).then(|| Credentials::new("alice", answers.remove(0)))
        }
    }

    fn accepts(expected: &'static str) -> impl FnMut(&Credentials) -> Result<bool, ResourceError> {
        move |creds| Ok(creds.password() == expected)
    }

    #[test]
    fn test_reconnect_reuses_accepted_password() {
        let handler = Arc::new(Passwords {
            answers: Mutex::new(vec!["s3cret", "rotated"]),
            seen: Mutex::new(Vec::new()),
        });
        let ctx = Arc::new(RunContext::new(handler.clone()));
        let session = SftpSession::new(ctx, SftpSettings::default());
        let uri = ResourceUri::parse("sftp://alice@h/srv/app.xml").unwrap();
        let key = uri.connection_key();
        let shared = &session.shared;

        shared.password_login(&uri, &key, accepts("s3cret")).unwrap();
        assert_eq!(*handler.seen.lock(), vec![false]);

        // Channel dropped and reopened: no second prompt.
        let tried = AtomicUsize::new(0);
        shared
            .password_login(&uri, &key, |creds| {
                tried.fetch_add(1, Ordering::SeqCst);
                Ok(creds.password() == "s3cret")
            })
            .unwrap();
        assert_eq!(tried.load(Ordering::SeqCst), 1);
        assert_eq!(handler.seen.lock().len(), 1);

        // Password changed on the server: prompt once more.
        shared.password_login(&uri, &key, accepts("rotated")).unwrap();
        assert_eq!(*handler.seen.lock(), vec![false, false]);

        session.close();
        assert!(shared.credentials.lock().is_empty());
    }

    #[test]
    fn test_entry_name_skips_dot_entries() {
        assert_eq!(entry_name(Path::new("/srv/.")), None);
        assert_eq!(entry_name(Path::new("/srv/..")), None);
        assert_eq!(entry_name(Path::new("/srv/a.xml")), Some("a.xml".into()));
    }
}
