//! HTTP(S) backend.
//!
//! Files are fetched with GET; directories are listed by fetching their index
//! page and running the [`listing`](super::listing) parser chain over it.
//! Basic credentials are prompted for on the first `401` and then sent
//! preemptively to the same `user@host:port` for the rest of the run.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use once_cell::sync::{Lazy, OnceCell};
use parking_lot::Mutex;
use regex::Regex;
use reqwest::StatusCode;
use reqwest::blocking::{Client, Response};
use reqwest::header::{CONTENT_TYPE, WWW_AUTHENTICATE};
use tracing::{debug, trace};

use super::auth::{AuthPrompt, Credentials, authenticate_with};
use super::context::RunContext;
use super::listing::{DirectoryIndexParser, IndexPage, default_parsers, parse_index};
use super::uri::{ResourceUri, Scheme};
use super::{Resource, ResourceError, ResourceRef, Session, SessionState, sort_by_name};
use crate::charset::Charset;

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// `charset` selects the text encoding; `index` names the page fetched for a
/// directory (for servers that do not serve an index at the bare path).
const ACCEPTED_OPTIONS: &[&str] = &["charset", "index"];

static REALM_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)realm\s*=\s*"([^"]*)""#).expect("realm regex"));
static CHARSET_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)charset\s*=\s*"?([^";\s]+)"#).expect("charset regex"));

#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            user_agent: concat!("autoconfig/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

struct HttpShared {
    context: Arc<RunContext>,
    client: Client,
    /// Accepted credentials per `user@host:port`.
    credentials: Mutex<HashMap<String, Credentials>>,
    /// Held across a 401 round so concurrent fetches of one host prompt once.
    auth_lock: Mutex<()>,
    state: Mutex<SessionState>,
    parsers: Vec<Box<dyn DirectoryIndexParser>>,
    requests: AtomicU64,
}

/// Session for `http` and `https` locations.
pub struct HttpSession {
    shared: Arc<HttpShared>,
}

impl HttpSession {
    pub fn new(context: Arc<RunContext>, settings: HttpSettings) -> Result<Self, ResourceError> {
        Self::with_parsers(context, settings, default_parsers())
    }

    /// Session with a custom directory-index parser chain.
    pub fn with_parsers(
        context: Arc<RunContext>,
        settings: HttpSettings,
        parsers: Vec<Box<dyn DirectoryIndexParser>>,
    ) -> Result<Self, ResourceError> {
        let client = Client::builder()
            .timeout(settings.timeout)
            .user_agent(settings.user_agent)
            .build()
            .map_err(|e| ResourceError::Transport {
                uri: "http".to_string(),
                message: format!("building http client: {e}"),
            })?;
        Ok(Self {
            shared: Arc::new(HttpShared {
                context,
                client,
                credentials: Mutex::new(HashMap::new()),
                auth_lock: Mutex::new(()),
                state: Mutex::new(SessionState::Unauthenticated),
                parsers,
                requests: AtomicU64::new(0),
            }),
        })
    }

    /// Number of HTTP requests sent so far.
    pub fn request_count(&self) -> u64 {
        self.shared.requests.load(Ordering::SeqCst)
    }
}

impl Session for HttpSession {
    fn scheme(&self) -> Scheme {
        Scheme::Http
    }

    fn state(&self) -> SessionState {
        *self.shared.state.lock()
    }

    fn accepts_option(&self, name: &str) -> bool {
        ACCEPTED_OPTIONS.contains(&name)
    }

    fn propagates_option(&self, name: &str) -> bool {
        propagates(name)
    }

    fn resource(&self, uri: ResourceUri) -> Result<ResourceRef, ResourceError> {
        self.shared.ensure_open()?;
        Ok(Arc::new(HttpResource::new(self.shared.clone(), uri)))
    }

    fn close(&self) {
        let mut state = self.shared.state.lock();
        if *state == SessionState::Closed {
            return;
        }
        *state = SessionState::Closed;
        self.shared.credentials.lock().clear();
        debug!(
            requests = self.shared.requests.load(Ordering::SeqCst),
            "http session closed"
        );
    }
}

fn propagates(option: &str) -> bool {
    option != "index"
}

/// A fetched body with its metadata.
#[derive(Debug)]
struct HttpContent {
    bytes: Vec<u8>,
    content_type: Option<String>,
    charset: Option<Charset>,
}

impl HttpShared {
    fn ensure_open(&self) -> Result<(), ResourceError> {
        if *self.state.lock() == SessionState::Closed {
            return Err(ResourceError::Closed {
                scheme: Scheme::Http,
            });
        }
        Ok(())
    }

    fn set_state(&self, next: SessionState) {
        let mut state = self.state.lock();
        if *state != SessionState::Closed {
            *state = next;
        }
    }

    fn cached_credentials(&self, connection: &str) -> Option<Credentials> {
        self.credentials.lock().get(connection).cloned()
    }

    fn request_url(uri: &ResourceUri) -> String {
        let mut url = uri.to_url_string();
        if uri.guess_directory()
            && let Some(index) = uri.option("index")
        {
            if !url.ends_with('/') {
                url.push('/');
            }
            url.push_str(&urlencoding::encode(index));
        }
        url
    }

    fn send(
        &self,
        uri: &ResourceUri,
        url: &str,
        credentials: Option<&Credentials>,
    ) -> Result<Response, ResourceError> {
        self.context.check_cancelled()?;
        let mut request = self.client.get(url);
        if let Some(creds) = credentials {
            request = request.basic_auth(creds.username(), Some(creds.password()));
        }
        self.requests.fetch_add(1, Ordering::SeqCst);
        trace!(url, authenticated = credentials.is_some(), "GET");
        request
            .send()
            .map_err(|e| ResourceError::transport(uri, e.to_string()))
    }

    fn fetch(&self, uri: &ResourceUri) -> Result<HttpContent, ResourceError> {
        self.context.check_cancelled()?;
        self.ensure_open()?;

        let url = Self::request_url(uri);
        let connection = uri.connection_key();
        let used = self.cached_credentials(&connection);
        let response = self.send(uri, &url, used.as_ref())?;
        if response.status() != StatusCode::UNAUTHORIZED {
            if used.is_none() {
                self.set_state(SessionState::Ready);
            }
            return Self::finish(uri, response);
        }

        let realm = realm_of(&response);
        let _auth = self.auth_lock.lock();

        // Another fetch may have authenticated this host while we waited.
        if let Some(fresh) = self
            .cached_credentials(&connection)
            .filter(|fresh| Some(fresh) != used.as_ref())
        {
            let response = self.send(uri, &url, Some(&fresh))?;
            if response.status() != StatusCode::UNAUTHORIZED {
                return Self::finish(uri, response);
            }
        }

        self.set_state(SessionState::Authenticating);
        let key = uri.endpoint_key();
        let message = format!("Credentials for {}", uri.to_url_string());
        let outcome = authenticate_with(
            &self.context,
            AuthPrompt {
                key: &key,
                message: &message,
                uri,
                realm: realm.as_deref(),
                known_username: uri.user(),
            },
            |creds| {
                let response = self.send(uri, &url, Some(creds))?;
                if response.status() == StatusCode::UNAUTHORIZED {
                    Ok(None)
                } else {
                    Ok(Some(response))
                }
            },
        );

        match outcome {
            Ok((response, creds)) => {
                self.credentials.lock().insert(connection, creds);
                self.set_state(SessionState::Ready);
                Self::finish(uri, response)
            }
            Err(e) => {
                let had_any = !self.credentials.lock().is_empty();
                self.set_state(if had_any {
                    SessionState::Ready
                } else {
                    SessionState::Unauthenticated
                });
                Err(e)
            }
        }
    }

    fn finish(uri: &ResourceUri, response: Response) -> Result<HttpContent, ResourceError> {
        let status = response.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Err(ResourceError::not_found(uri));
        }
        if !status.is_success() {
            return Err(ResourceError::transport(uri, format!("server returned {status}")));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let charset = content_type.as_deref().and_then(charset_of);
        let bytes = response
            .bytes()
            .map_err(|e| ResourceError::transport(uri, e.to_string()))?
            .to_vec();
        debug!(uri = %uri, bytes = bytes.len(), "fetched");
        Ok(HttpContent {
            bytes,
            content_type,
            charset,
        })
    }
}

fn realm_of(response: &Response) -> Option<String> {
    let header = response.headers().get(WWW_AUTHENTICATE)?.to_str().ok()?;
    REALM_RE.captures(header).map(|caps| caps[1].to_string())
}

fn charset_of(content_type: &str) -> Option<Charset> {
    let label = CHARSET_RE.captures(content_type)?;
    match Charset::parse(&label[1]) {
        Ok(charset) => Some(charset),
        Err(e) => {
            debug!(error = %e, "ignoring server charset");
            None
        }
    }
}

/// A file or directory behind an HTTP server.
pub struct HttpResource {
    shared: Arc<HttpShared>,
    uri: ResourceUri,
    content: OnceCell<HttpContent>,
}

impl HttpResource {
    fn new(shared: Arc<HttpShared>, uri: ResourceUri) -> Self {
        Self {
            shared,
            uri,
            content: OnceCell::new(),
        }
    }

    fn fetched(&self) -> Result<&HttpContent, ResourceError> {
        self.content.get_or_try_init(|| self.shared.fetch(&self.uri))
    }

    /// Content type reported by the server, once fetched.
    pub fn content_type(&self) -> Option<&str> {
        self.content.get().and_then(|c| c.content_type.as_deref())
    }

    fn child_base(&self) -> ResourceUri {
        self.uri.clone().retain_options(propagates)
    }
}

impl std::fmt::Debug for HttpResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpResource")
            .field("uri", &self.uri.to_string())
            .field("cached", &self.content.get().is_some())
            .finish()
    }
}

impl Resource for HttpResource {
    fn uri(&self) -> &ResourceUri {
        &self.uri
    }

    fn content(&self) -> Result<&[u8], ResourceError> {
        self.fetched().map(|c| c.bytes.as_slice())
    }

    fn is_directory(&self) -> bool {
        self.uri.guess_directory()
    }

    fn exists(&self) -> bool {
        match self.fetched() {
            Ok(_) => true,
            Err(e) => {
                if !e.is_not_found() {
                    debug!(uri = %self.uri, error = %e, "existence check failed");
                }
                false
            }
        }
    }

    fn list(&self) -> Result<Option<Vec<ResourceRef>>, ResourceError> {
        if !self.is_directory() {
            return Ok(None);
        }
        let html = self.charset().decode_lossy(self.content()?);
        let page = IndexPage {
            uri: &self.uri,
            html: &html,
        };
        let Some((parser, items)) = parse_index(&self.shared.parsers, &page) else {
            debug!(uri = %self.uri, "index page not recognized; directory is not listable");
            return Ok(None);
        };
        debug!(uri = %self.uri, parser, entries = items.len(), "parsed index page");

        let base = self.child_base();
        let mut children: Vec<ResourceRef> = items
            .into_iter()
            .map(|item| {
                Arc::new(HttpResource::new(
                    self.shared.clone(),
                    base.sub_uri(&item.name, Some(item.is_directory)),
                )) as ResourceRef
            })
            .collect();
        sort_by_name(&mut children);
        Ok(Some(children))
    }

    fn related(&self, sub_path: &str, is_dir: Option<bool>) -> ResourceRef {
        Arc::new(HttpResource::new(
            self.shared.clone(),
            self.child_base().sub_uri(sub_path, is_dir),
        ))
    }

    fn charset(&self) -> Charset {
        self.uri
            .option("charset")
            .and_then(|label| Charset::parse(label).ok())
            .or_else(|| self.content.get().and_then(|c| c.charset))
            .unwrap_or_else(|| self.shared.context.default_charset())
    }
}

#[cfg(test)]
mod tests {
    use super::super::auth::NoAuthentication;
    use super::*;

    fn session() -> HttpSession {
        let context = Arc::new(RunContext::new(Arc::new(NoAuthentication)));
        HttpSession::new(context, HttpSettings::default()).unwrap()
    }

    #[test]
    fn test_request_url_appends_index_for_directories() {
        let dir = ResourceUri::parse("http://h/conf/?index=list%20all.html").unwrap();
        assert_eq!(
            HttpShared::request_url(&dir),
            "http://h/conf/list%20all.html"
        );
        let file = ResourceUri::parse("http://h/conf/a.xml?index=list.html").unwrap();
        assert_eq!(HttpShared::request_url(&file), "http://h/conf/a.xml");
    }

    #[test]
    fn test_index_option_does_not_propagate() {
        let s = session();
        assert!(s.accepts_option("index"));
        assert!(!s.accepts_option("identity"));
        assert!(!s.propagates_option("index"));
        assert!(s.propagates_option("charset"));

        let dir = s
            .resource(ResourceUri::parse("http://h/conf/?index=i.html&charset=utf-8").unwrap())
            .unwrap();
        let child = dir.related("a.xml", None);
        assert_eq!(child.uri().option("index"), None);
        assert_eq!(child.uri().option("charset"), Some("utf-8"));
    }

    #[test]
    fn test_charset_of_content_type() {
        assert_eq!(charset_of("text/html; charset=ISO-8859-1"), Some(Charset::LATIN1));
        assert_eq!(charset_of("text/plain;charset=\"utf-8\""), Some(Charset::UTF_8));
        assert_eq!(charset_of("text/plain; charset=x-unknown"), None);
        assert_eq!(charset_of("application/octet-stream"), None);
    }

    #[test]
    fn test_closed_session_refuses_resources() {
        let s = session();
        assert_eq!(s.state(), SessionState::Unauthenticated);
        s.close();
        assert_eq!(s.state(), SessionState::Closed);
        let err = s.resource(ResourceUri::parse("http://h/x").unwrap()).unwrap_err();
        assert!(matches!(err, ResourceError::Closed { .. }));
    }

    #[test]
    fn test_file_is_not_listable() {
        let s = session();
        let res = s.resource(ResourceUri::parse("http://h/a.xml").unwrap()).unwrap();
        assert!(!res.is_directory());
        assert!(res.list().unwrap().is_none());
        assert_eq!(s.request_count(), 0);
    }
}
