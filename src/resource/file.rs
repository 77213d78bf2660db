//! Local filesystem backend. Always ready, never authenticates.

use std::fs;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use once_cell::sync::OnceCell;
use tracing::debug;

use super::context::RunContext;
use super::uri::{ResourceUri, Scheme};
use super::{Resource, ResourceError, ResourceRef, Session, SessionState, sort_by_name};
use crate::charset::Charset;

const ACCEPTED_OPTIONS: &[&str] = &["charset"];

struct FileShared {
    context: Arc<RunContext>,
    closed: AtomicBool,
}

/// Session for `file` locations.
pub struct FileSession {
    shared: Arc<FileShared>,
}

impl FileSession {
    pub fn new(context: Arc<RunContext>) -> Self {
        Self {
            shared: Arc::new(FileShared {
                context,
                closed: AtomicBool::new(false),
            }),
        }
    }
}

impl Session for FileSession {
    fn scheme(&self) -> Scheme {
        Scheme::File
    }

    fn state(&self) -> SessionState {
        if self.shared.closed.load(Ordering::SeqCst) {
            SessionState::Closed
        } else {
            SessionState::Ready
        }
    }

    fn accepts_option(&self, name: &str) -> bool {
        ACCEPTED_OPTIONS.contains(&name)
    }

    fn resource(&self, uri: ResourceUri) -> Result<ResourceRef, ResourceError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(ResourceError::Closed {
                scheme: Scheme::File,
            });
        }
        Ok(Arc::new(FileResource::new(self.shared.clone(), uri)))
    }

    fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
    }
}

/// A file or directory on the local filesystem.
pub struct FileResource {
    shared: Arc<FileShared>,
    uri: ResourceUri,
    path: PathBuf,
    content: OnceCell<Vec<u8>>,
}

impl FileResource {
    fn new(shared: Arc<FileShared>, uri: ResourceUri) -> Self {
        let path = uri.to_path();
        Self {
            shared,
            uri,
            path,
            content: OnceCell::new(),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Location children are derived from. A bare directory path carries no
    /// trailing slash, so the filesystem is asked once.
    fn child_base(&self) -> ResourceUri {
        if self.uri.directory_hint().is_none()
            && !self.uri.path().ends_with('/')
            && self.path.is_dir()
        {
            self.uri.clone().with_directory_hint(true)
        } else {
            self.uri.clone()
        }
    }
}

impl std::fmt::Debug for FileResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileResource")
            .field("path", &self.path)
            .field("cached", &self.content.get().is_some())
            .finish()
    }
}

impl Resource for FileResource {
    fn uri(&self) -> &ResourceUri {
        &self.uri
    }

    fn content(&self) -> Result<&[u8], ResourceError> {
        self.content
            .get_or_try_init(|| {
                self.shared.context.check_cancelled()?;
                debug!(path = %self.path.display(), "reading file");
                fs::read(&self.path).map_err(|e| ResourceError::io(&self.uri, e))
            })
            .map(Vec::as_slice)
    }

    fn input_stream(&self) -> Result<Box<dyn Read + Send + '_>, ResourceError> {
        self.shared.context.check_cancelled()?;
        let file = fs::File::open(&self.path).map_err(|e| ResourceError::io(&self.uri, e))?;
        Ok(Box::new(file))
    }

    fn output_stream(&self) -> Result<Box<dyn Write + Send>, ResourceError> {
        self.shared.context.check_cancelled()?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| ResourceError::io(&self.uri, e))?;
        }
        let file = fs::File::create(&self.path).map_err(|e| ResourceError::io(&self.uri, e))?;
        Ok(Box::new(file))
    }

    fn is_directory(&self) -> bool {
        self.path.is_dir()
    }

    fn exists(&self) -> bool {
        self.path.exists()
    }

    fn list(&self) -> Result<Option<Vec<ResourceRef>>, ResourceError> {
        if !self.path.is_dir() {
            return Ok(None);
        }
        self.shared.context.check_cancelled()?;

        let entries = fs::read_dir(&self.path).map_err(|e| ResourceError::io(&self.uri, e))?;
        let base = self.uri.clone().with_directory_hint(true);
        let mut children: Vec<ResourceRef> = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| ResourceError::io(&self.uri, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let file_type = entry.file_type().map_err(|e| ResourceError::io(&self.uri, e))?;
            // Linked directories are not followed: a link to an ancestor loops.
            if file_type.is_symlink() && entry.path().is_dir() {
                debug!(path = %entry.path().display(), "skipping symlinked directory");
                continue;
            }
            let is_dir = file_type.is_dir();
            children.push(Arc::new(FileResource::new(
                self.shared.clone(),
                base.sub_uri(&name, Some(is_dir)),
            )));
        }
        sort_by_name(&mut children);
        Ok(Some(children))
    }

    fn related(&self, sub_path: &str, is_dir: Option<bool>) -> ResourceRef {
        Arc::new(FileResource::new(
            self.shared.clone(),
            self.child_base().sub_uri(sub_path, is_dir),
        ))
    }

    fn charset(&self) -> Charset {
        self.uri
            .option("charset")
            .and_then(|label| Charset::parse(label).ok())
            .unwrap_or_else(|| self.shared.context.default_charset())
    }
}

#[cfg(test)]
mod tests {
    use super::super::auth::NoAuthentication;
    use super::*;
    use tempfile::TempDir;

    fn session() -> FileSession {
        FileSession::new(Arc::new(RunContext::new(Arc::new(NoAuthentication))))
    }

    #[test]
    fn test_list_is_sorted_by_name() {
        let tmp = TempDir::new().unwrap();
        for name in ["c", "a", "b"] {
            fs::write(tmp.path().join(name), name).unwrap();
        }
        fs::create_dir(tmp.path().join("d")).unwrap();

        let dir = session().resource(ResourceUri::from_path(tmp.path())).unwrap();
        assert!(dir.is_directory());
        let children = dir.list().unwrap().unwrap();
        let names: Vec<&str> = children.iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["a", "b", "c", "d"]);
        assert!(children[3].is_directory());
        assert!(children[3].uri().guess_directory());
    }

    #[test]
    fn test_list_of_file_is_none() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("x.xml");
        fs::write(&file, "<x/>").unwrap();
        let res = session().resource(ResourceUri::from_path(&file)).unwrap();
        assert!(res.list().unwrap().is_none());
    }

    #[test]
    fn test_content_is_cached() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("x.properties");
        fs::write(&file, "a=1").unwrap();
        let res = session().resource(ResourceUri::from_path(&file)).unwrap();

        let first = res.content().unwrap().to_vec();
        fs::remove_file(&file).unwrap();
        let second = res.content().unwrap().to_vec();
        assert_eq!(first, second);
        assert_eq!(first, b"a=1");
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let res = session()
            .resource(ResourceUri::from_path(tmp.path().join("missing.xml")))
            .unwrap();
        assert!(!res.exists());
        assert!(res.content().unwrap_err().is_not_found());
    }

    #[test]
    fn test_output_stream_creates_parents() {
        let tmp = TempDir::new().unwrap();
        let res = session()
            .resource(ResourceUri::from_path(tmp.path().join("out/nested/a.xml")))
            .unwrap();
        {
            let mut out = res.output_stream().unwrap();
            out.write_all(b"<a/>").unwrap();
        }
        assert_eq!(
            fs::read_to_string(tmp.path().join("out/nested/a.xml")).unwrap(),
            "<a/>"
        );
    }

    #[test]
    fn test_related_from_directory_without_trailing_slash() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir(tmp.path().join("conf")).unwrap();
        fs::write(tmp.path().join("conf/a.xml"), "a").unwrap();
        let dir = session().resource(ResourceUri::from_path(tmp.path())).unwrap();
        let child = dir.related("conf/a.xml", None);
        assert_eq!(child.text().unwrap(), "a");
    }

    #[cfg(unix)]
    #[test]
    fn test_list_skips_symlinked_directories() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir(tmp.path().join("conf")).unwrap();
        fs::write(tmp.path().join("conf/app.xml"), "x").unwrap();
        std::os::unix::fs::symlink(tmp.path(), tmp.path().join("conf/loop")).unwrap();
        std::os::unix::fs::symlink(tmp.path().join("conf/app.xml"), tmp.path().join("conf/alias.xml"))
            .unwrap();

        let conf = session()
            .resource(ResourceUri::from_path(&tmp.path().join("conf")))
            .unwrap();
        let children = conf.list().unwrap().unwrap();
        let names: Vec<&str> = children.iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["alias.xml", "app.xml"]);
        assert_eq!(children[0].text().unwrap(), "x");
    }

    #[test]
    fn test_charset_option() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("latin.properties");
        fs::write(&file, [b'k', b'=', 0xE9]).unwrap();
        let uri = ResourceUri::from_path(&file).with_option("charset", "iso-8859-1");
        let res = session().resource(uri).unwrap();
        assert_eq!(res.charset(), Charset::LATIN1);
        assert_eq!(res.text().unwrap(), "k=é");
    }
}
