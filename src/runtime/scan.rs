//! Destination discovery: classify, unpack, walk and collect descriptors.

use std::collections::BTreeSet;

use rayon::prelude::*;
use tempfile::TempDir;
use tracing::{debug, warn};

use super::package::PackageType;
use crate::resource::{ResourceError, ResourceRef};

/// One discovered descriptor.
#[derive(Debug, Clone)]
pub struct ConfigEntry {
    /// Destination location as given.
    pub destination: String,
    /// `/`-separated path below the destination root.
    pub relative_path: String,
    pub descriptor: ResourceRef,
    pub placeholders: BTreeSet<String>,
}

/// How a destination is scanned and written back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationKind {
    Directory,
    Archive(PackageType),
    /// A single descriptor file.
    File,
}

/// A destination that was opened and scanned.
#[derive(Debug)]
pub struct ScannedDestination {
    pub location: String,
    pub resource: ResourceRef,
    pub kind: DestinationKind,
    pub entries: Vec<ConfigEntry>,
    /// Working directory holding an unpacked archive; removed on drop.
    pub(crate) workdir: Option<TempDir>,
}

/// Files found below a directory, keyed by relative path, plus the
/// subdirectories that could not be listed.
#[derive(Debug, Default)]
pub(crate) struct WalkOutput {
    pub files: Vec<(String, ResourceRef)>,
    pub errors: Vec<(String, ResourceError)>,
}

impl WalkOutput {
    fn merge(&mut self, other: WalkOutput) {
        self.files.extend(other.files);
        self.errors.extend(other.errors);
    }
}

/// Recursively list `dir`. Subdirectories are walked in parallel on the
/// current rayon pool. Failure to list `dir` itself is returned; failures
/// below it are collected and the walk continues.
pub(crate) fn walk(dir: &ResourceRef, prefix: &str) -> Result<WalkOutput, ResourceError> {
    let Some(children) = dir.list()? else {
        return Ok(WalkOutput::default());
    };
    let (dirs, files): (Vec<ResourceRef>, Vec<ResourceRef>) =
        children.into_iter().partition(|c| c.is_directory());

    let mut out = WalkOutput {
        files: files
            .into_iter()
            .map(|f| (format!("{prefix}{}", f.name()), f))
            .collect(),
        errors: Vec::new(),
    };

    let nested: Vec<(String, Result<WalkOutput, ResourceError>)> = dirs
        .par_iter()
        .map(|d| {
            let path = format!("{prefix}{}/", d.name());
            let result = walk(d, &path);
            (path, result)
        })
        .collect();

    for (path, result) in nested {
        match result {
            Ok(sub) => out.merge(sub),
            Err(e) if e.is_not_found() => debug!(path = %path, "directory vanished during scan"),
            Err(e) => {
                warn!(path = %path, error = %e, "cannot list directory");
                out.errors.push((path, e));
            }
        }
    }

    out.files.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(out)
}

/// Classify a destination: the declared type wins, then directory metadata,
/// then the archive extension.
pub(crate) fn classify(resource: &ResourceRef, declared: Option<PackageType>) -> DestinationKind {
    match declared {
        Some(PackageType::Directory) => DestinationKind::Directory,
        Some(archive) => DestinationKind::Archive(archive),
        None if resource.is_directory() => DestinationKind::Directory,
        None => PackageType::from_name(resource.name())
            .map_or(DestinationKind::File, DestinationKind::Archive),
    }
}

/// Last path segment of a location string, for package pattern matching.
pub(crate) fn location_name(location: &str) -> &str {
    let trimmed = location.split('?').next().unwrap_or(location);
    let trimmed = trimmed.trim_end_matches(['/', '\\']);
    trimmed.rsplit(['/', '\\']).next().unwrap_or(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::auth::NoAuthentication;
    use crate::resource::context::RunContext;
    use crate::resource::{ResourceManager, ResourceUri, SessionSettings};
    use std::fs;
    use std::sync::Arc;

    fn manager() -> ResourceManager {
        ResourceManager::new(
            Arc::new(RunContext::new(Arc::new(NoAuthentication))),
            SessionSettings::default(),
        )
    }

    #[test]
    fn test_walk_collects_sorted_relative_paths() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("conf/env")).unwrap();
        fs::create_dir_all(tmp.path().join("lib")).unwrap();
        fs::write(tmp.path().join("conf/auto-config.xml"), "x").unwrap();
        fs::write(tmp.path().join("conf/env/prod.properties"), "x").unwrap();
        fs::write(tmp.path().join("lib/a.jar"), "x").unwrap();
        fs::write(tmp.path().join("README"), "x").unwrap();

        let root = manager()
            .resource(ResourceUri::from_path(tmp.path()))
            .unwrap();
        let out = walk(&root, "").unwrap();
        let paths: Vec<&str> = out.files.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(
            paths,
            vec![
                "README",
                "conf/auto-config.xml",
                "conf/env/prod.properties",
                "lib/a.jar"
            ]
        );
        assert!(out.errors.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_walk_does_not_follow_directory_loops() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("conf")).unwrap();
        fs::write(tmp.path().join("conf/app.xml"), "${h}").unwrap();
        std::os::unix::fs::symlink(tmp.path(), tmp.path().join("conf/loop")).unwrap();

        let root = manager()
            .resource(ResourceUri::from_path(tmp.path()))
            .unwrap();
        let out = walk(&root, "").unwrap();
        let paths: Vec<&str> = out.files.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(paths, vec!["conf/app.xml"]);
        assert!(out.errors.is_empty());
    }

    #[test]
    fn test_classify() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("shop.war"), "x").unwrap();
        fs::write(tmp.path().join("app.xml"), "x").unwrap();
        let mgr = manager();
        let dir = mgr.resource(ResourceUri::from_path(tmp.path())).unwrap();
        let war = dir.related("shop.war", None);
        let xml = dir.related("app.xml", None);

        assert_eq!(classify(&dir, None), DestinationKind::Directory);
        assert_eq!(classify(&war, None), DestinationKind::Archive(PackageType::War));
        assert_eq!(classify(&xml, None), DestinationKind::File);
        assert_eq!(
            classify(&xml, Some(PackageType::Zip)),
            DestinationKind::Archive(PackageType::Zip)
        );
    }

    #[test]
    fn test_location_name() {
        assert_eq!(location_name("/srv/app/shop.war"), "shop.war");
        assert_eq!(location_name("http://h/conf/?index=i.html"), "conf");
        assert_eq!(location_name("relative"), "relative");
    }
}
