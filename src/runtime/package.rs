//! Archive handling: unpack to a working directory, repack with rewritten
//! entries, explode to a directory tree.

use std::collections::BTreeMap;
use std::fs;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

#[derive(Error, Debug)]
pub enum PackageError {
    #[error("archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("walking {0}")]
    Walk(#[from] walkdir::Error),

    #[error("cannot explode into {0}: it exists and is not a directory")]
    TargetNotDirectory(PathBuf),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> PackageError + '_ {
    move |source| PackageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Declared or detected kind of a destination.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum PackageType {
    Directory,
    Jar,
    War,
    Ear,
    Zip,
}

impl PackageType {
    /// Detect an archive type from a file name.
    pub fn from_name(name: &str) -> Option<Self> {
        let ext = Path::new(name).extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "jar" => Some(Self::Jar),
            "war" => Some(Self::War),
            "ear" => Some(Self::Ear),
            "zip" => Some(Self::Zip),
            _ => None,
        }
    }

    pub fn is_archive(self) -> bool {
        !matches!(self, Self::Directory)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Directory => "directory",
            Self::Jar => "jar",
            Self::War => "war",
            Self::Ear => "ear",
            Self::Zip => "zip",
        }
    }
}

impl std::fmt::Display for PackageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Extract archive bytes into `dir`. Entries escaping `dir` are refused by
/// the zip reader.
pub fn unpack(bytes: &[u8], dir: &Path) -> Result<usize, PackageError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))?;
    let entries = archive.len();
    archive.extract(dir)?;
    tracing::debug!(dir = %dir.display(), entries, "unpacked archive");
    Ok(entries)
}

/// Rebuild an archive from `original`, replacing the entries named in
/// `replacements` (keyed by entry name). Entry order and the stored/deflated
/// choice of every entry are preserved.
pub fn repack(
    original: &[u8],
    replacements: &BTreeMap<String, Vec<u8>>,
) -> Result<Vec<u8>, PackageError> {
    let mut archive = ZipArchive::new(Cursor::new(original))?;
    let mut writer = ZipWriter::new(Cursor::new(Vec::with_capacity(original.len())));

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let name = entry.name().to_string();
        let options = match entry.compression() {
            CompressionMethod::Stored => {
                SimpleFileOptions::default().compression_method(CompressionMethod::Stored)
            }
            _ => SimpleFileOptions::default(),
        };

        if entry.is_dir() {
            writer.add_directory(name.as_str(), options)?;
            continue;
        }

        writer.start_file(name.as_str(), options)?;
        if let Some(bytes) = replacements.get(&name) {
            writer
                .write_all(bytes)
                .map_err(io_err(Path::new(&name)))?;
        } else {
            let mut buf = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut buf).map_err(io_err(Path::new(&name)))?;
            writer.write_all(&buf).map_err(io_err(Path::new(&name)))?;
        }
    }

    Ok(writer.finish()?.into_inner())
}

/// Copy the working directory `src` to `target`. For [`PackageType::Ear`],
/// nested `.war` and `.jar` files are themselves unpacked into directories
/// of the same name.
pub fn explode(src: &Path, target: &Path, package: PackageType) -> Result<(), PackageError> {
    if target.exists() && !target.is_dir() {
        return Err(PackageError::TargetNotDirectory(target.to_path_buf()));
    }
    fs::create_dir_all(target).map_err(io_err(target))?;

    for entry in WalkDir::new(src).min_depth(1).sort_by_file_name() {
        let entry = entry?;
        let Ok(relative) = entry.path().strip_prefix(src) else {
            continue;
        };
        let dest = target.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&dest).map_err(io_err(&dest))?;
            continue;
        }

        let nested = package == PackageType::Ear
            && matches!(
                PackageType::from_name(&entry.file_name().to_string_lossy()),
                Some(PackageType::War | PackageType::Jar)
            );
        if nested {
            let bytes = fs::read(entry.path()).map_err(io_err(entry.path()))?;
            if dest.is_file() {
                fs::remove_file(&dest).map_err(io_err(&dest))?;
            }
            fs::create_dir_all(&dest).map_err(io_err(&dest))?;
            unpack(&bytes, &dest)?;
        } else {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).map_err(io_err(parent))?;
            }
            fs::copy(entry.path(), &dest).map_err(io_err(&dest))?;
        }
    }

    tracing::info!(target = %target.display(), package = %package, "exploded archive");
    Ok(())
}

/// Sibling directory an archive explodes into: the archive path without its
/// extension.
pub fn explode_target(archive: &Path) -> PathBuf {
    archive.with_extension("")
}

#[cfg(test)]
pub(crate) fn build_archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default();
    for (name, bytes) in entries {
        if name.ends_with('/') {
            writer.add_directory(*name, options).unwrap();
        } else {
            writer.start_file(*name, options).unwrap();
            writer.write_all(bytes).unwrap();
        }
    }
    writer.finish().unwrap().into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry_names(bytes: &[u8]) -> Vec<String> {
        let mut archive = ZipArchive::new(Cursor::new(bytes)).unwrap();
        (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect()
    }

    fn read_entry(bytes: &[u8], name: &str) -> String {
        let mut archive = ZipArchive::new(Cursor::new(bytes)).unwrap();
        let mut out = String::new();
        archive.by_name(name).unwrap().read_to_string(&mut out).unwrap();
        out
    }

    #[test]
    fn test_from_name() {
        assert_eq!(PackageType::from_name("shop.WAR"), Some(PackageType::War));
        assert_eq!(PackageType::from_name("lib/a.jar"), Some(PackageType::Jar));
        assert_eq!(PackageType::from_name("conf"), None);
        assert_eq!(PackageType::from_name("notes.txt"), None);
        assert!(!PackageType::Directory.is_archive());
    }

    #[test]
    fn test_unpack_and_repack_replaces_only_named_entries() {
        let original = build_archive(&[
            ("META-INF/", b""),
            ("META-INF/MANIFEST.MF", b"Manifest-Version: 1.0\n"),
            ("conf/app.xml", b"<a>${x}</a>"),
            ("lib/readme.txt", b"keep"),
        ]);
        let tmp = TempDir::new().unwrap();
        assert_eq!(unpack(&original, tmp.path()).unwrap(), 4);
        assert_eq!(
            fs::read_to_string(tmp.path().join("conf/app.xml")).unwrap(),
            "<a>${x}</a>"
        );

        let mut replacements = BTreeMap::new();
        replacements.insert("conf/app.xml".to_string(), b"<a>1</a>".to_vec());
        let repacked = repack(&original, &replacements).unwrap();

        assert_eq!(entry_names(&repacked), entry_names(&original));
        assert_eq!(read_entry(&repacked, "conf/app.xml"), "<a>1</a>");
        assert_eq!(read_entry(&repacked, "lib/readme.txt"), "keep");
    }

    #[test]
    fn test_explode_ear_unpacks_nested_modules() {
        let war = build_archive(&[("WEB-INF/web.xml", b"<web/>")]);
        let ear = build_archive(&[
            ("META-INF/application.xml", b"<app/>"),
            ("shop.war", &war),
        ]);
        let work = TempDir::new().unwrap();
        unpack(&ear, work.path()).unwrap();

        let out = TempDir::new().unwrap();
        let target = out.path().join("app");
        explode(work.path(), &target, PackageType::Ear).unwrap();

        assert!(target.join("shop.war").is_dir());
        assert_eq!(
            fs::read_to_string(target.join("shop.war/WEB-INF/web.xml")).unwrap(),
            "<web/>"
        );
        assert_eq!(
            fs::read_to_string(target.join("META-INF/application.xml")).unwrap(),
            "<app/>"
        );
    }

    #[test]
    fn test_explode_plain_keeps_nested_archives() {
        let jar = build_archive(&[("a.class", b"\xCA\xFE")]);
        let war = build_archive(&[("WEB-INF/lib/a.jar", &jar)]);
        let work = TempDir::new().unwrap();
        unpack(&war, work.path()).unwrap();

        let out = TempDir::new().unwrap();
        explode(work.path(), out.path(), PackageType::War).unwrap();
        assert!(out.path().join("WEB-INF/lib/a.jar").is_file());
    }

    #[test]
    fn test_explode_target() {
        assert_eq!(
            explode_target(Path::new("/srv/shop.war")),
            PathBuf::from("/srv/shop")
        );
    }
}
