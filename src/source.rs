// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Input adapters for the loose-ingest phase: a uniform `Source` over
//! either a directory tree or a ZIP archive.

use std::fs::File;
use std::io::Read;

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::IngestError;

/// One entry yielded by [`Source::walk`]: a root-relative path, its
/// declared size, and its bytes -- either already resident (a ZIP
/// member the walker had to read anyway to learn its size) or deferred
/// behind a closure the caller can invoke only if it actually needs the
/// payload (Design Note 9.1: avoids paying decompression cost for
/// entries the extent map or store already has).
pub enum SourceBytes {
    Ready(Vec<u8>),
    Deferred(Box<dyn FnOnce() -> Result<Vec<u8>, IngestError> + Send>),
}

impl SourceBytes {
    pub fn materialize(self) -> Result<Vec<u8>, IngestError> {
        match self {
            SourceBytes::Ready(b) => Ok(b),
            SourceBytes::Deferred(f) => f(),
        }
    }
}

pub struct SourceEntry {
    pub path: Utf8PathBuf,
    pub size: u64,
    pub bytes: SourceBytes,
}

/// Uniform access to a depot's loose file tree, whether it arrived as
/// an extracted directory or as the original ZIP download.
pub trait Source {
    fn contains(&self, path: &Utf8Path) -> bool;
    fn open(&self, path: &Utf8Path) -> Result<Vec<u8>, IngestError>;
    fn walk(&self) -> Result<Vec<SourceEntry>, IngestError>;
}

/// Directory name excluded from every walk: DepotDownloader's own
/// bookkeeping, never part of the depot's content.
const EXCLUDED_DIR: &str = ".DepotDownloader";

pub struct DiskSource {
    root: Utf8PathBuf,
}

impl DiskSource {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Source for DiskSource {
    fn contains(&self, path: &Utf8Path) -> bool {
        self.root.join(path).exists()
    }

    fn open(&self, path: &Utf8Path) -> Result<Vec<u8>, IngestError> {
        Ok(std::fs::read(self.root.join(path))?)
    }

    fn walk(&self) -> Result<Vec<SourceEntry>, IngestError> {
        let mut out = Vec::new();
        for entry in walkdir::WalkDir::new(&self.root)
            .into_iter()
            .filter_entry(|e| e.file_name() != EXCLUDED_DIR)
        {
            let entry = entry.map_err(|e| IngestError::MissingSource(e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let abs = Utf8Path::from_path(entry.path())
                .ok_or_else(|| IngestError::MissingSource("non-UTF-8 path".into()))?;
            let rel = abs
                .strip_prefix(&self.root)
                .map_err(|_| IngestError::MissingSource(format!("{abs} not under source root")))?
                .to_path_buf();
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            let abs_owned = abs.to_path_buf();
            out.push(SourceEntry {
                path: rel,
                size,
                bytes: SourceBytes::Deferred(Box::new(move || Ok(std::fs::read(&abs_owned)?))),
            });
        }
        Ok(out)
    }
}

pub struct ZipSource {
    path: Utf8PathBuf,
}

impl ZipSource {
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn open_archive(&self) -> Result<zip::ZipArchive<File>, IngestError> {
        let file = File::open(&self.path)?;
        zip::ZipArchive::new(file)
            .map_err(|e| IngestError::MissingSource(format!("{}: {e}", self.path)))
    }
}

impl Source for ZipSource {
    fn contains(&self, path: &Utf8Path) -> bool {
        self.open_archive()
            .ok()
            .map(|mut z| z.by_name(path.as_str()).is_ok())
            .unwrap_or(false)
    }

    fn open(&self, path: &Utf8Path) -> Result<Vec<u8>, IngestError> {
        let mut archive = self.open_archive()?;
        let mut entry = archive
            .by_name(path.as_str())
            .map_err(|e| IngestError::MissingSource(format!("{path}: {e}")))?;
        let mut buf = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn walk(&self) -> Result<Vec<SourceEntry>, IngestError> {
        let mut archive = self.open_archive()?;
        let mut out = Vec::with_capacity(archive.len());
        for i in 0..archive.len() {
            let mut entry = archive
                .by_index(i)
                .map_err(|e| IngestError::MissingSource(e.to_string()))?;
            if entry.is_dir() {
                continue;
            }
            let name = entry.name().to_string();
            if name.contains(EXCLUDED_DIR) {
                continue;
            }
            let size = entry.size();
            let mut buf = Vec::with_capacity(size as usize);
            entry.read_to_end(&mut buf)?;
            out.push(SourceEntry {
                path: Utf8PathBuf::from(name),
                size,
                bytes: SourceBytes::Ready(buf),
            });
        }
        Ok(out)
    }
}

/// Picks a `Source` for a path: a directory becomes a [`DiskSource`], a
/// `.zip` file becomes a [`ZipSource`]. Mirrors `open_source`.
pub fn open_source(path: &Utf8Path) -> Result<Box<dyn Source>, IngestError> {
    if !path.exists() {
        return Err(IngestError::MissingSource(path.to_string()));
    }
    if path.is_dir() {
        return Ok(Box::new(DiskSource::new(path.to_path_buf())));
    }
    if path.extension() == Some("zip") {
        return Ok(Box::new(ZipSource::new(path.to_path_buf())));
    }
    Err(IngestError::MissingSource(format!("{path}: neither a directory nor a .zip file")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disk_source_walks_and_excludes_depot_downloader_dir() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        std::fs::write(root.join("a.txt"), b"hello").unwrap();
        std::fs::create_dir_all(root.join(".DepotDownloader")).unwrap();
        std::fs::write(root.join(".DepotDownloader").join("b.txt"), b"skip me").unwrap();

        let src = DiskSource::new(root.to_path_buf());
        let entries = src.walk().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, Utf8PathBuf::from("a.txt"));
    }

    #[test]
    fn disk_source_contains_and_open() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        std::fs::write(root.join("a.txt"), b"hi").unwrap();
        let src = DiskSource::new(root.to_path_buf());
        assert!(src.contains(Utf8Path::new("a.txt")));
        assert!(!src.contains(Utf8Path::new("missing.txt")));
        assert_eq!(src.open(Utf8Path::new("a.txt")).unwrap(), b"hi".to_vec());
    }
}
