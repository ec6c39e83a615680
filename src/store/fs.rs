// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The filesystem artifact store backend.
//!
//! Objects live at `data/{hex[0:2]}/{hex}.bin`, indices at
//! `index/{depot}/{manifest}-{kind}.ndjson.zst`, and facts as empty
//! marker files at `state/{depot}/{manifest}.{fact}`. Every write goes
//! through a write-to-temp-then-rename so that a reader never observes
//! a partial file; a losing rename in a race is treated as success,
//! since the postcondition is just "the bytes exist under this name".

use std::collections::HashSet;
use std::io::{BufRead, Write};

use camino::Utf8PathBuf;

use super::{ArtifactStore, BulkWriter, DepotFact, IndexKind, IndexRecord, IndexWriter};
use crate::digest::Sha256Digest;
use crate::error::IngestError;

pub struct FilesystemStore {
    root: Utf8PathBuf,
}

impl FilesystemStore {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn data_path(&self, digest: &Sha256Digest) -> Utf8PathBuf {
        let hex = digest.to_hex();
        self.root
            .join("data")
            .join(&hex[..2])
            .join(format!("{hex}.bin"))
    }

    fn index_path(&self, depot: u32, manifest: u64, kind: IndexKind) -> Utf8PathBuf {
        self.root
            .join("index")
            .join(depot.to_string())
            .join(format!("{manifest}-{}.ndjson.zst", kind.as_str()))
    }

    fn fact_path(&self, depot: u32, manifest: u64, fact: DepotFact) -> Utf8PathBuf {
        self.root
            .join("state")
            .join(depot.to_string())
            .join(format!("{manifest}.{}", fact.as_str()))
    }

    /// Writes `data` to `dest` via write-to-temp + rename. If the final
    /// path already exists (we raced with another writer to the same
    /// content-addressed destination, or lost a rename race), that is
    /// success, not an error.
    fn atomic_write(dest: &Utf8PathBuf, data: &[u8]) -> Result<(), IngestError> {
        if dest.exists() {
            return Ok(());
        }
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut tmp = camino_tempfile::NamedUtf8TempFile::new_in(dest.parent().unwrap())?;
        tmp.write_all(data)?;
        tmp.flush()?;
        match tmp.persist(dest) {
            Ok(_) => Ok(()),
            Err(e) if dest.exists() => {
                let _ = e;
                Ok(())
            }
            Err(e) => Err(IngestError::Io(e.error)),
        }
    }
}

struct FsIndexWriter {
    dest: Utf8PathBuf,
    encoder: zstd::Encoder<'static, camino_tempfile::NamedUtf8TempFile>,
}

impl IndexWriter for FsIndexWriter {
    fn write_row(&mut self, row: &IndexRecord) -> Result<(), IngestError> {
        serde_json::to_writer(&mut self.encoder, row)
            .map_err(|e| IngestError::IndexReadFailure(e.to_string()))?;
        self.encoder.write_all(b"\n")?;
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<(), IngestError> {
        let tmp = self
            .encoder
            .finish()
            .map_err(|e| IngestError::IndexReadFailure(e.to_string()))?;
        match tmp.persist(&self.dest) {
            Ok(_) => Ok(()),
            Err(e) if self.dest.exists() => {
                let _ = e;
                Ok(())
            }
            Err(e) => Err(IngestError::Io(e.error)),
        }
    }
}

struct FsBulkWriter<'a> {
    store: &'a FilesystemStore,
}

impl<'a> BulkWriter for FsBulkWriter<'a> {
    fn store(&mut self, digest: Sha256Digest, data: &[u8]) -> Result<(), IngestError> {
        FilesystemStore::atomic_write(&self.store.data_path(&digest), data)
    }
}

impl ArtifactStore for FilesystemStore {
    fn index_writer(
        &self,
        depot: u32,
        manifest: u64,
        kind: IndexKind,
    ) -> Result<Box<dyn IndexWriter + '_>, IngestError> {
        let dest = self.index_path(depot, manifest, kind);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = camino_tempfile::NamedUtf8TempFile::new_in(dest.parent().unwrap())?;
        let encoder = zstd::Encoder::new(tmp, 0)?;
        Ok(Box::new(FsIndexWriter { dest, encoder }))
    }

    fn index_reader(
        &self,
        depot: u32,
        manifest: u64,
        kind: IndexKind,
    ) -> Result<Box<dyn Iterator<Item = Result<IndexRecord, IngestError>>>, IngestError> {
        let path = self.index_path(depot, manifest, kind);
        let file = std::fs::File::open(&path)
            .map_err(|e| IngestError::IndexReadFailure(format!("{path}: {e}")))?;
        let decoder = zstd::Decoder::new(file)
            .map_err(|e| IngestError::IndexReadFailure(e.to_string()))?;
        let reader = std::io::BufReader::new(decoder);
        Ok(Box::new(reader.lines().map(|line| {
            let line = line.map_err(|e| IngestError::IndexReadFailure(e.to_string()))?;
            serde_json::from_str(&line).map_err(|e| IngestError::IndexReadFailure(e.to_string()))
        })))
    }

    fn list_missing_objects(
        &self,
        digests: &[Sha256Digest],
    ) -> Result<HashSet<Sha256Digest>, IngestError> {
        Ok(digests
            .iter()
            .filter(|d| !self.data_path(d).exists())
            .copied()
            .collect())
    }

    fn write_data_bulk(&self) -> Result<Box<dyn BulkWriter + '_>, IngestError> {
        Ok(Box::new(FsBulkWriter { store: self }))
    }

    fn read_data(&self, digest: &Sha256Digest) -> Result<Option<Vec<u8>>, IngestError> {
        let path = self.data_path(digest);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(std::fs::read(path)?))
    }

    fn has_depot_fact(&self, depot: u32, manifest: u64, fact: DepotFact) -> Result<bool, IngestError> {
        Ok(self.fact_path(depot, manifest, fact).exists())
    }

    fn set_depot_fact(&self, depot: u32, manifest: u64, fact: DepotFact) -> Result<(), IngestError> {
        let path = self.fact_path(depot, manifest, fact);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::File::create(path)?;
        Ok(())
    }

    fn unset_depot_fact(&self, depot: u32, manifest: u64, fact: DepotFact) -> Result<(), IngestError> {
        let path = self.fact_path(depot, manifest, fact);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}
