// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The artifact store abstraction (C3): a content-addressed blob store,
//! an NDJSON index store, and per-manifest fact flags, with filesystem
//! and relational backends.

pub mod fs;
pub mod queue;
pub mod sql;

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::digest::Sha256Digest;
use crate::error::IngestError;

/// Which of the two per-manifest indices a row belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    Loose,
    Bundled,
}

impl IndexKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexKind::Loose => "loose",
            IndexKind::Bundled => "bundled",
        }
    }
}

/// The recognized depot fact tags. Facts are set at most once;
/// existence is the only state they carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepotFact {
    LooseIngested,
    BundledIngested,
    HasPack,
    HasBundles,
}

impl DepotFact {
    pub fn as_str(&self) -> &'static str {
        match self {
            DepotFact::LooseIngested => "loose_ingested",
            DepotFact::BundledIngested => "bundled_ingested",
            DepotFact::HasPack => "has_pack",
            DepotFact::HasBundles => "has_bundles",
        }
    }
}

/// One row of a loose or bundled index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRecord {
    pub path: String,
    pub sha256: String,
    pub phash: String,
    pub size: u32,
}

/// Scoped resource returned by [`ArtifactStore::index_writer`]: the
/// index becomes atomically visible only once [`Self::finish`] returns
/// `Ok`.
pub trait IndexWriter {
    fn write_row(&mut self, row: &IndexRecord) -> Result<(), IngestError>;
    fn finish(self: Box<Self>) -> Result<(), IngestError>;
}

/// Scoped resource returned by [`ArtifactStore::write_data_bulk`]:
/// "on-conflict-ignore" semantics, so re-storing an already-present
/// digest is a harmless no-op.
pub trait BulkWriter {
    fn store(&mut self, digest: Sha256Digest, data: &[u8]) -> Result<(), IngestError>;
}

/// The content-addressed blob store, NDJSON index store, and fact
/// table (C3). Implemented by [`fs::FilesystemStore`] and
/// [`sql::RelationalStore`].
pub trait ArtifactStore {
    fn index_writer(
        &self,
        depot: u32,
        manifest: u64,
        kind: IndexKind,
    ) -> Result<Box<dyn IndexWriter + '_>, IngestError>;

    /// Yields the index's rows lazily, in ingest order.
    fn index_reader(
        &self,
        depot: u32,
        manifest: u64,
        kind: IndexKind,
    ) -> Result<Box<dyn Iterator<Item = Result<IndexRecord, IngestError>>>, IngestError>;

    /// Bulk existence filter. `digests` must be unique on input.
    fn list_missing_objects(
        &self,
        digests: &[Sha256Digest],
    ) -> Result<HashSet<Sha256Digest>, IngestError>;

    fn write_data_bulk(&self) -> Result<Box<dyn BulkWriter + '_>, IngestError>;

    fn read_data(&self, digest: &Sha256Digest) -> Result<Option<Vec<u8>>, IngestError>;

    fn has_depot_fact(&self, depot: u32, manifest: u64, fact: DepotFact) -> Result<bool, IngestError>;
    fn set_depot_fact(&self, depot: u32, manifest: u64, fact: DepotFact) -> Result<(), IngestError>;
    fn unset_depot_fact(&self, depot: u32, manifest: u64, fact: DepotFact) -> Result<(), IngestError>;
}
