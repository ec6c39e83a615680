// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Crate-wide error kinds.
//!
//! A failure is always reported together with the `(depot, manifest)`
//! pair it occurred under; callers that need that context wrap an
//! [`IngestError`] in [`ManifestError`].

use thiserror::Error;

/// Errors produced by the core ingest components (C1-C8).
#[derive(Error, Debug)]
pub enum IngestError {
    /// The bundle header is self-inconsistent, a block failed to
    /// decompress, or the declared uncompressed size doesn't match the
    /// sum of decompressed block sizes.
    #[error("corrupt bundle: {0}")]
    CorruptBundle(String),

    /// A GGPK chunk tag was unrecognized or a child pointer was out of
    /// range.
    #[error("corrupt pack: {0}")]
    CorruptPack(String),

    /// Path-table detection (bundle parser, §4.3) found neither the
    /// legacy nor the modern root hash among the path reps.
    #[error("unknown path hash algorithm")]
    UnknownHashAlgorithm,

    /// The requested source path doesn't exist and no fallback is
    /// available.
    #[error("missing source: {0}")]
    MissingSource(String),

    /// A digest returned by the extent map was not present in the
    /// artifact store. Recovery is to re-slice and re-hash the bundle
    /// and overwrite the stale entry.
    #[error("extent map entry stale for bundle {bundle_digest}, offset {offset}, size {size}")]
    ExtentMapStale {
        bundle_digest: String,
        offset: u32,
        size: u32,
    },

    /// An index failed to parse as Zstd-framed NDJSON; treated as if
    /// the index were absent.
    #[error("index read failure: {0}")]
    IndexReadFailure(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    ExtentDb(#[from] sled::Error),

    #[error(transparent)]
    Sql(#[from] rusqlite::Error),
}

/// Wraps an [`IngestError`] with the `(depot, manifest)` pair it
/// occurred under, per the propagation rule in the error-handling
/// design: every error is reported with its manifest context, and a
/// failure in one manifest never corrupts global state.
#[derive(Error, Debug)]
#[error("depot {depot} manifest {manifest}: {source}")]
pub struct ManifestError {
    pub depot: u32,
    pub manifest: u64,
    #[source]
    pub source: IngestError,
}

impl ManifestError {
    pub fn new(depot: u32, manifest: u64, source: impl Into<IngestError>) -> Self {
        Self {
            depot,
            manifest,
            source: source.into(),
        }
    }
}
