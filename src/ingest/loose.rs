// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Loose ingest (C7): walks a `Source`, resolves as many files as
//! possible to a known digest via the depot manifest sidecar and the
//! SHA-1 bridge, and stores whatever the bulk check reports missing.

use std::collections::HashMap;

use camino::{Utf8Path, Utf8PathBuf};

use crate::depot_manifest::{parse_sidecar, DepotManifest};
use crate::digest::{Sha1Hint, Sha256Digest};
use crate::error::{IngestError, ManifestError};
use crate::extent_map::ExtentMap;
use crate::ggpk;
use crate::pathhash::{normalize_path, ModernHasher, PathHasher};
use crate::progress::Progress;
use crate::source::{Source, SourceBytes};
use crate::store::queue::BatchQueue;
use crate::store::{ArtifactStore, DepotFact, IndexKind, IndexRecord};
use crate::BuildTimer;

use super::hash_bytes;

/// Default budgets for the loose-ingest batching queue: 200 MiB or
/// 50,000 queued objects triggers an intermediate flush, mirroring the
/// bundled-ingest queue's own budget (`ingest_bundled.py`'s
/// `BatchQueue(store, size_budget=200 * 2**20, count_budget=50 * 1000)`).
const QUEUE_SIZE_BUDGET: u64 = 200 * (1 << 20);
const QUEUE_COUNT_BUDGET: u64 = 50_000;

/// Walks `source` and records every file it finds under `(depot,
/// manifest, "loose")`. A no-op if the `loose_ingested` fact is already
/// set.
pub async fn ingest_loose<S: ArtifactStore>(
    store: &S,
    extent_map: &ExtentMap,
    source: &dyn Source,
    depot: u32,
    manifest: u64,
    external_manifest_dir: Option<&Utf8Path>,
    progress: &dyn Progress,
) -> Result<(), ManifestError> {
    run(store, extent_map, source, depot, manifest, external_manifest_dir, progress)
        .await
        .map_err(|e| ManifestError::new(depot, manifest, e))
}

async fn run<S: ArtifactStore>(
    store: &S,
    extent_map: &ExtentMap,
    source: &dyn Source,
    depot: u32,
    manifest: u64,
    external_manifest_dir: Option<&Utf8Path>,
    progress: &dyn Progress,
) -> Result<(), IngestError> {
    if store.has_depot_fact(depot, manifest, DepotFact::LooseIngested)? {
        return Ok(());
    }

    let mut timer = BuildTimer::new();
    timer.start("loose ingest");

    let sha1_by_path: HashMap<String, Sha1Hint> = find_sidecar(source, external_manifest_dir, depot, manifest)?
        .map(|manifest| {
            manifest
                .files
                .into_iter()
                .map(|f| (normalize_path(&f.file_name).to_string(), Sha1Hint(f.file_hash)))
                .collect()
        })
        .unwrap_or_default();

    let entries = source.walk()?;
    progress.increment_total(entries.len() as u64);
    slog::info!(progress.get_log(), "walked source"; "depot" => depot, "manifest" => manifest, "entries" => entries.len());

    let hasher = ModernHasher::default();
    let mut queue = BatchQueue::new(store, Some(QUEUE_SIZE_BUDGET), Some(QUEUE_COUNT_BUDGET));
    let mut rows = Vec::with_capacity(entries.len());
    let mut ggpk_bytes: Option<Vec<u8>> = None;

    for entry in entries {
        let path_str = entry.path.as_str().to_string();
        let is_ggpk = entry.path.file_name() == Some("Content.ggpk");

        if entry.path.file_name() == Some("_.index.bin") {
            store.set_depot_fact(depot, manifest, DepotFact::HasBundles)?;
        }
        if is_ggpk {
            store.set_depot_fact(depot, manifest, DepotFact::HasPack)?;
        }

        let sha1 = sha1_by_path.get(normalize_path(&path_str)).copied();
        let bridged = if is_ggpk {
            None
        } else if let Some(h) = sha1 {
            extent_map.get_sha256_from_sha1(&h)?
        } else {
            None
        };

        if let Some(digest) = bridged {
            rows.push(IndexRecord {
                path: path_str.clone(),
                sha256: digest.to_hex(),
                phash: hasher.hash_file(&path_str).to_string(),
                size: entry.size as u32,
            });
            queue.store_one(digest, entry.size, entry.bytes)?;
            progress.increment_completed(1);
            continue;
        }

        let raw = entry.bytes.materialize()?;
        let (raw, digest) = hash_bytes(raw).await;
        rows.push(IndexRecord {
            path: path_str.clone(),
            sha256: digest.to_hex(),
            phash: hasher.hash_file(&path_str).to_string(),
            size: entry.size as u32,
        });
        if let Some(h) = sha1 {
            extent_map.put_sha256_from_sha1(&h, &digest)?;
        }
        if is_ggpk {
            ggpk_bytes = Some(raw.clone());
        }
        queue.store_one(digest, entry.size, SourceBytes::Ready(raw))?;
        progress.increment_completed(1);
    }

    if let Some(ggpk_data) = ggpk_bytes {
        expand_ggpk(store, ggpk_data, &hasher, &mut rows)?;
    }

    queue.flush_force()?;

    let mut writer = store.index_writer(depot, manifest, IndexKind::Loose)?;
    for row in &rows {
        writer.write_row(row)?;
    }
    writer.finish()?;

    store.set_depot_fact(depot, manifest, DepotFact::LooseIngested)?;

    let _ = timer.finish();
    timer.log_all(progress.get_log());
    Ok(())
}

/// Enumerates a `Content.ggpk`'s packed files, skipping unhashed
/// (all-zero SHA-256) and orphaned entries, bulk-checks which packed
/// digests the store is missing, and uploads exactly those.
fn expand_ggpk<S: ArtifactStore>(
    store: &S,
    ggpk_data: Vec<u8>,
    hasher: &ModernHasher,
    rows: &mut Vec<IndexRecord>,
) -> Result<(), IngestError> {
    let mut pack = ggpk::PackSource::open(std::io::Cursor::new(ggpk_data))?;

    let mut packed: Vec<(u64, String, Sha256Digest, u32)> = Vec::new();
    for (&offset, file) in pack.files() {
        if file.sha256 == [0u8; 32] {
            continue;
        }
        let Some(path) = pack.file_path(offset) else {
            continue;
        };
        packed.push((offset, path, Sha256Digest(file.sha256), file.data_size as u32));
    }
    // Deterministic order: index-row order otherwise depends on HashMap iteration.
    packed.sort_by_key(|(offset, ..)| *offset);

    let mut seen = std::collections::HashSet::new();
    let digests: Vec<Sha256Digest> = packed
        .iter()
        .filter(|(_, _, d, _)| seen.insert(*d))
        .map(|(_, _, d, _)| *d)
        .collect();
    let missing = store.list_missing_objects(&digests)?;

    for (_, path, digest, size) in &packed {
        rows.push(IndexRecord {
            path: path.clone(),
            sha256: digest.to_hex(),
            phash: hasher.hash_file(path).to_string(),
            size: *size,
        });
    }

    let mut bulk = store.write_data_bulk()?;
    for (offset, _, digest, _) in &packed {
        if missing.contains(digest) {
            let data = pack.file_data(*offset)?;
            bulk.store(*digest, &data)?;
        }
    }
    Ok(())
}

/// Searches for a depot manifest sidecar: first an external directory
/// keyed by `{manifest}.bin`/`{depot}_{manifest}.bin`, then the
/// source's own `.DepotDownloader/` convention.
fn find_sidecar(
    source: &dyn Source,
    external_manifest_dir: Option<&Utf8Path>,
    depot: u32,
    manifest: u64,
) -> Result<Option<DepotManifest>, IngestError> {
    if let Some(dir) = external_manifest_dir {
        for name in [format!("{manifest}.bin"), format!("{depot}_{manifest}.bin")] {
            let candidate = dir.join(&name);
            if candidate.exists() {
                let deflated = std::fs::read(&candidate)?;
                return Ok(Some(parse_sidecar(&deflated)?));
            }
        }
    }

    for name in [
        Utf8PathBuf::from(".DepotDownloader").join(format!("{depot}_{manifest}.bin")),
        Utf8PathBuf::from(".DepotDownloader").join(format!("{manifest}.bin")),
    ] {
        if source.contains(&name) {
            let deflated = source.open(&name)?;
            return Ok(Some(parse_sidecar(&deflated)?));
        }
    }

    Ok(None)
}
