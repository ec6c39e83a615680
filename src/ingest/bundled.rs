// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bundled ingest (C8): reads the loose index's bundle container,
//! consults the extent map for each inner file, and stores whatever the
//! bulk check reports missing. Bundles are grouped so every inner file
//! sourced from the same bundle is handled together, checking the
//! extent map before falling back to slicing and hashing the bundle
//! itself.

use std::collections::HashMap;

use crate::bundle::{generate_path_hash_table, BlockDecompressor, BundleIndex, BundleRecord, CompressedBundle, FileRecord};
use crate::digest::Sha256Digest;
use crate::error::{IngestError, ManifestError};
use crate::extent_map::{ExtentEntry, ExtentMap};
use crate::progress::Progress;
use crate::source::SourceBytes;
use crate::store::queue::BatchQueue;
use crate::store::{ArtifactStore, DepotFact, IndexKind, IndexRecord};
use crate::BuildTimer;

const GROUP_MAX_SIZE: u64 = 1 << 30;
const GROUP_MAX_COUNT: usize = 100_000;

const QUEUE_SIZE_BUDGET: u64 = 200 * (1 << 20);
const QUEUE_COUNT_BUDGET: u64 = 50_000;

/// Expands the bundle container referenced by `(depot, manifest)`'s
/// loose index into its inner files. A no-op unless both
/// `loose_ingested` and `has_bundles` facts are present, or if
/// `bundled_ingested` is already set.
pub async fn ingest_bundled<S: ArtifactStore>(
    store: &S,
    extent_map: &ExtentMap,
    codec: &dyn BlockDecompressor,
    depot: u32,
    manifest: u64,
    progress: &dyn Progress,
) -> Result<(), ManifestError> {
    run(store, extent_map, codec, depot, manifest, progress)
        .await
        .map_err(|e| ManifestError::new(depot, manifest, e))
}

async fn run<S: ArtifactStore>(
    store: &S,
    extent_map: &ExtentMap,
    codec: &dyn BlockDecompressor,
    depot: u32,
    manifest: u64,
    progress: &dyn Progress,
) -> Result<(), IngestError> {
    if store.has_depot_fact(depot, manifest, DepotFact::BundledIngested)? {
        return Ok(());
    }
    if !store.has_depot_fact(depot, manifest, DepotFact::LooseIngested)?
        || !store.has_depot_fact(depot, manifest, DepotFact::HasBundles)?
    {
        return Ok(());
    }

    let mut timer = BuildTimer::new();
    timer.start("bundled ingest");

    let mut index_digest = None;
    let mut bundle_by_path: HashMap<String, Sha256Digest> = HashMap::new();
    for row in store.index_reader(depot, manifest, IndexKind::Loose)? {
        let row = row?;
        if row.path == "Bundles2/_.index.bin" {
            index_digest = Some(Sha256Digest::from_hex(&row.sha256).map_err(|_| {
                IngestError::CorruptBundle("index-bundle digest is not valid hex".into())
            })?);
        } else if row.path.ends_with(".bundle.bin") {
            let digest = Sha256Digest::from_hex(&row.sha256)
                .map_err(|_| IngestError::CorruptBundle("bundle digest is not valid hex".into()))?;
            bundle_by_path.insert(row.path, digest);
        }
    }

    let Some(index_digest) = index_digest else {
        return Ok(());
    };

    let index_raw = store
        .read_data(&index_digest)?
        .ok_or_else(|| IngestError::CorruptBundle("index bundle missing from store".into()))?;
    let index = BundleIndex::parse(&index_raw, codec)?;
    let path_hashes = generate_path_hash_table(&index, codec)?;

    let mut buckets: Vec<Vec<FileRecord>> = vec![Vec::new(); index.bundles.len()];
    for &frec in &index.files {
        buckets[frec.bundle_index as usize].push(frec);
    }
    for bucket in &mut buckets {
        bucket.sort_by_key(|f| (f.file_offset, f.file_size));
    }

    progress.increment_total(index.files.len() as u64);

    let groups = group_bundles(&index.bundles, &buckets);

    let mut queue = BatchQueue::new(store, Some(QUEUE_SIZE_BUDGET), Some(QUEUE_COUNT_BUDGET));
    let mut writer = store.index_writer(depot, manifest, IndexKind::Bundled)?;

    for group in groups {
        let mut cache: HashMap<usize, Vec<u8>> = HashMap::new();
        let mut new_extents = Vec::new();
        let mut new_paths: Vec<(u64, String)> = Vec::new();
        let mut found: HashMap<Sha256Digest, (usize, u32, u32)> = HashMap::new();
        let mut rows: Vec<IndexRecord> = Vec::new();

        for bid in &group {
            let brec = &index.bundles[*bid];
            let bundle_digest = *bundle_by_path.get(&brec.bin_path()).ok_or_else(|| {
                IngestError::CorruptBundle(format!("no loose entry for bundle {}", brec.bin_path()))
            })?;

            for frec in &buckets[*bid] {
                let digest = match extent_map.get_extent(&bundle_digest, frec.file_offset, frec.file_size)? {
                    Some(d) => d,
                    None => {
                        let payload = materialize_bundle(&mut cache, *bid, bundle_digest, store, codec)?;
                        let end = frec.file_offset as usize + frec.file_size as usize;
                        let slice = payload
                            .get(frec.file_offset as usize..end)
                            .ok_or_else(|| IngestError::CorruptBundle("inner file range out of bounds".into()))?;
                        let digest = Sha256Digest::from_bytes(slice);
                        new_extents.push(ExtentEntry {
                            bundle_digest,
                            offset: frec.file_offset,
                            size: frec.file_size,
                            file_digest: digest,
                        });
                        digest
                    }
                };

                found.insert(digest, (*bid, frec.file_offset, frec.file_size));
                let path = path_hashes.path_by_ihash.get(&frec.path_hash).ok_or_else(|| {
                    IngestError::CorruptBundle(format!("no path for fingerprint {}", frec.path_hash))
                })?;
                let ohash = path_hashes
                    .ohash_by_ihash
                    .get(&frec.path_hash)
                    .copied()
                    .unwrap_or(frec.path_hash);
                new_paths.push((frec.path_hash, path.clone()));
                if ohash != frec.path_hash {
                    new_paths.push((ohash, path.clone()));
                }
                rows.push(IndexRecord {
                    path: path.clone(),
                    sha256: digest.to_hex(),
                    phash: ohash.to_string(),
                    size: frec.file_size,
                });
                progress.increment_completed(1);
            }
        }

        if !new_paths.is_empty() {
            extent_map.put_paths(&new_paths)?;
        }
        if !new_extents.is_empty() {
            extent_map.put_extents(&new_extents)?;
        }
        if !new_extents.is_empty() || !new_paths.is_empty() {
            extent_map.flush()?;
        }

        let digests: Vec<Sha256Digest> = found.keys().copied().collect();
        let missing = store.list_missing_objects(&digests)?;
        for digest in missing {
            let (bid, offset, size) = found[&digest];
            let bundle_digest = *bundle_by_path.get(&index.bundles[bid].bin_path()).unwrap();
            let payload = materialize_bundle(&mut cache, bid, bundle_digest, store, codec)?;
            let end = offset as usize + size as usize;
            let slice = payload
                .get(offset as usize..end)
                .ok_or_else(|| IngestError::CorruptBundle("inner file range out of bounds".into()))?
                .to_vec();
            queue.store_one(digest, size as u64, SourceBytes::Ready(slice))?;
        }

        for row in &rows {
            writer.write_row(row)?;
        }
    }

    queue.flush_force()?;
    writer.finish()?;
    store.set_depot_fact(depot, manifest, DepotFact::BundledIngested)?;

    let _ = timer.finish();
    timer.log_all(progress.get_log());
    Ok(())
}

/// Decompresses an outer bundle's payload at most once per group,
/// caching the result for subsequent inner-file slices in the same
/// group. Mirrors the `datafiles`/lazily-called `bdata` cache in
/// `ingest_bundled.py`.
fn materialize_bundle<'a, S: ArtifactStore>(
    cache: &'a mut HashMap<usize, Vec<u8>>,
    bid: usize,
    bundle_digest: Sha256Digest,
    store: &S,
    codec: &dyn BlockDecompressor,
) -> Result<&'a Vec<u8>, IngestError> {
    if !cache.contains_key(&bid) {
        let raw = store
            .read_data(&bundle_digest)?
            .ok_or_else(|| IngestError::CorruptBundle(format!("bundle {bundle_digest} missing from store")))?;
        let outer = CompressedBundle::parse(&raw)?;
        let payload = outer.decompress_all(codec)?;
        cache.insert(bid, payload);
    }
    Ok(cache.get(&bid).unwrap())
}

/// Partitions outer bundles into groups bounded by 1 GiB cumulative
/// uncompressed size and 100,000 cumulative inner-file count. Mirrors
/// `ingest_bundled.py`'s `group_bundles`.
fn group_bundles(bundles: &[BundleRecord], buckets: &[Vec<FileRecord>]) -> Vec<Vec<usize>> {
    let mut groups = Vec::new();
    let mut acc_group = Vec::new();
    let mut acc_size: u64 = 0;
    let mut acc_count: usize = 0;

    for (bid, frecs) in buckets.iter().enumerate() {
        if acc_size >= GROUP_MAX_SIZE || acc_count >= GROUP_MAX_COUNT {
            groups.push(std::mem::take(&mut acc_group));
            acc_size = 0;
            acc_count = 0;
        }
        acc_group.push(bid);
        acc_count += frecs.len();
        acc_size += bundles[bid].uncompressed_size as u64;
    }
    if !acc_group.is_empty() {
        groups.push(acc_group);
    }
    groups
}
