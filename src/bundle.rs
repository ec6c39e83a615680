// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The bundle container parser (C6): outer-bundle header decoding,
//! per-block decompression, the index bundle's nested record lists, and
//! path reconstruction from the bytecode stream.

use std::io::Read;

use byteorder::{LittleEndian, ReadBytesExt};
use std::collections::HashMap;

use crate::error::IngestError;
use crate::pathhash::{LegacyHasher, ModernHasher, PathHasher};

/// Decompresses one Oodle/Kraken-compressed block. Abstracted behind a
/// trait so the bundle parser doesn't hard-depend on a single codec
/// binding, and so tests can substitute a stub.
pub trait BlockDecompressor {
    fn decompress_block(&self, compressed: &[u8], uncompressed_size: usize) -> Result<Vec<u8>, IngestError>;
}

/// Default decompressor, backed by `oozextract`'s pure-Rust Kraken
/// implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct OozDecompressor;

impl BlockDecompressor for OozDecompressor {
    fn decompress_block(&self, compressed: &[u8], uncompressed_size: usize) -> Result<Vec<u8>, IngestError> {
        let mut out = vec![0u8; uncompressed_size];
        let mut extractor = oozextract::Extractor::new();
        extractor
            .read_extract(&mut std::io::Cursor::new(compressed), &mut out, uncompressed_size)
            .map_err(|e| IngestError::CorruptBundle(format!("oodle block decode failed: {e}")))?;
        Ok(out)
    }
}

const RESERVED_BYTES: usize = 4 * 4;

/// A parsed outer-bundle header plus a handle on its block payloads.
/// Field names and the read order match the Python `readf` calls
/// exactly, including the duplicated `uncompressed_size`/
/// `total_payload_size` fields the format carries for reasons the
/// original never needed to explain.
pub struct CompressedBundle<'a> {
    pub uncompressed_size: u32,
    pub total_payload_size: u32,
    pub head_payload_size: u32,
    pub first_file_encode: u32,
    pub unk10: u32,
    pub uncompressed_size2: u64,
    pub total_payload_size2: u64,
    pub block_count: u32,
    pub uncompressed_block_granularity: u32,
    pub block_sizes: Vec<u32>,
    data: &'a [u8],
    data_start: usize,
}

impl<'a> CompressedBundle<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self, IngestError> {
        let mut cur = std::io::Cursor::new(data);
        let uncompressed_size = read_u32(&mut cur)?;
        let total_payload_size = read_u32(&mut cur)?;
        let head_payload_size = read_u32(&mut cur)?;
        let first_file_encode = read_u32(&mut cur)?;
        let unk10 = read_u32(&mut cur)?;
        let uncompressed_size2 = read_u64(&mut cur)?;
        let total_payload_size2 = read_u64(&mut cur)?;
        let block_count = read_u32(&mut cur)?;
        let uncompressed_block_granularity = read_u32(&mut cur)?;

        let pos = cur.position() as usize;
        cur.set_position((pos + RESERVED_BYTES) as u64);

        let mut block_sizes = Vec::with_capacity(block_count as usize);
        for _ in 0..block_count {
            block_sizes.push(read_u32(&mut cur)?);
        }
        let data_start = cur.position() as usize;

        Ok(Self {
            uncompressed_size,
            total_payload_size,
            head_payload_size,
            first_file_encode,
            unk10,
            uncompressed_size2,
            total_payload_size2,
            block_count,
            uncompressed_block_granularity,
            block_sizes,
            data,
            data_start,
        })
    }

    /// Decompresses every block and concatenates them into the bundle's
    /// full uncompressed payload. The last block's uncompressed size is
    /// whatever remains after the earlier blocks consume
    /// `uncompressed_block_granularity` bytes each.
    pub fn decompress_all(&self, codec: &dyn BlockDecompressor) -> Result<Vec<u8>, IngestError> {
        let mut out = Vec::with_capacity(self.uncompressed_size as usize);
        let mut offset = self.data_start;
        for (i, &bsize) in self.block_sizes.iter().enumerate() {
            let usize_ = if i + 1 != self.block_sizes.len() {
                self.uncompressed_block_granularity as usize
            } else {
                (self.uncompressed_size as usize)
                    .saturating_sub(i * self.uncompressed_block_granularity as usize)
            };
            let end = offset
                .checked_add(bsize as usize)
                .ok_or_else(|| IngestError::CorruptBundle("block size overflow".into()))?;
            let block = self
                .data
                .get(offset..end)
                .ok_or_else(|| IngestError::CorruptBundle("block payload out of range".into()))?;
            out.extend(codec.decompress_block(block, usize_)?);
            offset = end;
        }
        Ok(out)
    }
}

fn read_u32(cur: &mut std::io::Cursor<&[u8]>) -> Result<u32, IngestError> {
    cur.read_u32::<LittleEndian>()
        .map_err(|e| IngestError::CorruptBundle(format!("truncated header: {e}")))
}

fn read_u64(cur: &mut std::io::Cursor<&[u8]>) -> Result<u64, IngestError> {
    cur.read_u64::<LittleEndian>()
        .map_err(|e| IngestError::CorruptBundle(format!("truncated header: {e}")))
}

/// An entry in the index bundle's bundle list.
#[derive(Debug, Clone)]
pub struct BundleRecord {
    pub name: String,
    pub uncompressed_size: u32,
}

impl BundleRecord {
    /// The loose-ingest path under which this bundle's own bytes are
    /// stored (`Bundles2/{name}.bundle.bin`).
    pub fn bin_path(&self) -> String {
        format!("Bundles2/{}.bundle.bin", self.name)
    }
}

/// An entry in the index bundle's file list.
#[derive(Debug, Clone, Copy)]
pub struct FileRecord {
    pub path_hash: u64,
    pub bundle_index: u32,
    pub file_offset: u32,
    pub file_size: u32,
}

/// An entry in the index bundle's path-representation list: one
/// sub-range of the path bytecode stream, keyed by the fingerprint of
/// the directory it roots.
#[derive(Debug, Clone, Copy)]
pub struct PathRep {
    pub hash: u64,
    pub offset: u32,
    pub size: u32,
    pub recursive_size: u32,
}

/// The fully parsed index bundle (`Bundles2/_.index.bin`, once
/// decompressed).
pub struct BundleIndex {
    pub bundles: Vec<BundleRecord>,
    pub files: Vec<FileRecord>,
    pub path_reps: Vec<PathRep>,
    pub path_comp: Vec<u8>,
}

impl BundleIndex {
    /// `index_data` is the raw, still-compressed bytes of
    /// `Bundles2/_.index.bin` -- itself an outer bundle whose payload is
    /// this structure's binary encoding.
    pub fn parse(index_data: &[u8], codec: &dyn BlockDecompressor) -> Result<Self, IngestError> {
        let outer = CompressedBundle::parse(index_data)?;
        let payload = outer.decompress_all(codec)?;
        let mut cur = std::io::Cursor::new(payload.as_slice());

        let bundle_count = read_u32(&mut cur)?;
        let mut bundles = Vec::with_capacity(bundle_count as usize);
        for _ in 0..bundle_count {
            let name_len = read_u32(&mut cur)? as usize;
            let mut name_buf = vec![0u8; name_len];
            cur.read_exact(&mut name_buf)
                .map_err(|e| IngestError::CorruptBundle(format!("truncated bundle name: {e}")))?;
            let name = String::from_utf8(name_buf)
                .map_err(|e| IngestError::CorruptBundle(format!("bundle name not UTF-8: {e}")))?;
            let uncompressed_size = read_u32(&mut cur)?;
            bundles.push(BundleRecord { name, uncompressed_size });
        }

        let file_count = read_u32(&mut cur)?;
        let mut files = Vec::with_capacity(file_count as usize);
        for _ in 0..file_count {
            let path_hash = cur
                .read_u64::<LittleEndian>()
                .map_err(|e| IngestError::CorruptBundle(format!("truncated file record: {e}")))?;
            let bundle_index = read_u32(&mut cur)?;
            let file_offset = read_u32(&mut cur)?;
            let file_size = read_u32(&mut cur)?;
            files.push(FileRecord {
                path_hash,
                bundle_index,
                file_offset,
                file_size,
            });
        }

        let path_rep_count = read_u32(&mut cur)?;
        let mut path_reps = Vec::with_capacity(path_rep_count as usize);
        for _ in 0..path_rep_count {
            let hash = cur
                .read_u64::<LittleEndian>()
                .map_err(|e| IngestError::CorruptBundle(format!("truncated path rep: {e}")))?;
            let offset = read_u32(&mut cur)?;
            let size = read_u32(&mut cur)?;
            let recursive_size = read_u32(&mut cur)?;
            path_reps.push(PathRep { hash, offset, size, recursive_size });
        }

        let mut path_comp = Vec::new();
        cur.read_to_end(&mut path_comp)
            .map_err(|e| IngestError::CorruptBundle(format!("truncated path bytecode: {e}")))?;

        Ok(Self { bundles, files, path_reps, path_comp })
    }
}

/// Cuts a NUL-terminated string out of `slice`, returning the string
/// bytes and the remainder past the terminator. Mirrors `_cut_ntmbs`.
fn cut_ntmbs(slice: &[u8]) -> Result<(&[u8], &[u8]), IngestError> {
    match slice.iter().position(|&b| b == 0) {
        Some(i) => Ok((&slice[..i], &slice[i + 1..])),
        None => Err(IngestError::CorruptBundle("unterminated path string".into())),
    }
}

/// Walks one path rep's slice of the bytecode stream and yields every
/// path it reconstructs. A command word of zero toggles between
/// "building a reusable base string" and "emitting a path"; any other
/// command is a NUL-terminated string fragment, optionally prefixed by
/// one of the bases accumulated so far (`bases[cmd - 1]`). Mirrors
/// `_generate_paths`.
fn generate_paths(rep: &PathRep, path_view: &[u8], recurse: bool) -> Result<Vec<String>, IngestError> {
    let slice_len = if recurse { rep.recursive_size } else { rep.size } as usize;
    let start = rep.offset as usize;
    let end = start
        .checked_add(slice_len)
        .ok_or_else(|| IngestError::CorruptBundle("path rep range overflow".into()))?;
    let mut slice = path_view
        .get(start..end)
        .ok_or_else(|| IngestError::CorruptBundle("path rep out of range".into()))?;

    let mut out = Vec::new();
    let mut base_phase = false;
    let mut bases: Vec<String> = Vec::new();

    while !slice.is_empty() {
        if slice.len() < 4 {
            return Err(IngestError::CorruptBundle("truncated path command word".into()));
        }
        let cmd = u32::from_le_bytes(slice[..4].try_into().unwrap());
        slice = &slice[4..];

        if cmd == 0 {
            base_phase = !base_phase;
            if base_phase {
                bases.clear();
            }
            continue;
        }

        let (raw, rest) = cut_ntmbs(slice)?;
        slice = rest;
        let frag = std::str::from_utf8(raw)
            .map_err(|e| IngestError::CorruptBundle(format!("path fragment not UTF-8: {e}")))?;

        let s = if (cmd as usize) <= bases.len() {
            format!("{}{}", bases[cmd as usize - 1], frag)
        } else {
            frag.to_string()
        };

        if base_phase {
            bases.push(s);
        } else {
            out.push(s);
        }
    }

    Ok(out)
}

/// Maps each inner-file path fingerprint to its reconstructed path and
/// to the fingerprint under the *other* hash algorithm (the index is
/// always written under one algorithm, but the loose-ingest phase may
/// have hashed `Bundles2/_.index.bin`'s sibling bundles under either).
pub struct PathHashTable {
    pub path_by_ihash: HashMap<u64, String>,
    pub ohash_by_ihash: HashMap<u64, u64>,
}

/// Builds the path table for one index bundle, auto-detecting whether
/// the index was produced by the legacy FNV-1a-64 hasher or the modern
/// MurmurHash2-64A hasher by checking which one's hash of the
/// well-known `Art` directory appears among the index's path reps.
/// Mirrors `_generate_path_hash_table`.
pub fn generate_path_hash_table(
    index: &BundleIndex,
    codec: &dyn BlockDecompressor,
) -> Result<PathHashTable, IngestError> {
    let path_bundle = CompressedBundle::parse(&index.path_comp)?;
    let path_data = path_bundle.decompress_all(codec)?;

    let rep_hashes: std::collections::HashSet<u64> = index.path_reps.iter().map(|r| r.hash).collect();

    let legacy = LegacyHasher;
    let modern = ModernHasher::default();

    enum Detected {
        LegacyWithModernOutput,
        Modern,
    }

    let detected = if rep_hashes.contains(&legacy.hash_dir("Art")) {
        Detected::LegacyWithModernOutput
    } else if rep_hashes.contains(&modern.hash_dir("Art")) {
        Detected::Modern
    } else {
        return Err(IngestError::UnknownHashAlgorithm);
    };

    let mut path_by_ihash = HashMap::new();
    let mut ohash_by_ihash = HashMap::new();

    for rep in &index.path_reps {
        for s in generate_paths(rep, &path_data, false)? {
            let (ihash, ohash) = match detected {
                Detected::LegacyWithModernOutput => (legacy.hash_file(&s), modern.hash_file(&s)),
                Detected::Modern => {
                    let h = modern.hash_file(&s);
                    (h, h)
                }
            };
            path_by_ihash.insert(ihash, s);
            ohash_by_ihash.insert(ihash, ohash);
        }
    }

    Ok(PathHashTable { path_by_ihash, ohash_by_ihash })
}
