// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The GGPK legacy pack parser (C5).
//!
//! A GGPK pack is a flat stream of variable-length chunks (`GGPK`,
//! `PDIR`, `FILE`, `FREE`). One linear scan builds a directory table, a
//! file table, and a child-to-parent offset map; paths are then
//! reconstructed by walking a file up to the root.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};

use byteorder::{LittleEndian, ReadBytesExt};

use crate::error::IngestError;

fn chunk_tag(s: &[u8; 4]) -> u32 {
    u32::from_le_bytes(*s)
}

fn ggpk_tag() -> u32 {
    chunk_tag(b"GGPK")
}
fn pdir_tag() -> u32 {
    chunk_tag(b"PDIR")
}
fn file_tag() -> u32 {
    chunk_tag(b"FILE")
}
fn free_tag() -> u32 {
    chunk_tag(b"FREE")
}

#[derive(Debug, Clone)]
pub struct PackDir {
    pub name: String,
    pub sha256: [u8; 32],
    pub children: Vec<u64>,
}

#[derive(Debug, Clone)]
pub struct PackFile {
    pub name: String,
    pub sha256: [u8; 32],
    pub data_offset: u64,
    pub data_size: u64,
}

/// A fully indexed GGPK pack, keyed by each record's chunk offset.
pub struct PackSource<R> {
    reader: R,
    dirs: HashMap<u64, PackDir>,
    files: HashMap<u64, PackFile>,
    parents: HashMap<u64, u64>,
    root_offset: u64,
}

fn read_utf16le_name(buf: &[u8]) -> Result<String, IngestError> {
    // name_len counts UTF-16 code units including a trailing NUL the
    // original always writes and strips (`[:-2]`).
    if buf.len() < 2 {
        return Err(IngestError::CorruptPack("truncated name".into()));
    }
    let units: Vec<u16> = buf[..buf.len() - 2]
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16(&units).map_err(|e| IngestError::CorruptPack(format!("name not UTF-16: {e}")))
}

impl<R: Read + Seek> PackSource<R> {
    pub fn open(mut reader: R) -> Result<Self, IngestError> {
        let pack_size = reader.seek(SeekFrom::End(0))?;
        reader.seek(SeekFrom::Start(0))?;

        let _rec_len = reader.read_u32::<LittleEndian>()?;
        let tag = reader.read_u32::<LittleEndian>()?;
        let version = reader.read_u32::<LittleEndian>()?;
        let child0 = reader.read_u64::<LittleEndian>()?;
        let child1 = reader.read_u64::<LittleEndian>()?;
        if tag != ggpk_tag() || !(version == 2 || version == 3) {
            return Err(IngestError::CorruptPack("invalid GGPK chunk".into()));
        }

        let mut dirs = HashMap::new();
        let mut files = HashMap::new();
        let mut parents = HashMap::new();
        let mut root_offset = 0u64;

        let mut pack_offset = reader.stream_position()?;
        while pack_offset < pack_size {
            let rec_len = reader.read_u32::<LittleEndian>()?;
            let tag = reader.read_u32::<LittleEndian>()?;
            let next_offset = pack_offset + rec_len as u64;

            if tag == pdir_tag() {
                if pack_offset == child0 || pack_offset == child1 {
                    root_offset = pack_offset;
                }
                let name_len = reader.read_u32::<LittleEndian>()?;
                let child_count = reader.read_u32::<LittleEndian>()?;
                let mut sha256 = [0u8; 32];
                reader.read_exact(&mut sha256)?;
                let mut name_buf = vec![0u8; name_len as usize * 2];
                reader.read_exact(&mut name_buf)?;
                let name = read_utf16le_name(&name_buf)?;

                let mut children = Vec::with_capacity(child_count as usize);
                for _ in 0..child_count {
                    let _name_hash = reader.read_u32::<LittleEndian>()?;
                    let child_offset = reader.read_u64::<LittleEndian>()?;
                    children.push(child_offset);
                    parents.insert(child_offset, pack_offset);
                }
                dirs.insert(pack_offset, PackDir { name, sha256, children });
            } else if tag == file_tag() {
                let name_len = reader.read_u32::<LittleEndian>()?;
                let mut sha256 = [0u8; 32];
                reader.read_exact(&mut sha256)?;
                let mut name_buf = vec![0u8; name_len as usize * 2];
                reader.read_exact(&mut name_buf)?;
                let name = read_utf16le_name(&name_buf)?;
                let data_offset = reader.stream_position()?;
                let data_size = rec_len as u64 - (data_offset - pack_offset);
                files.insert(
                    pack_offset,
                    PackFile { name, sha256, data_offset, data_size },
                );
            } else if tag == free_tag() {
                // unallocated space; nothing to record
            } else {
                return Err(IngestError::CorruptPack(format!(
                    "invalid chunk tag at offset {pack_offset}"
                )));
            }

            reader.seek(SeekFrom::Start(next_offset))?;
            pack_offset = next_offset;
        }

        Ok(Self { reader, dirs, files, parents, root_offset })
    }

    /// Reconstructs a file's full path by walking parent pointers up to
    /// the root directory. Returns `None` if a link in the chain is
    /// missing (an orphaned record the pack never meant to expose).
    pub fn file_path(&self, offset: u64) -> Option<String> {
        let file = self.files.get(&offset)?;
        let mut segments = vec![file.name.clone()];
        let mut cursor = offset;
        let mut dir_offset;
        loop {
            dir_offset = *self.parents.get(&cursor)?;
            if dir_offset == self.root_offset {
                break;
            }
            let dir = self.dirs.get(&dir_offset)?;
            segments.push(dir.name.clone());
            cursor = dir_offset;
        }
        segments.reverse();
        Some(segments.join("/"))
    }

    pub fn file_data(&mut self, offset: u64) -> Result<Vec<u8>, IngestError> {
        let file = self
            .files
            .get(&offset)
            .ok_or_else(|| IngestError::CorruptPack(format!("no file at offset {offset}")))?;
        let mut buf = vec![0u8; file.data_size as usize];
        self.reader.seek(SeekFrom::Start(file.data_offset))?;
        self.reader.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn files(&self) -> impl Iterator<Item = (&u64, &PackFile)> {
        self.files.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn utf16le_name(s: &str) -> Vec<u8> {
        let mut out: Vec<u8> = s.encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
        out.extend([0u8, 0u8]);
        out
    }

    /// Builds a minimal pack: GGPK header -> one PDIR (root, one child)
    /// -> one FILE under it.
    fn build_pack() -> Vec<u8> {
        let mut buf = Vec::new();
        let header_len = 28u32;
        let ggpk_offset = 0u64;
        let pdir_offset = ggpk_offset + header_len as u64;

        // placeholder for child0 computed after we know the PDIR offset
        buf.extend(header_len.to_le_bytes());
        buf.extend(ggpk_tag().to_le_bytes());
        buf.extend(3u32.to_le_bytes()); // version
        buf.extend(pdir_offset.to_le_bytes()); // child0
        buf.extend(0u64.to_le_bytes()); // child1

        let dir_name = utf16le_name("");
        let file_name = utf16le_name("foo.txt");

        // file chunk comes right after the PDIR chunk.
        let pdir_fixed_len = 4 + 4 + 4 + 4 + 32 + dir_name.len() as u32 + (4 + 8); // rec_len+tag+name_len+child_count+sha256+name+one child entry
        let file_offset = pdir_offset + pdir_fixed_len as u64;

        // PDIR chunk
        buf.extend(pdir_fixed_len.to_le_bytes());
        buf.extend(pdir_tag().to_le_bytes());
        buf.extend((dir_name.len() as u32 / 2).to_le_bytes());
        buf.extend(1u32.to_le_bytes()); // child_count
        buf.extend([0u8; 32]); // sha256
        buf.extend_from_slice(&dir_name);
        buf.extend(0u32.to_le_bytes()); // name_hash
        buf.extend(file_offset.to_le_bytes()); // child_offset

        // FILE chunk
        let file_payload = b"hello";
        let file_rec_len = 4 + 4 + 4 + 32 + file_name.len() as u32 + file_payload.len() as u32;
        buf.extend(file_rec_len.to_le_bytes());
        buf.extend(file_tag().to_le_bytes());
        buf.extend((file_name.len() as u32 / 2).to_le_bytes());
        buf.extend([0u8; 32]); // sha256
        buf.extend_from_slice(&file_name);
        buf.extend_from_slice(file_payload);

        buf
    }

    #[test]
    fn parses_root_dir_and_single_file_path() {
        let data = build_pack();
        let mut pack = PackSource::open(Cursor::new(data)).unwrap();
        let (&offset, _) = pack.files().next().unwrap();
        assert_eq!(pack.file_path(offset).as_deref(), Some("foo.txt"));
        assert_eq!(pack.file_data(offset).unwrap(), b"hello".to_vec());
    }
}
