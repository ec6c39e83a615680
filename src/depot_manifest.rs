// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The depot manifest sidecar: a zlib-deflated protobuf message
//! describing every file a depot contains, with a SHA-1 hint and size
//! for each.
//!
//! No `.proto`-generated bindings are used here -- the message shape is
//! one repeated field of four scalars, so a narrow hand-rolled
//! protobuf-wire-format reader replaces a full codegen pipeline.
//! `flate2` handles the zlib layer.

use std::io::Read;

use flate2::read::ZlibDecoder;

use crate::error::IngestError;

/// Directory entries carry this bit in `Flags` and are skipped.
const DIRECTORY_FLAG: u32 = 0x40;

#[derive(Debug, Clone)]
pub struct ManifestFile {
    pub file_name: String,
    pub file_hash: [u8; 20],
    pub total_size: u64,
    pub flags: u32,
}

impl ManifestFile {
    pub fn is_directory(&self) -> bool {
        self.flags & DIRECTORY_FLAG != 0
    }
}

#[derive(Debug, Clone, Default)]
pub struct DepotManifest {
    pub files: Vec<ManifestFile>,
}

/// One field read off the wire: `(field_number, value)`.
enum WireValue {
    Varint(u64),
    LengthDelimited(Vec<u8>),
}

struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn eof(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn read_varint(&mut self) -> Result<u64, IngestError> {
        let mut result = 0u64;
        let mut shift = 0;
        loop {
            let byte = *self
                .buf
                .get(self.pos)
                .ok_or_else(|| IngestError::CorruptBundle("truncated varint".into()))?;
            self.pos += 1;
            result |= u64::from(byte & 0x7F) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
            if shift >= 64 {
                return Err(IngestError::CorruptBundle("varint too long".into()));
            }
        }
        Ok(result)
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], IngestError> {
        let end = self
            .pos
            .checked_add(len)
            .ok_or_else(|| IngestError::CorruptBundle("length overflow".into()))?;
        let out = self
            .buf
            .get(self.pos..end)
            .ok_or_else(|| IngestError::CorruptBundle("truncated length-delimited field".into()))?;
        self.pos = end;
        Ok(out)
    }

    /// Reads one field's tag and value. Wire types 0 (varint) and 2
    /// (length-delimited) are all this schema uses.
    fn read_field(&mut self) -> Result<(u32, WireValue), IngestError> {
        let tag = self.read_varint()?;
        let field_number = (tag >> 3) as u32;
        let wire_type = tag & 0x7;
        let value = match wire_type {
            0 => WireValue::Varint(self.read_varint()?),
            2 => {
                let len = self.read_varint()? as usize;
                WireValue::LengthDelimited(self.read_bytes(len)?.to_vec())
            }
            other => {
                return Err(IngestError::CorruptBundle(format!(
                    "unsupported protobuf wire type {other}"
                )))
            }
        };
        Ok((field_number, value))
    }
}

/// Parses one `ManifestFile` message: field 1 = FileName (string),
/// field 2 = FileHash (bytes, 20), field 3 = TotalSize (varint), field
/// 4 = Flags (varint).
fn parse_manifest_file(data: &[u8]) -> Result<ManifestFile, IngestError> {
    let mut reader = WireReader::new(data);
    let mut file_name = None;
    let mut file_hash = None;
    let mut total_size = 0u64;
    let mut flags = 0u32;

    while !reader.eof() {
        let (field, value) = reader.read_field()?;
        match (field, value) {
            (1, WireValue::LengthDelimited(bytes)) => {
                file_name = Some(
                    String::from_utf8(bytes)
                        .map_err(|e| IngestError::CorruptBundle(format!("FileName not UTF-8: {e}")))?,
                );
            }
            (2, WireValue::LengthDelimited(bytes)) => {
                let arr: [u8; 20] = bytes
                    .try_into()
                    .map_err(|_| IngestError::CorruptBundle("FileHash is not 20 bytes".into()))?;
                file_hash = Some(arr);
            }
            (3, WireValue::Varint(v)) => total_size = v,
            (4, WireValue::Varint(v)) => flags = v as u32,
            _ => {} // unknown field: skip, forward compatible
        }
    }

    Ok(ManifestFile {
        file_name: file_name
            .ok_or_else(|| IngestError::CorruptBundle("ManifestFile missing FileName".into()))?,
        file_hash: file_hash
            .ok_or_else(|| IngestError::CorruptBundle("ManifestFile missing FileHash".into()))?,
        total_size,
        flags,
    })
}

/// Parses the top-level message: a single repeated field 1, each
/// instance a length-delimited `ManifestFile`.
fn parse_depot_manifest_message(data: &[u8]) -> Result<DepotManifest, IngestError> {
    let mut reader = WireReader::new(data);
    let mut files = Vec::new();
    while !reader.eof() {
        let (field, value) = reader.read_field()?;
        if field == 1 {
            if let WireValue::LengthDelimited(bytes) = value {
                files.push(parse_manifest_file(&bytes)?);
            }
        }
    }
    Ok(DepotManifest { files })
}

/// Inflates the zlib-deflated sidecar bytes and decodes the manifest.
/// Directory entries (flag `0x40`) are dropped from the result.
pub fn parse_sidecar(deflated: &[u8]) -> Result<DepotManifest, IngestError> {
    let mut decoder = ZlibDecoder::new(deflated);
    let mut raw = Vec::new();
    decoder
        .read_to_end(&mut raw)
        .map_err(|e| IngestError::CorruptBundle(format!("zlib inflate failed: {e}")))?;
    let mut manifest = parse_depot_manifest_message(&raw)?;
    manifest.files.retain(|f| !f.is_directory());
    Ok(manifest)
}
