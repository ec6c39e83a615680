// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The relational artifact store backend, over `rusqlite`/SQLite.
//!
//! The bulk-missing-object check populates a temporary table with the
//! candidate digests, then runs an anti-join against it inside one
//! transaction, rather than querying each digest individually.

use std::collections::HashSet;
use std::io::{Read, Write};
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use super::{ArtifactStore, BulkWriter, DepotFact, IndexKind, IndexRecord, IndexWriter};
use crate::digest::Sha256Digest;
use crate::error::IngestError;

pub struct RelationalStore {
    conn: Mutex<Connection>,
}

impl RelationalStore {
    pub fn open(database_path: &camino::Utf8Path) -> Result<Self, IngestError> {
        let conn = Connection::open(database_path.as_std_path())?;
        Self::init_schema(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, IngestError> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn init_schema(conn: &Connection) -> Result<(), IngestError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS data (
                content_hash BLOB PRIMARY KEY NOT NULL,
                data BLOB NOT NULL,
                compression TEXT
            );
            CREATE TABLE IF NOT EXISTS idx (
                gid INTEGER NOT NULL,
                kind TEXT NOT NULL,
                data BLOB NOT NULL,
                compression TEXT NOT NULL,
                PRIMARY KEY (gid, kind)
            );
            CREATE TABLE IF NOT EXISTS depot_fact (
                depot INTEGER NOT NULL,
                gid INTEGER NOT NULL,
                fact TEXT NOT NULL,
                PRIMARY KEY (depot, gid, fact)
            );
            "#,
        )?;
        Ok(())
    }

    fn compress_for_storage(data: &[u8]) -> (Vec<u8>, Option<&'static str>) {
        let compressed = zstd::encode_all(data, 0).unwrap_or_else(|_| data.to_vec());
        if compressed.len() < data.len() {
            (compressed, Some("zstd"))
        } else {
            (data.to_vec(), None)
        }
    }

    fn decompress_stored(data: Vec<u8>, compression: Option<String>) -> Result<Vec<u8>, IngestError> {
        match compression.as_deref() {
            None => Ok(data),
            Some("zstd") => zstd::decode_all(data.as_slice())
                .map_err(|e| IngestError::IndexReadFailure(e.to_string())),
            Some(other) => Err(IngestError::IndexReadFailure(format!(
                "unknown compression tag {other}"
            ))),
        }
    }
}

struct RelationalIndexWriter<'a> {
    store: &'a RelationalStore,
    manifest: u64,
    kind: IndexKind,
    buf: zstd::Encoder<'static, Vec<u8>>,
}

impl<'a> IndexWriter for RelationalIndexWriter<'a> {
    fn write_row(&mut self, row: &IndexRecord) -> Result<(), IngestError> {
        serde_json::to_writer(&mut self.buf, row)
            .map_err(|e| IngestError::IndexReadFailure(e.to_string()))?;
        self.buf.write_all(b"\n")?;
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<(), IngestError> {
        let compressed = self
            .buf
            .finish()
            .map_err(|e| IngestError::IndexReadFailure(e.to_string()))?;
        let conn = self.store.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO idx (gid, kind, data, compression) VALUES (?1, ?2, ?3, 'zstd')
             ON CONFLICT (gid, kind) DO UPDATE SET data = excluded.data, compression = excluded.compression",
            params![self.manifest as i64, self.kind.as_str(), compressed],
        )?;
        Ok(())
    }
}

struct SqlBulkWriter<'a> {
    store: &'a RelationalStore,
}

impl<'a> BulkWriter for SqlBulkWriter<'a> {
    fn store(&mut self, digest: Sha256Digest, data: &[u8]) -> Result<(), IngestError> {
        let (stored, compression) = RelationalStore::compress_for_storage(data);
        let conn = self.store.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO data (content_hash, data, compression) VALUES (?1, ?2, ?3)
             ON CONFLICT DO NOTHING",
            params![digest.0.to_vec(), stored, compression],
        )?;
        Ok(())
    }
}

impl ArtifactStore for RelationalStore {
    fn index_writer(
        &self,
        _depot: u32,
        manifest: u64,
        kind: IndexKind,
    ) -> Result<Box<dyn IndexWriter + '_>, IngestError> {
        let buf = zstd::Encoder::new(Vec::new(), 0)?;
        Ok(Box::new(RelationalIndexWriter { store: self, manifest, kind, buf }))
    }

    fn index_reader(
        &self,
        _depot: u32,
        manifest: u64,
        kind: IndexKind,
    ) -> Result<Box<dyn Iterator<Item = Result<IndexRecord, IngestError>>>, IngestError> {
        let conn = self.conn.lock().unwrap();
        let data: Vec<u8> = conn
            .query_row(
                "SELECT data FROM idx WHERE gid = ?1 AND kind = ?2",
                params![manifest as i64, kind.as_str()],
                |r| r.get(0),
            )
            .map_err(|e| IngestError::IndexReadFailure(e.to_string()))?;
        drop(conn);

        let mut decoder = zstd::Decoder::new(data.as_slice())
            .map_err(|e| IngestError::IndexReadFailure(e.to_string()))?;
        let mut raw = String::new();
        decoder
            .read_to_string(&mut raw)
            .map_err(|e| IngestError::IndexReadFailure(e.to_string()))?;

        let rows: Result<Vec<IndexRecord>, IngestError> = raw
            .lines()
            .filter(|l| !l.is_empty())
            .map(|l| {
                serde_json::from_str(l).map_err(|e| IngestError::IndexReadFailure(e.to_string()))
            })
            .collect();
        Ok(Box::new(rows?.into_iter().map(Ok)))
    }

    fn list_missing_objects(
        &self,
        digests: &[Sha256Digest],
    ) -> Result<HashSet<Sha256Digest>, IngestError> {
        if digests.is_empty() {
            return Ok(HashSet::new());
        }
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute_batch("CREATE TEMP TABLE IF NOT EXISTS candidates (addr BLOB PRIMARY KEY)")?;
        tx.execute("DELETE FROM candidates", [])?;
        {
            let mut stmt = tx.prepare("INSERT INTO candidates (addr) VALUES (?1)")?;
            for digest in digests {
                stmt.execute(params![digest.0.to_vec()])?;
            }
        }
        let mut missing = HashSet::new();
        {
            let mut stmt = tx.prepare(
                "SELECT addr FROM candidates
                 WHERE NOT EXISTS (SELECT 1 FROM data WHERE content_hash = candidates.addr)",
            )?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let bytes: Vec<u8> = row.get(0)?;
                let arr: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| IngestError::IndexReadFailure("malformed digest in candidates".into()))?;
                missing.insert(Sha256Digest(arr));
            }
        }
        tx.execute("DROP TABLE candidates", []).ok();
        tx.commit()?;
        Ok(missing)
    }

    fn write_data_bulk(&self) -> Result<Box<dyn BulkWriter + '_>, IngestError> {
        Ok(Box::new(SqlBulkWriter { store: self }))
    }

    fn read_data(&self, digest: &Sha256Digest) -> Result<Option<Vec<u8>>, IngestError> {
        let conn = self.conn.lock().unwrap();
        let row: Option<(Vec<u8>, Option<String>)> = conn
            .query_row(
                "SELECT data, compression FROM data WHERE content_hash = ?1",
                params![digest.0.to_vec()],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        match row {
            None => Ok(None),
            Some((data, compression)) => Ok(Some(Self::decompress_stored(data, compression)?)),
        }
    }

    fn has_depot_fact(&self, depot: u32, manifest: u64, fact: DepotFact) -> Result<bool, IngestError> {
        let conn = self.conn.lock().unwrap();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM depot_fact WHERE depot = ?1 AND gid = ?2 AND fact = ?3",
                params![depot, manifest as i64, fact.as_str()],
                |r| r.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn set_depot_fact(&self, depot: u32, manifest: u64, fact: DepotFact) -> Result<(), IngestError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO depot_fact (depot, gid, fact) VALUES (?1, ?2, ?3) ON CONFLICT DO NOTHING",
            params![depot, manifest as i64, fact.as_str()],
        )?;
        Ok(())
    }

    fn unset_depot_fact(&self, depot: u32, manifest: u64, fact: DepotFact) -> Result<(), IngestError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM depot_fact WHERE depot = ?1 AND gid = ?2 AND fact = ?3",
            params![depot, manifest as i64, fact.as_str()],
        )?;
        Ok(())
    }
}
