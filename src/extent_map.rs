// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The extent memoization database (C2): a persistent
//! `(outer-bundle-digest, offset, length) -> inner-file-digest` cache,
//! a path dictionary, and the SHA-1 -> SHA-256 bridge.
//!
//! Backed by `sled`, which natively supports ordered byte-key
//! iteration -- the range scan over all extents for a bundle needs
//! exactly that, without emulating prefix scans with a secondary index.
//! Three logical tables map one-for-one onto three `sled::Tree`s.

use camino::Utf8Path;

use crate::digest::Sha256Digest;

const EXTENT_KEY_LEN: usize = 32 + 4 + 4;

fn extent_key(bundle_digest: &Sha256Digest, offset: u32, size: u32) -> [u8; EXTENT_KEY_LEN] {
    let mut key = [0u8; EXTENT_KEY_LEN];
    key[..32].copy_from_slice(&bundle_digest.0);
    key[32..36].copy_from_slice(&offset.to_le_bytes());
    key[36..40].copy_from_slice(&size.to_le_bytes());
    key
}

fn unpack_extent_key(key: &[u8]) -> ([u8; 32], u32, u32) {
    let mut bundle = [0u8; 32];
    bundle.copy_from_slice(&key[..32]);
    let offset = u32::from_le_bytes(key[32..36].try_into().unwrap());
    let size = u32::from_le_bytes(key[36..40].try_into().unwrap());
    (bundle, offset, size)
}

/// A single new extent-map observation, queued for a bulk put.
pub struct ExtentEntry {
    pub bundle_digest: Sha256Digest,
    pub offset: u32,
    pub size: u32,
    pub file_digest: Sha256Digest,
}

/// The persistent extent memoization database.
pub struct ExtentMap {
    extents: sled::Tree,
    paths: sled::Tree,
    sha1_bridge: sled::Tree,
    // Keeps the Db alive; flush() on drop isn't automatic for sled.
    _db: sled::Db,
}

impl ExtentMap {
    pub fn open(path: &Utf8Path) -> Result<Self, sled::Error> {
        let db = sled::open(path.as_std_path())?;
        let extents = db.open_tree("extents")?;
        let paths = db.open_tree("paths")?;
        let sha1_bridge = db.open_tree("sha1_bridge")?;
        Ok(Self {
            extents,
            paths,
            sha1_bridge,
            _db: db,
        })
    }

    /// In-memory instance for tests.
    #[cfg(test)]
    pub fn open_temporary() -> Result<Self, sled::Error> {
        let db = sled::Config::new().temporary(true).open()?;
        let extents = db.open_tree("extents")?;
        let paths = db.open_tree("paths")?;
        let sha1_bridge = db.open_tree("sha1_bridge")?;
        Ok(Self {
            extents,
            paths,
            sha1_bridge,
            _db: db,
        })
    }

    /// Point lookup of a single extent.
    pub fn get_extent(
        &self,
        bundle_digest: &Sha256Digest,
        offset: u32,
        size: u32,
    ) -> Result<Option<Sha256Digest>, sled::Error> {
        let key = extent_key(bundle_digest, offset, size);
        Ok(self
            .extents
            .get(key)?
            .map(|v| Sha256Digest(v.as_ref().try_into().expect("extent value is 32 bytes"))))
    }

    /// Range scan starting at the first key `>= bundle_digest || 0 || 0`
    /// and stopping at the first key whose leading 32 bytes differ from
    /// `bundle_digest`. Results are in ascending `(offset, size)` order
    /// because the key encodes them big-endian-of-significance (the
    /// bundle digest sorts first, then offset, then size, all compared
    /// byte-for-byte -- this matches LMDB's default key ordering, which
    /// the original relied on via `cur.set_range`).
    pub fn scan_extents_by_bundle(
        &self,
        bundle_digest: &Sha256Digest,
    ) -> Result<Vec<(u32, u32, Sha256Digest)>, sled::Error> {
        let start = extent_key(bundle_digest, 0, 0);
        let mut out = Vec::new();
        for item in self.extents.range(start.to_vec()..) {
            let (key, value) = item?;
            let (bundle, offset, size) = unpack_extent_key(&key);
            if bundle != bundle_digest.0 {
                break;
            }
            out.push((
                offset,
                size,
                Sha256Digest(value.as_ref().try_into().expect("extent value is 32 bytes")),
            ));
        }
        Ok(out)
    }

    /// Atomic bulk insert of new extent entries.
    pub fn put_extents(&self, batch: &[ExtentEntry]) -> Result<(), sled::Error> {
        let mut b = sled::Batch::default();
        for entry in batch {
            let key = extent_key(&entry.bundle_digest, entry.offset, entry.size);
            b.insert(&key, &entry.file_digest.0);
        }
        self.extents.apply_batch(b)
    }

    /// Looks up a path by its fingerprint.
    pub fn get_path(&self, fingerprint: u64) -> Result<Option<String>, sled::Error> {
        Ok(self
            .paths
            .get(fingerprint.to_le_bytes())?
            .map(|v| String::from_utf8_lossy(&v).into_owned()))
    }

    /// Idempotent bulk insert: an existing fingerprint is never
    /// overwritten (the path dictionary is "written once" per the data
    /// model).
    pub fn put_paths(&self, batch: &[(u64, String)]) -> Result<(), sled::Error> {
        for (fingerprint, path) in batch {
            let key = fingerprint.to_le_bytes();
            if self.paths.get(key)?.is_none() {
                self.paths.insert(key, path.as_bytes())?;
            }
        }
        Ok(())
    }

    /// Resolves a SHA-1 hint to a SHA-256 object digest, if the bridge
    /// has seen it before.
    pub fn get_sha256_from_sha1(
        &self,
        sha1: &crate::digest::Sha1Hint,
    ) -> Result<Option<Sha256Digest>, sled::Error> {
        Ok(self
            .sha1_bridge
            .get(sha1.0)?
            .map(|v| Sha256Digest(v.as_ref().try_into().expect("bridge value is 32 bytes"))))
    }

    /// Records a SHA-1 -> SHA-256 bridge entry. Monotonic: once written
    /// for a given SHA-1, the entry is never rewritten.
    pub fn put_sha256_from_sha1(
        &self,
        sha1: &crate::digest::Sha1Hint,
        sha256: &Sha256Digest,
    ) -> Result<(), sled::Error> {
        if self.sha1_bridge.get(sha1.0)?.is_none() {
            self.sha1_bridge.insert(sha1.0, &sha256.0)?;
        }
        Ok(())
    }

    pub fn flush(&self) -> Result<(), sled::Error> {
        self.extents.flush()?;
        self.paths.flush()?;
        self.sha1_bridge.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::{Sha1Hint, Sha256Digest};

    fn digest(tag: u8) -> Sha256Digest {
        let mut bytes = [0u8; 32];
        bytes[0] = tag;
        Sha256Digest(bytes)
    }

    #[test]
    fn extent_round_trips_and_scans_contiguously() {
        let em = ExtentMap::open_temporary().unwrap();
        let bundle_a = digest(1);
        let bundle_b = digest(2);

        em.put_extents(&[
            ExtentEntry {
                bundle_digest: bundle_a,
                offset: 10,
                size: 4,
                file_digest: digest(100),
            },
            ExtentEntry {
                bundle_digest: bundle_a,
                offset: 3,
                size: 4,
                file_digest: digest(101),
            },
            ExtentEntry {
                bundle_digest: bundle_b,
                offset: 0,
                size: 1,
                file_digest: digest(200),
            },
        ])
        .unwrap();

        assert_eq!(
            em.get_extent(&bundle_a, 3, 4).unwrap(),
            Some(digest(101))
        );
        assert_eq!(em.get_extent(&bundle_a, 3, 5).unwrap(), None);

        let scanned = em.scan_extents_by_bundle(&bundle_a).unwrap();
        assert_eq!(scanned.len(), 2);
        // ascending (offset, size) order
        assert_eq!(scanned[0].0, 3);
        assert_eq!(scanned[1].0, 10);
        assert!(scanned.iter().all(|(_, _, d)| d.0[0] == 100 || d.0[0] == 101));
    }

    #[test]
    fn path_put_is_idempotent() {
        let em = ExtentMap::open_temporary().unwrap();
        em.put_paths(&[(42, "Art/Foo".to_string())]).unwrap();
        em.put_paths(&[(42, "Art/Bar".to_string())]).unwrap();
        assert_eq!(em.get_path(42).unwrap().as_deref(), Some("Art/Foo"));
    }

    #[test]
    fn sha1_bridge_is_monotonic() {
        let em = ExtentMap::open_temporary().unwrap();
        let h1 = Sha1Hint::from_bytes(b"hello");
        em.put_sha256_from_sha1(&h1, &digest(9)).unwrap();
        em.put_sha256_from_sha1(&h1, &digest(10)).unwrap();
        assert_eq!(em.get_sha256_from_sha1(&h1).unwrap(), Some(digest(9)));
    }
}
