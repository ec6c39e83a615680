// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The two-phase ingest engine: loose ingest (C7) walks a `Source` and
//! stores every externally-visible file under its SHA-256; bundled
//! ingest (C8) reads the loose index's bundle container and expands it
//! into its inner files.

pub mod bundled;
pub mod loose;

use crate::digest::Sha256Digest;

/// Hashes owned bytes on the blocking thread pool, returning the bytes
/// back alongside the digest so the caller doesn't need a second copy
/// to both hash and store the same payload.
async fn hash_bytes(data: Vec<u8>) -> (Vec<u8>, Sha256Digest) {
    tokio::task::spawn_blocking(move || {
        let digest = Sha256Digest::from_bytes(&data);
        (data, digest)
    })
    .await
    .expect("hashing task panicked")
}
