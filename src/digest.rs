// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Content digests: the 32-byte SHA-256 object address and the 20-byte
//! SHA-1 hint that depot manifests supply.

use hex::{FromHex, ToHex};
use ring::digest::{Context, Digest as RingDigest, SHA1_FOR_LEGACY_USE_ONLY, SHA256};
use serde::{Deserialize, Serialize};

/// A 32-byte SHA-256 object digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Sha256Digest(pub [u8; 32]);

impl Sha256Digest {
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut ctx = Context::new(&SHA256);
        ctx.update(data);
        Self::from_ring(ctx.finish())
    }

    fn from_ring(digest: RingDigest) -> Self {
        let mut out = [0u8; 32];
        out.copy_from_slice(digest.as_ref());
        Self(out)
    }

    pub fn to_hex(&self) -> String {
        self.0.encode_hex::<String>()
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = <[u8; 32]>::from_hex(s)?;
        Ok(Self(bytes))
    }

    /// Key prefix used for the filesystem backend's fan-out directory
    /// (`data/{hex[0:2]}/{hex}.bin`, §6.1).
    pub fn fanout_prefix(&self) -> String {
        self.to_hex()[..2].to_string()
    }
}

impl std::fmt::Display for Sha256Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl TryFrom<String> for Sha256Digest {
    type Error = hex::FromHexError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_hex(&s)
    }
}

impl From<Sha256Digest> for String {
    fn from(d: Sha256Digest) -> Self {
        d.to_hex()
    }
}

/// A 20-byte SHA-1 hint, as supplied by a depot manifest sidecar. Never
/// used for object addressing, only as a bridge key into the SHA-1 →
/// SHA-256 table (C2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Sha1Hint(pub [u8; 20]);

impl Sha1Hint {
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut ctx = Context::new(&SHA1_FOR_LEGACY_USE_ONLY);
        ctx.update(data);
        let digest = ctx.finish();
        let mut out = [0u8; 20];
        out.copy_from_slice(digest.as_ref());
        Self(out)
    }

    pub fn from_slice(data: &[u8]) -> Option<Self> {
        if data.len() != 20 {
            return None;
        }
        let mut out = [0u8; 20];
        out.copy_from_slice(data);
        Some(Self(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_digest_matches_known_vector() {
        let d = Sha256Digest::from_bytes(b"hello");
        assert_eq!(
            d.to_hex(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn hex_round_trips() {
        let d = Sha256Digest::from_bytes(b"hello");
        let hex = d.to_hex();
        assert_eq!(Sha256Digest::from_hex(&hex).unwrap(), d);
    }

    #[test]
    fn fanout_prefix_is_first_two_hex_chars() {
        let d = Sha256Digest::from_bytes(b"hello");
        assert_eq!(d.fanout_prefix(), d.to_hex()[..2].to_string());
    }
}
