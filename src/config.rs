// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Process configuration: the on-disk root layout and artifact store
//! backend selection, parsed with the usual `toml` + `thiserror`
//! convention. Wiring this struct up to a CLI is left to callers.

use std::path::Path;

use camino::Utf8PathBuf;
use serde::Deserialize;
use thiserror::Error;

/// Selects which [`crate::store::ArtifactStore`] backend an ingest run
/// uses.
#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreBackend {
    /// The filesystem backend, rooted at `root`.
    Filesystem,
    /// The relational backend, backed by a SQLite database file.
    Relational { database_path: Utf8PathBuf },
}

/// Top-level configuration for an ingest run.
#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    /// Root directory for the filesystem backend's `data/`, `index/`,
    /// and `state/` trees, and for the extent map's embedded database.
    pub root: Utf8PathBuf,

    /// Which artifact store backend to use.
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,

    /// Optional external directory searched for depot manifest
    /// sidecars before falling back to the source's own
    /// `.DepotDownloader/` convention.
    pub external_manifest_dir: Option<Utf8PathBuf>,
}

fn default_backend() -> StoreBackend {
    StoreBackend::Filesystem
}

impl Config {
    /// The extent map's embedded database directory, rooted under
    /// `state/` as `bundled_extent_map.mdb`.
    pub fn extent_map_path(&self) -> Utf8PathBuf {
        self.root.join("state").join("bundled_extent_map.mdb")
    }
}

/// Errors returned when parsing process configuration.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("cannot parse toml: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parses a path in the filesystem into a [`Config`].
pub fn parse<P: AsRef<Path>>(path: P) -> Result<Config, ParseError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let cfg = toml::from_str::<Config>(&contents)?;
    Ok(cfg)
}
