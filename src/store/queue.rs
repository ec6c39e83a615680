// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The batching queue (C4): accumulates pending writes and flushes via
//! a bulk missing-check followed by a bulk insert.

use std::collections::HashMap;

use crate::digest::Sha256Digest;
use crate::error::IngestError;
use crate::source::SourceBytes;

use super::ArtifactStore;

/// Accumulates `(digest, bytes)` pairs and flushes them against a
/// store once a size or count budget is crossed, or when forced. Only
/// digests the store reports missing are ever uploaded.
pub struct BatchQueue<'s, S: ArtifactStore> {
    store: &'s S,
    size_budget: Option<u64>,
    count_budget: Option<u64>,
    size_acc: u64,
    objects: HashMap<Sha256Digest, SourceBytes>,
}

impl<'s, S: ArtifactStore> BatchQueue<'s, S> {
    pub fn new(store: &'s S, size_budget: Option<u64>, count_budget: Option<u64>) -> Self {
        Self {
            store,
            size_budget,
            count_budget,
            size_acc: 0,
            objects: HashMap::new(),
        }
    }

    /// Queues one object for upload, using its accurate size for
    /// budget accounting even though the bytes themselves may already
    /// be resident.
    pub fn store_one(&mut self, digest: Sha256Digest, size: u64, data: SourceBytes) -> Result<(), IngestError> {
        self.size_acc += size;
        self.objects.insert(digest, data);
        self.flush(false)
    }

    /// Flushes unconditionally, consuming whatever remains queued.
    pub fn flush_force(&mut self) -> Result<(), IngestError> {
        self.flush(true)
    }

    fn flush(&mut self, force: bool) -> Result<(), IngestError> {
        let above_size = self.size_budget.map_or(false, |b| self.size_acc >= b);
        let above_count = self.count_budget.map_or(false, |b| self.objects.len() as u64 >= b);
        if !(force || above_size || above_count) || self.objects.is_empty() {
            return Ok(());
        }

        let digests: Vec<Sha256Digest> = self.objects.keys().copied().collect();
        let missing = self.store.list_missing_objects(&digests)?;

        {
            let mut bulk = self.store.write_data_bulk()?;
            for digest in &missing {
                if let Some(data) = self.objects.remove(digest) {
                    let bytes = data.materialize()?;
                    bulk.store(*digest, &bytes)?;
                }
            }
        }

        self.objects.clear();
        self.size_acc = 0;
        Ok(())
    }
}
