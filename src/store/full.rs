//! Full stores: the authoritative accumulated state of one store module,
//! checkpointed at aligned block boundaries.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::block::BlockRange;
use crate::error::{EngineError, EngineResult};
use crate::manifest::UpdatePolicy;
use crate::storage::filename::full_kv_filename;
use crate::storage::objstore::{decode_artifact, encode_artifact, ObjectStore};
use crate::store::base::BaseStore;
use crate::store::partial::PartialSnapshotPayload;
use crate::store::value;

#[derive(Debug, Serialize, Deserialize)]
pub struct FullSnapshotPayload {
    pub module_hash: String,
    pub range: BlockRange,
    pub entries: Vec<(Vec<u8>, Vec<u8>)>,
}

pub struct FullStore {
    base: BaseStore,
    store: Arc<dyn ObjectStore>,
    compress: bool,
    /// Exclusive end of the snapshot history folded into the live state.
    covered_through: u64,
}

impl FullStore {
    pub fn new(base: BaseStore, store: Arc<dyn ObjectStore>, compress: bool) -> Self {
        let covered_through = base.initial_block();
        Self {
            base,
            store,
            compress,
            covered_through,
        }
    }

    pub fn base(&self) -> &BaseStore {
        &self.base
    }

    pub fn base_mut(&mut self) -> &mut BaseStore {
        &mut self.base
    }

    pub fn covered_through(&self) -> u64 {
        self.covered_through
    }

    /// Loads the full snapshot ending at `end_block` into the live state.
    pub fn load(&mut self, end_block: u64) -> EngineResult<()> {
        let range = BlockRange::new(self.base.initial_block(), end_block);
        let filename = full_kv_filename(&range);

        let raw = self
            .store
            .read(&filename)?
            .ok_or_else(|| EngineError::MissingSnapshot {
                module: self.base.name().to_string(),
                block: end_block,
            })?;
        let payload: FullSnapshotPayload =
            bincode::deserialize(&decode_artifact(&filename, &raw)?)?;

        if payload.range != range {
            return Err(EngineError::ArtifactCorrupted {
                name: filename,
                reason: "snapshot range does not match its filename",
            });
        }

        self.base.replace_entries(payload.entries);
        self.covered_through = end_block;
        tracing::debug!(
            module = %self.base.name(),
            end_block,
            keys = self.base.len(),
            "full store loaded"
        );
        Ok(())
    }

    /// Writes the current state as the full snapshot ending at `end_block`.
    pub fn save(&mut self, end_block: u64) -> EngineResult<BlockRange> {
        let range = BlockRange::new(self.base.initial_block(), end_block);
        let payload = FullSnapshotPayload {
            module_hash: self.base.module_hash().to_string(),
            range,
            entries: self.base.sorted_entries(),
        };
        let encoded = encode_artifact(&bincode::serialize(&payload)?, self.compress)?;
        self.store.write(&full_kv_filename(&range), &encoded)?;
        self.covered_through = end_block;
        tracing::debug!(
            module = %self.base.name(),
            end_block,
            keys = self.base.len(),
            "full store saved"
        );
        Ok(range)
    }

    /// Folds a partial window into this store. Prefix deletions recorded by
    /// the window are applied first (they target keys this window never
    /// saw), then the window's net state composes by the module's update
    /// policy. The result is identical to having processed the window's
    /// blocks linearly on top of this store.
    pub fn merge(&mut self, partial: &PartialSnapshotPayload) -> EngineResult<()> {
        if partial.range.start_block != self.covered_through {
            return Err(EngineError::StoreMergeMismatch {
                module: self.base.name().to_string(),
                range: partial.range,
                covered: self.covered_through,
            });
        }

        for prefix in &partial.deleted_prefixes {
            for key in self.base.keys_with_prefix(prefix) {
                self.base.remove_raw(&key);
            }
        }

        let policy = self.base.update_policy();
        for (key, window_value) in &partial.entries {
            let existing = self.base.get_last(key).map(<[u8]>::to_vec);
            let merged = match (policy, existing) {
                (UpdatePolicy::Set, _) => window_value.clone(),
                (UpdatePolicy::SetIfNotExists, Some(_)) => continue,
                (UpdatePolicy::SetIfNotExists, None) => window_value.clone(),
                (UpdatePolicy::Add, existing) => {
                    value::add(self.base.value_type(), existing.as_deref(), window_value)
                        .map_err(|source| EngineError::ValueCoercion {
                            module: self.base.name().to_string(),
                            source,
                        })?
                }
                (UpdatePolicy::Min, Some(existing)) => {
                    let ordering =
                        value::compare(self.base.value_type(), window_value, &existing).map_err(
                            |source| EngineError::ValueCoercion {
                                module: self.base.name().to_string(),
                                source,
                            },
                        )?;
                    if ordering == std::cmp::Ordering::Less {
                        window_value.clone()
                    } else {
                        existing
                    }
                }
                (UpdatePolicy::Min, None) => window_value.clone(),
                (UpdatePolicy::Max, Some(existing)) => {
                    let ordering =
                        value::compare(self.base.value_type(), window_value, &existing).map_err(
                            |source| EngineError::ValueCoercion {
                                module: self.base.name().to_string(),
                                source,
                            },
                        )?;
                    if ordering == std::cmp::Ordering::Greater {
                        window_value.clone()
                    } else {
                        existing
                    }
                }
                (UpdatePolicy::Max, None) => window_value.clone(),
                (UpdatePolicy::Append, existing) => {
                    let mut merged = existing.unwrap_or_default();
                    merged.extend_from_slice(window_value);
                    merged
                }
            };
            self.base.upsert_raw(key, merged)?;
        }

        self.covered_through = partial.range.exclusive_end_block;
        tracing::debug!(
            module = %self.base.name(),
            range = %partial.range,
            "partial merged into full store"
        );
        Ok(())
    }
}
