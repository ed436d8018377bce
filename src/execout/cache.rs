//! Per-module output caches: one file per aligned range, mapping block ids
//! to the module's serialized output at that block.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::block::{next_boundary, BlockRange};
use crate::error::EngineResult;
use crate::storage::filename::{output_cache_filename, parse_output_filename};
use crate::storage::objstore::{decode_artifact, encode_artifact, ObjectStore};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheItem {
    pub block_num: u64,
    pub payload: Vec<u8>,
}

struct CacheState {
    kv: hashbrown::HashMap<String, CacheItem>,
    current_range: BlockRange,
    /// A cache loaded from an existing file is sealed: writes are ignored
    /// so a completed range is never overwritten.
    is_new: bool,
}

pub struct OutputCache {
    module_name: String,
    store: Arc<dyn ObjectStore>,
    save_interval: u64,
    compress: bool,
    state: RwLock<CacheState>,
}

impl OutputCache {
    pub fn new(
        module_name: impl Into<String>,
        store: Arc<dyn ObjectStore>,
        save_interval: u64,
        compress: bool,
    ) -> Self {
        Self {
            module_name: module_name.into(),
            store,
            save_interval,
            compress,
            state: RwLock::new(CacheState {
                kv: hashbrown::HashMap::new(),
                current_range: BlockRange::new(0, 0),
                is_new: true,
            }),
        }
    }

    pub fn current_range(&self) -> BlockRange {
        self.state.read().current_range
    }

    /// Opens the range containing `at_block`, loading an existing file when
    /// one covers it, or starting a fresh range otherwise.
    pub fn load_at(&self, at_block: u64) -> EngineResult<()> {
        let mut found: Option<BlockRange> = None;
        for name in self.store.list()? {
            let Some(range) = parse_output_filename(&name) else {
                continue;
            };
            if range.contains(at_block)
                && found.map_or(true, |f| range.exclusive_end_block > f.exclusive_end_block)
            {
                found = Some(range);
            }
        }

        let mut state = self.state.write();
        match found {
            Some(range) => {
                let filename = output_cache_filename(&range);
                let raw = self.store.read(&filename)?.ok_or_else(|| {
                    crate::error::EngineError::ArtifactCorrupted {
                        name: filename.clone(),
                        reason: "file listed but unreadable",
                    }
                })?;
                let items: Vec<(String, CacheItem)> =
                    bincode::deserialize(&decode_artifact(&filename, &raw)?)?;
                state.kv = items.into_iter().collect();
                state.current_range = range;
                state.is_new = false;
                tracing::debug!(
                    module = %self.module_name,
                    range = %range,
                    outputs = state.kv.len(),
                    "output cache loaded"
                );
            }
            None => {
                state.kv = hashbrown::HashMap::new();
                state.current_range =
                    BlockRange::new(at_block, next_boundary(at_block, self.save_interval));
                state.is_new = true;
            }
        }
        Ok(())
    }

    pub fn set(&self, block_id: &str, block_num: u64, payload: Vec<u8>) {
        let mut state = self.state.write();
        if !state.is_new {
            tracing::warn!(
                module = %self.module_name,
                block_num,
                "ignoring write to an already sealed output range"
            );
            return;
        }
        state.kv.insert(
            block_id.to_string(),
            CacheItem { block_num, payload },
        );
    }

    pub fn get(&self, block_id: &str) -> Option<Vec<u8>> {
        self.state
            .read()
            .kv
            .get(block_id)
            .map(|item| item.payload.clone())
    }

    /// Rotates ranges until the one containing `block_num` is open.
    pub fn update(&self, block_num: u64) -> EngineResult<()> {
        loop {
            let current = self.state.read().current_range;
            if current.contains(block_num) {
                return Ok(());
            }
            self.save()?;
            self.load_at(current.exclusive_end_block.max(
                // Ranges are never reopened backwards.
                crate::block::boundary_floor(block_num, self.save_interval),
            ))?;
        }
    }

    /// Final save when the stream ends mid-range.
    pub fn end_of_stream(&self) -> EngineResult<()> {
        self.save()
    }

    fn save(&self) -> EngineResult<()> {
        let state = self.state.read();
        if !state.is_new {
            return Ok(());
        }
        let mut items: Vec<(String, CacheItem)> = state
            .kv
            .iter()
            .map(|(id, item)| (id.clone(), item.clone()))
            .collect();
        items.sort_by_key(|(_, item)| item.block_num);

        let filename = output_cache_filename(&state.current_range);
        let encoded = encode_artifact(&bincode::serialize(&items)?, self.compress)?;
        self.store.write(&filename, &encoded)?;
        tracing::debug!(
            module = %self.module_name,
            range = %state.current_range,
            outputs = items.len(),
            "output cache saved"
        );
        Ok(())
    }
}
