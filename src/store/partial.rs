//! Partial stores: windowed state accumulated by one subrequest, written
//! once per save interval and composed into full stores later.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::block::BlockRange;
use crate::error::EngineResult;
use crate::storage::filename::partial_filename;
use crate::storage::objstore::{decode_artifact, encode_artifact, ObjectStore};
use crate::store::base::BaseStore;
use crate::store::delta::BlockDeltas;

#[derive(Debug, Serialize, Deserialize)]
pub struct PartialSnapshotPayload {
    pub module_hash: String,
    pub range: BlockRange,
    /// Net key/value state produced by the window, starting from empty.
    pub entries: Vec<(Vec<u8>, Vec<u8>)>,
    /// Prefixes deleted during the window, in execution order. Applied to
    /// pre-window state when the partial is merged.
    pub deleted_prefixes: Vec<Vec<u8>>,
}

pub struct PartialStore {
    base: BaseStore,
    store: Arc<dyn ObjectStore>,
    compress: bool,
    range_start: u64,
    deleted_prefixes: Vec<Vec<u8>>,
}

impl PartialStore {
    pub fn new(
        base: BaseStore,
        store: Arc<dyn ObjectStore>,
        compress: bool,
        range_start: u64,
    ) -> Self {
        Self {
            base,
            store,
            compress,
            range_start,
            deleted_prefixes: Vec::new(),
        }
    }

    pub fn base(&self) -> &BaseStore {
        &self.base
    }

    pub fn base_mut(&mut self) -> &mut BaseStore {
        &mut self.base
    }

    pub fn range_start(&self) -> u64 {
        self.range_start
    }

    /// Closes a block, carrying the block's prefix deletions into the
    /// window-wide record.
    pub fn end_block(&mut self, block_num: u64) -> BlockDeltas {
        let block = self.base.end_block(block_num);
        for (_, prefix) in &block.deleted_prefixes {
            if !self.deleted_prefixes.contains(prefix) {
                self.deleted_prefixes.push(prefix.clone());
            }
        }
        block
    }

    /// Writes the window `[range_start, end_block)` and resets to an empty
    /// window starting at `end_block`.
    pub fn save(&mut self, end_block: u64) -> EngineResult<BlockRange> {
        let range = BlockRange::new(self.range_start, end_block);
        let payload = PartialSnapshotPayload {
            module_hash: self.base.module_hash().to_string(),
            range,
            entries: self.base.sorted_entries(),
            deleted_prefixes: std::mem::take(&mut self.deleted_prefixes),
        };
        let encoded = encode_artifact(&bincode::serialize(&payload)?, self.compress)?;
        self.store.write(&partial_filename(&range), &encoded)?;

        self.base.replace_entries(Vec::new());
        self.range_start = end_block;
        tracing::debug!(
            module = %self.base.name(),
            range = %range,
            "partial store saved"
        );
        Ok(range)
    }
}

/// Reads one partial artifact from a store area.
pub fn read_partial(
    store: &Arc<dyn ObjectStore>,
    module: &str,
    range: &BlockRange,
) -> EngineResult<PartialSnapshotPayload> {
    let filename = partial_filename(range);
    let raw = store
        .read(&filename)?
        .ok_or_else(|| crate::error::EngineError::MissingSnapshot {
            module: module.to_string(),
            block: range.start_block,
        })?;
    Ok(bincode::deserialize(&decode_artifact(&filename, &raw)?)?)
}
