//! Reorg handling: buffers reversible store deltas per block and unwinds
//! them when the source retracts blocks.

use std::collections::HashMap;

use crate::api::types::BlockRef;
use crate::store::delta::Delta;
use crate::store::StoreMap;

struct ReversibleBlock {
    block_num: u64,
    /// `(module, deltas)` in execution order.
    store_deltas: Vec<(String, Vec<Delta>)>,
}

/// Keeps every reversible block's store deltas until the block becomes
/// irreversible or is undone.
#[derive(Default)]
pub struct ForkHandler {
    reversible: HashMap<String, ReversibleBlock>,
}

impl ForkHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_reversible_output(
        &mut self,
        block_id: &str,
        block_num: u64,
        module_name: &str,
        deltas: Vec<Delta>,
    ) {
        if deltas.is_empty() {
            return;
        }
        self.reversible
            .entry(block_id.to_string())
            .or_insert_with(|| ReversibleBlock {
                block_num,
                store_deltas: Vec::new(),
            })
            .store_deltas
            .push((module_name.to_string(), deltas));
    }

    /// Unwinds one retracted block. Modules are reverted in reverse
    /// execution order; after the call every store reads as it did before
    /// the block was processed.
    pub fn handle_undo(&mut self, target: &BlockRef, stores: &StoreMap) {
        let Some(buffered) = self.reversible.remove(&target.id) else {
            tracing::debug!(block = %target.id, "undo for a block with no buffered outputs");
            return;
        };
        tracing::info!(
            block_num = buffered.block_num,
            block = %target.id,
            modules = buffered.store_deltas.len(),
            "unwinding retracted block"
        );
        for (module, deltas) in buffered.store_deltas.iter().rev() {
            if let Some(handle) = stores.get(module) {
                handle.write().base_mut().apply_deltas_reverse(deltas);
            }
        }
    }

    /// Drops buffers at or below the new last irreversible block.
    pub fn handle_irreversible(&mut self, lib_num: u64) {
        self.reversible.retain(|_, block| block.block_num > lib_num);
    }

    pub fn buffered_blocks(&self) -> usize {
        self.reversible.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{UpdatePolicy, ValueType};
    use crate::store::base::BaseStore;
    use crate::store::full::FullStore;
    use crate::store::{StoreMap, StoreUnit};
    use crate::storage::objstore::{FsObjectStore, ObjectStore};
    use std::sync::Arc;

    fn store_map_with(name: &str, dir: &std::path::Path) -> StoreMap {
        let base = BaseStore::new(name, "hash", 0, UpdatePolicy::Set, ValueType::String);
        let objstore: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(dir).unwrap());
        let mut map = StoreMap::new();
        map.set(StoreUnit::Full(FullStore::new(base, objstore, false)));
        map
    }

    #[test]
    fn undo_restores_pre_block_state() {
        let tmp = tempfile::tempdir().unwrap();
        let stores = store_map_with("totals", tmp.path());
        let handle = stores.get("totals").unwrap().clone();

        handle.write().base_mut().set(0, b"k", b"ten").unwrap();
        let block_10 = handle.write().end_block(10);

        handle.write().base_mut().set(0, b"k", b"eleven").unwrap();
        let block_11 = handle.write().end_block(11);

        let mut fork = ForkHandler::new();
        fork.add_reversible_output("aa10", 10, "totals", block_10.deltas);
        fork.add_reversible_output("bb11", 11, "totals", block_11.deltas);

        fork.handle_undo(&BlockRef::new("bb11", 11), &stores);
        assert_eq!(
            handle.read().base().get_last(b"k"),
            Some(b"ten".as_slice())
        );

        fork.handle_undo(&BlockRef::new("aa10", 10), &stores);
        assert_eq!(handle.read().base().get_last(b"k"), None);
    }

    #[test]
    fn irreversible_advancement_discards_old_buffers() {
        let mut fork = ForkHandler::new();
        fork.add_reversible_output(
            "aa10",
            10,
            "totals",
            vec![crate::store::delta::Delta {
                operation: crate::store::delta::Operation::Create,
                ordinal: 0,
                key: b"k".to_vec(),
                old_value: vec![],
                new_value: b"v".to_vec(),
            }],
        );
        assert_eq!(fork.buffered_blocks(), 1);
        fork.handle_irreversible(9);
        assert_eq!(fork.buffered_blocks(), 1);
        fork.handle_irreversible(10);
        assert_eq!(fork.buffered_blocks(), 0);
    }
}
