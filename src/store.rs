//! Store engine: checkpointed, partially-mergeable key-value state with
//! forward/reverse delta application.

pub mod base;
pub mod config;
pub mod delta;
pub mod full;
pub mod partial;
pub mod value;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::block::BlockRange;
use crate::error::EngineResult;
use crate::store::base::BaseStore;
use crate::store::delta::BlockDeltas;
use crate::store::full::FullStore;
use crate::store::partial::PartialStore;

pub use config::StoreConfig;

/// One live store of a request, in either durability mode. The two modes
/// share key semantics; they differ in what a flush writes.
pub enum StoreUnit {
    Full(FullStore),
    Partial(PartialStore),
}

impl StoreUnit {
    pub fn base(&self) -> &BaseStore {
        match self {
            StoreUnit::Full(s) => s.base(),
            StoreUnit::Partial(s) => s.base(),
        }
    }

    pub fn base_mut(&mut self) -> &mut BaseStore {
        match self {
            StoreUnit::Full(s) => s.base_mut(),
            StoreUnit::Partial(s) => s.base_mut(),
        }
    }

    pub fn name(&self) -> &str {
        self.base().name()
    }

    pub fn end_block(&mut self, block_num: u64) -> BlockDeltas {
        match self {
            StoreUnit::Full(s) => s.base_mut().end_block(block_num),
            StoreUnit::Partial(s) => s.end_block(block_num),
        }
    }

    /// Checkpoints at `boundary`. Returns the written range for partial
    /// stores; full snapshots are written only at aligned boundaries and
    /// never count as partials.
    pub fn flush(&mut self, boundary: u64, save_interval: u64) -> EngineResult<Option<BlockRange>> {
        match self {
            StoreUnit::Full(s) => {
                if boundary % save_interval == 0 && boundary > s.base().initial_block() {
                    s.save(boundary)?;
                }
                Ok(None)
            }
            StoreUnit::Partial(s) => {
                if boundary <= s.range_start() {
                    return Ok(None);
                }
                Ok(Some(s.save(boundary)?))
            }
        }
    }
}

pub type StoreHandle = Arc<RwLock<StoreUnit>>;

/// All live stores of one request, keyed by module name.
#[derive(Default, Clone)]
pub struct StoreMap {
    stores: HashMap<String, StoreHandle>,
}

impl StoreMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, unit: StoreUnit) {
        self.stores
            .insert(unit.name().to_string(), Arc::new(RwLock::new(unit)));
    }

    pub fn get(&self, name: &str) -> Option<&StoreHandle> {
        self.stores.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &StoreHandle)> {
        self.stores.iter()
    }

    pub fn len(&self) -> usize {
        self.stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }
}
