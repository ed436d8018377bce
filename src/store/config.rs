//! Per-module store configuration, shared between the planner, the tier
//! services and the workers.

use std::sync::Arc;

use crate::error::EngineResult;
use crate::manifest::{Module, ModuleKind, UpdatePolicy, ValueType};
use crate::storage::objstore::ObjectStore;
use crate::store::base::BaseStore;
use crate::store::full::FullStore;
use crate::store::partial::PartialStore;

#[derive(Clone)]
pub struct StoreConfig {
    name: String,
    module_hash: String,
    initial_block: u64,
    update_policy: UpdatePolicy,
    value_type: ValueType,
    state_store: Arc<dyn ObjectStore>,
    compress: bool,
}

impl StoreConfig {
    /// Builds the configuration for one store module. The state area is
    /// scoped by content hash, so a module change never reads stale
    /// artifacts.
    pub fn new(
        module: &Module,
        module_hash: &str,
        base_store: &Arc<dyn ObjectStore>,
        compress: bool,
    ) -> EngineResult<Option<Self>> {
        let ModuleKind::Store {
            update_policy,
            value_type,
        } = &module.kind
        else {
            return Ok(None);
        };

        let state_store = base_store.sub_store(&format!("{module_hash}/states"))?;
        Ok(Some(Self {
            name: module.name.clone(),
            module_hash: module_hash.to_string(),
            initial_block: module.initial_block,
            update_policy: *update_policy,
            value_type: value_type.clone(),
            state_store,
            compress,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn module_hash(&self) -> &str {
        &self.module_hash
    }

    pub fn initial_block(&self) -> u64 {
        self.initial_block
    }

    pub fn state_store(&self) -> &Arc<dyn ObjectStore> {
        &self.state_store
    }

    pub fn compress(&self) -> bool {
        self.compress
    }

    pub fn new_full(&self) -> FullStore {
        FullStore::new(self.base_store(), Arc::clone(&self.state_store), self.compress)
    }

    pub fn new_partial(&self, start_block: u64) -> PartialStore {
        PartialStore::new(
            self.base_store(),
            Arc::clone(&self.state_store),
            self.compress,
            start_block,
        )
    }

    fn base_store(&self) -> BaseStore {
        BaseStore::new(
            &self.name,
            &self.module_hash,
            self.initial_block,
            self.update_policy,
            self.value_type.clone(),
        )
    }
}
