//! Execution outputs: the per-block value bag the pipeline fills and the
//! durable per-module output caches.

pub mod cache;

use std::collections::HashMap;
use std::sync::Arc;

use crate::api::types::Clock;
use crate::error::{EngineError, EngineResult};
use crate::storage::objstore::ObjectStore;

pub use cache::OutputCache;

/// Values produced while executing one block: the raw source payload plus
/// every module output so far, keyed by module name. Executors read their
/// inputs from here and write their output back.
pub struct ExecOutBuffer {
    clock: Clock,
    source_payload: Vec<u8>,
    values: HashMap<String, Vec<u8>>,
}

impl ExecOutBuffer {
    pub fn new(clock: Clock, source_payload: Vec<u8>) -> Self {
        Self {
            clock,
            source_payload,
            values: HashMap::new(),
        }
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn source_payload(&self) -> &[u8] {
        &self.source_payload
    }

    pub fn set(&mut self, module: &str, payload: Vec<u8>) {
        self.values.insert(module.to_string(), payload);
    }

    pub fn get(&self, module: &str) -> EngineResult<&[u8]> {
        self.values
            .get(module)
            .map(Vec::as_slice)
            .ok_or_else(|| EngineError::ModuleExecution {
                module: module.to_string(),
                reason: "input not produced at this block; check execution order".to_string(),
                logs: Vec::new(),
            })
    }
}

/// The output caches of every map module in a request.
#[derive(Default)]
pub struct Caches {
    caches: HashMap<String, OutputCache>,
}

impl Caches {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        module_name: &str,
        module_hash: &str,
        base_store: &Arc<dyn ObjectStore>,
        save_interval: u64,
        compress: bool,
        at_block: u64,
    ) -> EngineResult<()> {
        if self.caches.contains_key(module_name) {
            return Ok(());
        }
        let store = base_store.sub_store(&format!("{module_hash}/outputs"))?;
        let cache = OutputCache::new(module_name, store, save_interval, compress);
        cache.load_at(at_block)?;
        self.caches.insert(module_name.to_string(), cache);
        Ok(())
    }

    pub fn get(&self, module_name: &str) -> Option<&OutputCache> {
        self.caches.get(module_name)
    }

    /// Advances every cache to the range containing `block_num`.
    pub fn update(&self, block_num: u64) -> EngineResult<()> {
        for cache in self.caches.values() {
            cache.update(block_num)?;
        }
        Ok(())
    }

    pub fn end_of_stream(&self) -> EngineResult<()> {
        for cache in self.caches.values() {
            cache.end_of_stream()?;
        }
        Ok(())
    }
}
