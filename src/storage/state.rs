//! Storage-state scanner: derives what has already been computed for each
//! store module by listing its snapshot area, and what remains to be done
//! up to a target block.

use std::collections::HashMap;

use crate::block::{next_boundary, BlockRange};
use crate::error::{EngineError, EngineResult};
use crate::storage::filename::{parse_state_filename, StateFileKind};
use crate::store::StoreConfig;

/// Everything known about one module's persisted state, partitioned over
/// `[module_initial_block, target)`:
/// `initial_complete_range ∪ partials_present ∪ partials_missing` covers the
/// span exactly, and the three sets are pairwise disjoint.
#[derive(Debug, Clone)]
pub struct ModuleStorageState {
    pub module_name: String,
    pub module_initial_block: u64,
    /// Longest `[initial, P)` covered by a full snapshot, if any.
    pub initial_complete_range: Option<BlockRange>,
    pub partials_present: Vec<BlockRange>,
    pub partials_missing: Vec<BlockRange>,
}

impl ModuleStorageState {
    /// Exclusive end of contiguous coverage starting at the initial block:
    /// the full snapshot plus any directly adjacent partials.
    pub fn covered_through(&self) -> u64 {
        let mut end = self
            .initial_complete_range
            .map(|r| r.exclusive_end_block)
            .unwrap_or(self.module_initial_block);
        for range in &self.partials_present {
            if range.start_block == end {
                end = range.exclusive_end_block;
            }
        }
        end
    }

    /// Contiguous missing ranges, merged then re-split into job-sized
    /// chunks of at most `subrequest_split_size` blocks.
    pub fn batch_missing(&self, subrequest_split_size: u64) -> Vec<BlockRange> {
        crate::block::merge_contiguous(&self.partials_missing)
            .into_iter()
            .flat_map(|r| r.split(subrequest_split_size))
            .collect()
    }
}

/// Scans one module's snapshot area against `target`.
pub fn scan_module(
    config: &StoreConfig,
    save_interval: u64,
    target: u64,
) -> EngineResult<ModuleStorageState> {
    let initial = config.initial_block();
    let mut full_ends: Vec<u64> = Vec::new();
    let mut partial_files: Vec<BlockRange> = Vec::new();

    for name in config.state_store().list()? {
        let Some(file) = parse_state_filename(&name) else {
            continue;
        };
        match file.kind {
            StateFileKind::FullKv => {
                if file.range.start_block == initial && file.range.exclusive_end_block <= target {
                    full_ends.push(file.range.exclusive_end_block);
                }
            }
            StateFileKind::Partial => partial_files.push(file.range),
        }
    }

    let complete_through = full_ends.into_iter().max();
    let initial_complete_range =
        complete_through.map(|end| BlockRange::new(initial, end));
    let mut window_start = complete_through.unwrap_or(initial);

    let mut partials_present = Vec::new();
    let mut partials_missing = Vec::new();
    while window_start < target {
        let window_end = next_boundary(window_start, save_interval).min(target);
        let window = BlockRange::new(window_start, window_end);
        if partial_files.contains(&window) {
            partials_present.push(window);
        } else {
            partials_missing.push(window);
        }
        window_start = window_end;
    }

    Ok(ModuleStorageState {
        module_name: config.name().to_string(),
        module_initial_block: initial,
        initial_complete_range,
        partials_present,
        partials_missing,
    })
}

/// Per-module storage states for a whole request.
#[derive(Default)]
pub struct StorageState {
    pub modules: HashMap<String, ModuleStorageState>,
}

impl StorageState {
    pub fn fetch(
        configs: &[StoreConfig],
        save_interval: u64,
        target: u64,
    ) -> EngineResult<StorageState> {
        let mut modules = HashMap::with_capacity(configs.len());
        for config in configs {
            let state = scan_module(config, save_interval, target)?;
            tracing::debug!(
                module = %state.module_name,
                complete = ?state.initial_complete_range,
                present = state.partials_present.len(),
                missing = state.partials_missing.len(),
                "storage state scanned"
            );
            modules.insert(state.module_name.clone(), state);
        }
        Ok(StorageState { modules })
    }

    pub fn get(&self, module: &str) -> EngineResult<&ModuleStorageState> {
        self.modules
            .get(module)
            .ok_or_else(|| EngineError::MissingStorageState {
                module: module.to_string(),
            })
    }
}
