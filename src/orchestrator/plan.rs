//! Plan: the data side of backfill. What exists, what is missing, and the
//! prioritized jobs that would close the gap. All behavior (dispatch,
//! retries, completion) lives in the scheduler.

use std::collections::HashMap;

use crate::api::types::ModuleProgress;
use crate::error::EngineResult;
use crate::manifest::ModuleGraph;
use crate::orchestrator::job::Job;
use crate::storage::state::{ModuleStorageState, StorageState};
use crate::store::StoreConfig;

pub struct Plan {
    pub modules_state: HashMap<String, ModuleStorageState>,
    jobs: Vec<Job>,
}

impl Plan {
    /// Scans persisted state for every store config and synthesizes jobs
    /// for the missing windows up to `up_to_block`.
    pub fn build(
        graph: &ModuleGraph,
        configs: &[StoreConfig],
        save_interval: u64,
        subrequest_split_size: u64,
        up_to_block: u64,
    ) -> EngineResult<Plan> {
        let storage_state = StorageState::fetch(configs, save_interval, up_to_block)?;

        let mut keyed: Vec<(usize, Job)> = Vec::new();
        for config in configs {
            let name = config.name();
            let state = storage_state.get(name)?;
            let depth = graph.dependency_depth(name)?;
            let dependencies: Vec<String> = graph
                .ancestor_stores_of(name)?
                .iter()
                .map(|m| m.name.clone())
                .collect();

            for range in state.batch_missing(subrequest_split_size) {
                tracing::info!(
                    module = %name,
                    start_block = range.start_block,
                    end_block = range.exclusive_end_block,
                    "job planned"
                );
                keyed.push((
                    depth,
                    Job {
                        module_name: name.to_string(),
                        range,
                        dependencies: dependencies.clone(),
                        priority: 0,
                        attempts: 0,
                    },
                ));
            }
        }

        // Shallow modules first: they unblock the most downstream work.
        // Within a depth, earlier ranges first; ties broken by name.
        keyed.sort_by(|(depth_a, a), (depth_b, b)| {
            depth_a
                .cmp(depth_b)
                .then(a.range.start_block.cmp(&b.range.start_block))
                .then(a.module_name.cmp(&b.module_name))
        });
        let jobs = keyed
            .into_iter()
            .enumerate()
            .map(|(rank, (_, mut job))| {
                job.priority = rank as u64;
                job
            })
            .collect();

        Ok(Plan {
            modules_state: storage_state.modules,
            jobs,
        })
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn take_jobs(&mut self) -> Vec<Job> {
        std::mem::take(&mut self.jobs)
    }

    pub fn store_count(&self) -> usize {
        self.modules_state.len()
    }

    /// Progress the client can be told before any job runs: everything the
    /// scan found already materialized.
    pub fn initial_progress_messages(&self) -> Vec<ModuleProgress> {
        let mut out: Vec<ModuleProgress> = Vec::new();
        for (name, state) in &self.modules_state {
            let mut ranges = Vec::new();
            if let Some(range) = state.initial_complete_range {
                ranges.push(range);
            }
            ranges.extend(state.partials_present.iter().copied());
            if ranges.is_empty() {
                continue;
            }
            out.push(ModuleProgress {
                name: name.clone(),
                processed_ranges: ranges,
            });
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for (name, state) in &self.modules_state {
            if !first {
                write!(f, "; ")?;
            }
            first = false;
            write!(
                f,
                "mod={:?} complete={:?} present={} missing={}",
                name,
                state.initial_complete_range.map(|r| r.to_string()),
                state.partials_present.len(),
                state.partials_missing.len(),
            )?;
        }
        Ok(())
    }
}
