//! Tier-1: orchestrates a whole request. Resolves it, backfills cold
//! history through the scheduler, composes the handoff stores, then runs
//! the linear pipeline to the stop block.

use std::sync::Arc;
use std::time::Duration;

use crate::api::request::{Request, RequestDetails};
use crate::api::types::{BlockNum, ModuleProgress, Response};
use crate::error::EngineResult;
use crate::execout::Caches;
use crate::executor::build_executors;
use crate::manifest::{ModuleGraph, ModuleHashes, ModuleKind};
use crate::orchestrator::{compose_stores, Plan, Scheduler, SchedulerConfig, Worker};
use crate::pipeline::{Pipeline, PipelineConfig};
use crate::service::tier2::{LocalWorker, Tier2Service};
use crate::source::BlockSource;
use crate::storage::objstore::ObjectStore;
use crate::store::{StoreConfig, StoreMap, StoreUnit};
use crate::wasm;

#[derive(Clone)]
pub struct RuntimeConfig {
    /// Block span between consecutive store checkpoints.
    pub save_interval: u64,
    /// Upper bound on one subrequest's range, in blocks.
    pub subrequest_split_size: u64,
    pub parallel_subrequests: usize,
    pub max_job_retries: usize,
    pub compress_artifacts: bool,
    pub progress_interval: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            save_interval: 1000,
            subrequest_split_size: 10_000,
            parallel_subrequests: 4,
            max_job_retries: 3,
            compress_artifacts: false,
            progress_interval: Duration::from_secs(1),
        }
    }
}

pub struct Tier1Service {
    config: RuntimeConfig,
    runtime: Arc<wasm::Runtime>,
    base_store: Arc<dyn ObjectStore>,
    source: Arc<dyn BlockSource>,
}

impl Tier1Service {
    pub fn new(
        config: RuntimeConfig,
        base_store: Arc<dyn ObjectStore>,
        source: Arc<dyn BlockSource>,
    ) -> EngineResult<Self> {
        Ok(Self {
            config,
            runtime: Arc::new(wasm::Runtime::new()?),
            base_store,
            source,
        })
    }

    /// Serves one request, streaming responses through `resp` in strict
    /// block order until the stop block or the end of the source.
    #[tracing::instrument(skip_all, fields(output = %request.output_module, production = request.production_mode))]
    pub fn blocks<F>(
        &self,
        request: &Request,
        latest_final_block: Option<BlockNum>,
        mut resp: F,
    ) -> EngineResult<()>
    where
        F: FnMut(Response) -> EngineResult<()>,
    {
        let details = Arc::new(RequestDetails::build(request, latest_final_block)?);
        let graph = ModuleGraph::new(request.modules.modules.clone())?;
        graph.get(&request.output_module)?;
        let hashes = ModuleHashes::compute(&request.modules)?;

        let used = graph.used_modules(&[request.output_module.as_str()])?;
        let mut store_configs: Vec<StoreConfig> = Vec::new();
        for module in &used {
            if let Some(config) = StoreConfig::new(
                module,
                hashes.get(&module.name)?,
                &self.base_store,
                self.config.compress_artifacts,
            )? {
                store_configs.push(config);
            }
        }

        let handoff = details.linear_handoff_block_num;
        let store_map = self.backfill(&graph, &store_configs, request, handoff, &mut resp)?;

        let mut caches = Caches::new();
        for module in &used {
            if let ModuleKind::Map { .. } = module.kind {
                let at_block = handoff.max(graph.module_start_block(&module.name)?);
                caches.register(
                    &module.name,
                    hashes.get(&module.name)?,
                    &self.base_store,
                    self.config.save_interval,
                    self.config.compress_artifacts,
                    crate::block::boundary_floor(at_block, self.config.save_interval)
                        .max(module.initial_block),
                )?;
            }
        }

        let executors = build_executors(&self.runtime, &details, &graph, &hashes, &store_map)?;
        let mut pipeline = Pipeline::new(
            details,
            &graph,
            executors,
            store_map,
            caches,
            PipelineConfig {
                save_interval: self.config.save_interval,
                progress_interval: self.config.progress_interval,
            },
            &mut resp,
        )?;
        pipeline.run(self.source.as_ref())
    }

    /// Runs parallel backfill up to the handoff block and composes the
    /// resulting artifacts into the pipeline's starting store map.
    fn backfill<F>(
        &self,
        graph: &ModuleGraph,
        store_configs: &[StoreConfig],
        request: &Request,
        handoff: BlockNum,
        resp: &mut F,
    ) -> EngineResult<StoreMap>
    where
        F: FnMut(Response) -> EngineResult<()>,
    {
        if store_configs.is_empty() {
            return Ok(StoreMap::new());
        }
        let needs_backfill = store_configs
            .iter()
            .any(|config| handoff > config.initial_block());
        if !needs_backfill {
            let mut map = StoreMap::new();
            for config in store_configs {
                map.set(StoreUnit::Full(config.new_full()));
            }
            return Ok(map);
        }

        let plan = Plan::build(
            graph,
            store_configs,
            self.config.save_interval,
            self.config.subrequest_split_size,
            handoff,
        )?;
        tracing::info!(work_plan = %plan, "work plan ready");
        resp(Response::ModulesProgress {
            modules: plan.initial_progress_messages(),
        })?;

        let tier2 = Arc::new(Tier2Service::new(
            Arc::clone(&self.runtime),
            Arc::clone(&self.base_store),
            Arc::clone(&self.source),
            self.config.save_interval,
            self.config.compress_artifacts,
        ));
        let modules = Arc::new(request.modules.clone());
        let workers: Vec<Box<dyn Worker>> = (0..self.config.parallel_subrequests.max(1))
            .map(|_| {
                Box::new(LocalWorker::new(Arc::clone(&tier2), Arc::clone(&modules)))
                    as Box<dyn Worker>
            })
            .collect();

        let scheduler = Scheduler::new(SchedulerConfig {
            max_job_retries: self.config.max_job_retries,
            ..SchedulerConfig::default()
        });
        scheduler.run(plan, workers, |job, ranges| {
            let _ = resp(Response::ModulesProgress {
                modules: vec![ModuleProgress {
                    name: job.module_name.clone(),
                    processed_ranges: ranges.to_vec(),
                }],
            });
        })?;

        compose_stores(store_configs, self.config.save_interval, handoff)
    }
}
