//! Tier-2: executes one subrequest — a bounded pipeline run over a single
//! range, producing one partial per save interval for the store it targets.

use std::sync::Arc;

use crate::api::request::{RequestDetails, SubRequest};
use crate::api::types::{Response, SubResponse};
use crate::block::{boundary_floor, BlockRange};
use crate::error::EngineResult;
use crate::execout::Caches;
use crate::executor::build_executors;
use crate::manifest::{ModuleGraph, ModuleHashes, ModuleKind, ModuleSet};
use crate::orchestrator::scheduler::compose_store;
use crate::orchestrator::{Job, Worker};
use crate::pipeline::{Pipeline, PipelineConfig};
use crate::source::BlockSource;
use crate::storage::objstore::ObjectStore;
use crate::store::{StoreConfig, StoreMap, StoreUnit};
use crate::wasm;

pub struct Tier2Service {
    runtime: Arc<wasm::Runtime>,
    base_store: Arc<dyn ObjectStore>,
    source: Arc<dyn BlockSource>,
    save_interval: u64,
    compress: bool,
}

impl Tier2Service {
    pub fn new(
        runtime: Arc<wasm::Runtime>,
        base_store: Arc<dyn ObjectStore>,
        source: Arc<dyn BlockSource>,
        save_interval: u64,
        compress: bool,
    ) -> Self {
        Self {
            runtime,
            base_store,
            source,
            save_interval,
            compress,
        }
    }

    /// Runs the subrequest to completion and returns every partial range
    /// written. Progress flows through `sink` while the range processes.
    #[tracing::instrument(skip_all, fields(output = %request.output_module, start = request.start_block_num, stop = request.stop_block_num))]
    pub fn process(
        &self,
        request: &SubRequest,
        sink: &mut dyn FnMut(SubResponse) -> EngineResult<()>,
    ) -> EngineResult<Vec<BlockRange>> {
        let details = Arc::new(RequestDetails::for_subrequest(request));
        let graph = ModuleGraph::new(request.modules.modules.clone())?;
        let hashes = ModuleHashes::compute(&request.modules)?;
        let start = request.start_block_num;

        let mut stores = StoreMap::new();
        let mut caches = Caches::new();
        for module in graph.used_modules(&[request.output_module.as_str()])? {
            let hash = hashes.get(&module.name)?;
            match &module.kind {
                ModuleKind::Store { .. } => {
                    let config =
                        StoreConfig::new(module, hash, &self.base_store, self.compress)?
                            .expect("store modules always yield a config");
                    if module.name == request.output_module {
                        stores.set(StoreUnit::Partial(
                            config.new_partial(start.max(config.initial_block())),
                        ));
                    } else {
                        // Dependencies are composed from whatever fulls and
                        // partials the upstream jobs left behind.
                        let full =
                            compose_store(&config, self.save_interval, start)?;
                        stores.set(StoreUnit::Full(full));
                    }
                }
                ModuleKind::Map { .. } => {
                    let at_block = start.max(graph.module_start_block(&module.name)?);
                    caches.register(
                        &module.name,
                        hash,
                        &self.base_store,
                        self.save_interval,
                        self.compress,
                        boundary_floor(at_block, self.save_interval).max(module.initial_block),
                    )?;
                }
            }
        }

        let executors = build_executors(&self.runtime, &details, &graph, &hashes, &stores)?;

        let output_module = request.output_module.clone();
        let mut forward = |response: Response| -> EngineResult<()> {
            if let Response::ModulesProgress { modules } = response {
                for progress in modules {
                    for range in progress.processed_ranges {
                        sink(SubResponse::ProcessedRange {
                            module_name: output_module.clone(),
                            range,
                        })?;
                    }
                }
            }
            Ok(())
        };

        let partials = {
            let mut pipeline = Pipeline::new(
                Arc::clone(&details),
                &graph,
                executors,
                stores,
                caches,
                PipelineConfig {
                    save_interval: self.save_interval,
                    ..PipelineConfig::default()
                },
                &mut forward,
            )?;
            pipeline.run(self.source.as_ref())?;
            pipeline.partials_written().to_vec()
        };

        sink(SubResponse::Completed {
            all_processed_ranges: partials.clone(),
        })?;
        Ok(partials)
    }
}

/// In-process tier-2 worker driven by the scheduler.
pub struct LocalWorker {
    service: Arc<Tier2Service>,
    modules: Arc<ModuleSet>,
}

impl LocalWorker {
    pub fn new(service: Arc<Tier2Service>, modules: Arc<ModuleSet>) -> Self {
        Self { service, modules }
    }
}

impl Worker for LocalWorker {
    fn work(&self, job: &Job) -> EngineResult<Vec<BlockRange>> {
        if job.range.is_empty() {
            return Ok(Vec::new());
        }
        let request = SubRequest {
            start_block_num: job.range.start_block,
            stop_block_num: job.range.exclusive_end_block,
            modules: (*self.modules).clone(),
            output_module: job.module_name.clone(),
        };
        let mut completed: Vec<BlockRange> = Vec::new();
        self.service.process(&request, &mut |response| {
            if let SubResponse::Completed {
                all_processed_ranges,
            } = response
            {
                completed = all_processed_ranges;
            }
            Ok(())
        })?;
        Ok(completed)
    }
}
