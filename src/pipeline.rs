//! Per-block driver: pulls inputs from caches and stores, runs executors in
//! topological order, writes outputs, and checkpoints on save-interval
//! boundaries.

pub mod fork;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::api::request::RequestDetails;
use crate::api::types::{
    BlockScopedData, Clock, Cursor, MapModuleOutput, ModuleProgress, OutputDebugInfo, Response,
    StoreModuleOutput,
};
use crate::block::{next_boundary, BlockRange};
use crate::error::EngineResult;
use crate::execout::{Caches, ExecOutBuffer};
use crate::executor::{ModuleExecutor, ModuleOutput, OutputData};
use crate::manifest::ModuleGraph;
use crate::pipeline::fork::ForkHandler;
use crate::source::{BlockEvent, BlockSource, SourceBlock};
use crate::store::StoreMap;

/// Hook invoked around each block, used by the tier services for metering
/// and test instrumentation.
pub trait BlockHook: Send {
    fn on_block(&mut self, clock: &Clock) -> EngineResult<()>;
}

pub struct PipelineConfig {
    pub save_interval: u64,
    pub progress_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            save_interval: 1000,
            progress_interval: Duration::from_secs(1),
        }
    }
}

enum Termination {
    StopBlockReached,
    EndOfStream,
}

pub struct Pipeline<F> {
    details: Arc<RequestDetails>,
    executors: Vec<Box<dyn ModuleExecutor>>,
    /// Earliest executable block per executor, inferred from the graph.
    module_start_blocks: HashMap<String, u64>,
    stores: StoreMap,
    caches: Caches,
    fork_handler: ForkHandler,
    resp: F,
    config: PipelineConfig,
    pre_block_hooks: Vec<Box<dyn BlockHook>>,
    post_block_hooks: Vec<Box<dyn BlockHook>>,
    partials_written: Vec<BlockRange>,
    next_save_boundary: u64,
    last_block_num: Option<u64>,
    last_progress_sent: Instant,
}

impl<F> Pipeline<F>
where
    F: FnMut(Response) -> EngineResult<()>,
{
    pub fn new(
        details: Arc<RequestDetails>,
        graph: &ModuleGraph,
        executors: Vec<Box<dyn ModuleExecutor>>,
        stores: StoreMap,
        caches: Caches,
        config: PipelineConfig,
        resp: F,
    ) -> EngineResult<Self> {
        let mut module_start_blocks = HashMap::with_capacity(executors.len());
        for executor in &executors {
            module_start_blocks.insert(
                executor.name().to_string(),
                graph.module_start_block(executor.name())?,
            );
        }

        let start = if details.is_subrequest {
            details.resolved_start_block_num
        } else {
            details.linear_handoff_block_num
        };
        let next_save_boundary = next_boundary(start, config.save_interval);

        Ok(Self {
            details,
            executors,
            module_start_blocks,
            stores,
            caches,
            fork_handler: ForkHandler::new(),
            resp,
            config,
            pre_block_hooks: Vec::new(),
            post_block_hooks: Vec::new(),
            partials_written: Vec::new(),
            next_save_boundary,
            last_block_num: None,
            last_progress_sent: Instant::now(),
        })
    }

    pub fn add_pre_block_hook(&mut self, hook: Box<dyn BlockHook>) {
        self.pre_block_hooks.push(hook);
    }

    pub fn add_post_block_hook(&mut self, hook: Box<dyn BlockHook>) {
        self.post_block_hooks.push(hook);
    }

    pub fn start_block(&self) -> u64 {
        if self.details.is_subrequest {
            self.details.resolved_start_block_num
        } else {
            self.details.linear_handoff_block_num
        }
    }

    pub fn partials_written(&self) -> &[BlockRange] {
        &self.partials_written
    }

    /// Drives the stream to completion. A reached stop block or a dry
    /// source are success and trigger finalization; everything else
    /// propagates unchanged.
    #[tracing::instrument(skip_all, fields(output = %self.details.output_module, start = self.start_block(), stop = self.details.stop_block_num))]
    pub fn run(&mut self, source: &dyn BlockSource) -> EngineResult<()> {
        self.send_initial_snapshots()?;

        let stop = self.details.stop_block_num;
        let mut termination = Termination::EndOfStream;

        let events = source.stream(self.start_block())?;
        for event in events {
            match event? {
                BlockEvent::New { block, cursor } => {
                    if stop > 0 && block.number >= stop {
                        termination = Termination::StopBlockReached;
                        break;
                    }
                    self.process_block(&block, &cursor)?;
                }
                BlockEvent::Undo { target, cursor } => {
                    self.fork_handler.handle_undo(&target, &self.stores);
                    self.last_block_num = Some(target.num.saturating_sub(1));
                    let _ = cursor;
                }
            }
        }

        self.on_stream_terminated(termination)
    }

    fn process_block(&mut self, block: &SourceBlock, cursor: &Cursor) -> EngineResult<()> {
        let clock = Clock {
            id: block.id.clone(),
            number: block.number,
        };

        for hook in &mut self.pre_block_hooks {
            hook.on_block(&clock)?;
        }

        // Within a block everything is all-or-nothing: checkpoints happen
        // before the block executes, so a failure discards only this
        // block's outputs.
        let mut crossed_boundary = false;
        while block.number >= self.next_save_boundary {
            let boundary = self.next_save_boundary;
            self.flush_stores(boundary)?;
            self.next_save_boundary += self.config.save_interval;
            crossed_boundary = true;
        }
        self.caches.update(block.number)?;
        if crossed_boundary {
            self.maybe_emit_progress(&clock, true)?;
        }

        let mut buffer = ExecOutBuffer::new(clock.clone(), block.payload.clone());
        let mut block_outputs: Vec<ModuleOutput> = Vec::with_capacity(self.executors.len());

        for executor in &mut self.executors {
            let name = executor.name();
            if self.module_start_blocks[name] > block.number {
                continue;
            }

            // A sealed output cache short-circuits map re-execution.
            if !executor.is_store() {
                if let Some(payload) = self
                    .caches
                    .get(name)
                    .and_then(|cache| cache.get(&block.id))
                {
                    buffer.set(name, payload.clone());
                    block_outputs.push(ModuleOutput {
                        module_name: name.to_string(),
                        data: OutputData::Map(payload),
                        logs: Vec::new(),
                        logs_truncated: false,
                        cached: true,
                    });
                    continue;
                }
            }

            tracing::debug!(block = block.number, module = %name, "executing");
            let output = executor.run(&buffer)?;

            match &output.data {
                OutputData::Map(payload) => {
                    buffer.set(&output.module_name, payload.clone());
                    if let Some(cache) = self.caches.get(&output.module_name) {
                        cache.set(&block.id, block.number, payload.clone());
                    }
                }
                OutputData::Deltas(deltas) => {
                    if block.number > cursor.lib.num {
                        self.fork_handler.add_reversible_output(
                            &block.id,
                            block.number,
                            &output.module_name,
                            deltas.clone(),
                        );
                    }
                }
            }
            block_outputs.push(output);
        }

        for (_, handle) in self.stores.iter() {
            handle.write().end_block(block.number);
        }
        self.fork_handler.handle_irreversible(cursor.lib.num);
        self.last_block_num = Some(block.number);

        self.emit_block_data(&clock, cursor, block_outputs)?;
        self.maybe_emit_progress(&clock, false)?;

        for hook in &mut self.post_block_hooks {
            hook.on_block(&clock)?;
        }
        Ok(())
    }

    fn emit_block_data(
        &mut self,
        clock: &Clock,
        cursor: &Cursor,
        outputs: Vec<ModuleOutput>,
    ) -> EngineResult<()> {
        if self.details.is_subrequest {
            return Ok(());
        }
        // Blocks below the requested start are warm-up only (development
        // mode replays from the handoff): nothing is emitted for them.
        if clock.number < self.details.resolved_start_block_num {
            return Ok(());
        }

        let mut map_output = None;
        let mut debug_map_outputs = Vec::new();
        let mut debug_store_outputs = Vec::new();

        for output in outputs {
            let debug_info = OutputDebugInfo {
                logs: output.logs,
                logs_truncated: output.logs_truncated,
                cached: output.cached,
            };
            let is_requested = self.details.is_output_module(&output.module_name);
            match output.data {
                OutputData::Map(data) => {
                    if is_requested {
                        map_output = Some(MapModuleOutput {
                            name: output.module_name,
                            data,
                            debug_info,
                        });
                    } else if !self.details.production_mode {
                        debug_map_outputs.push(MapModuleOutput {
                            name: output.module_name,
                            data,
                            debug_info,
                        });
                    }
                }
                OutputData::Deltas(deltas) => {
                    if !self.details.production_mode {
                        debug_store_outputs.push(StoreModuleOutput {
                            name: output.module_name,
                            debug_deltas: deltas,
                            debug_info,
                        });
                    }
                }
            }
        }

        (self.resp)(Response::BlockScopedData(BlockScopedData {
            clock: clock.clone(),
            output: map_output,
            debug_map_outputs,
            debug_store_outputs,
            cursor: cursor.to_opaque(),
            final_block_height: cursor.lib.num,
        }))
    }

    fn maybe_emit_progress(&mut self, clock: &Clock, force: bool) -> EngineResult<()> {
        if !force && self.last_progress_sent.elapsed() < self.config.progress_interval {
            return Ok(());
        }
        self.last_progress_sent = Instant::now();
        let progress = ModuleProgress {
            name: self.details.output_module.clone(),
            processed_ranges: vec![BlockRange::new(self.start_block(), clock.number)],
        };
        (self.resp)(Response::ModulesProgress {
            modules: vec![progress],
        })
    }

    fn flush_stores(&mut self, boundary: u64) -> EngineResult<()> {
        for (name, handle) in self.stores.iter() {
            if let Some(range) = handle
                .write()
                .flush(boundary, self.config.save_interval)?
            {
                tracing::debug!(module = %name, range = %range, "partial written");
                self.partials_written.push(range);
            }
        }
        Ok(())
    }

    fn send_initial_snapshots(&mut self) -> EngineResult<()> {
        if self.details.production_mode || self.details.is_subrequest {
            return Ok(());
        }
        let requested = self.details.debug_initial_store_snapshot_for_modules.clone();
        for module_name in requested {
            let Some(handle) = self.stores.get(&module_name) else {
                continue;
            };
            let entries = handle.read().base().sorted_entries();
            (self.resp)(Response::DebugStoreSnapshot {
                module_name,
                entries,
            })?;
        }
        Ok(())
    }

    fn on_stream_terminated(&mut self, termination: Termination) -> EngineResult<()> {
        let stop = self.details.stop_block_num;
        tracing::debug!(
            stop_block_num = stop,
            eof = matches!(termination, Termination::EndOfStream),
            "stream of blocks ended"
        );

        self.caches.end_of_stream()?;

        // A reached stop block covers through `stop`; a dry source only
        // covers what was actually processed.
        let final_boundary = match termination {
            Termination::StopBlockReached => stop,
            Termination::EndOfStream => self.last_block_num.map(|n| n + 1).unwrap_or(0),
        };
        if final_boundary > 0 {
            self.flush_stores(final_boundary)?;
        }

        let trailer = self
            .partials_written
            .iter()
            .map(|range| range.to_string())
            .collect::<Vec<_>>()
            .join(",");
        tracing::info!(ranges = %trailer, "setting partials-written trailer");
        (self.resp)(Response::PartialsWritten { trailer })
    }
}
