//! Shared fixtures: in-memory block sources, native (non-sandboxed)
//! executors, and module-set builders.

#![allow(dead_code)]

use std::env;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Once};

use tierstream::api::request::RequestDetails;
use tierstream::error::EngineResult;
use tierstream::execout::ExecOutBuffer;
use tierstream::manifest::module::{
    Binary, Module, ModuleInput, ModuleKind, StoreMode, UpdatePolicy, ValueType,
};
use tierstream::source::{BlockEvent, BlockSource, SourceBlock};
use tierstream::store::base::BaseStore;
use tierstream::store::StoreHandle;
use tierstream::{
    BlockRef, Cursor, ForkStep, ModuleExecutor, ModuleOutput, ModuleSet, OutputData,
};

static INIT_TESTDATA_ROOT: Once = Once::new();

pub fn workspace_tmp() -> PathBuf {
    let path = env::current_dir().unwrap().join("target/testdata");
    INIT_TESTDATA_ROOT.call_once(|| {
        if env::var_os("TIERSTREAM_KEEP_TESTDATA").is_none() {
            let _ = std::fs::remove_dir_all(&path);
        }
    });
    path
}

pub fn tempdir() -> tempfile::TempDir {
    let workspace_tmp = workspace_tmp();
    std::fs::create_dir_all(&workspace_tmp).unwrap();
    tempfile::tempdir_in(&workspace_tmp).unwrap()
}

pub fn block_id(num: u64) -> String {
    format!("{num:08x}aa")
}

/// A block whose payload is its own number, little-endian.
pub fn block(num: u64, lib: u64) -> SourceBlock {
    SourceBlock {
        id: block_id(num),
        parent_id: block_id(num.saturating_sub(1)),
        number: num,
        final_block_height: lib,
        payload: num.to_le_bytes().to_vec(),
    }
}

pub fn payload_num(buffer: &ExecOutBuffer) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(buffer.source_payload());
    u64::from_le_bytes(raw)
}

pub fn new_event(block: SourceBlock) -> BlockEvent {
    let cursor = Cursor {
        block: BlockRef::new(block.id.clone(), block.number),
        lib: BlockRef::new(block_id(block.final_block_height), block.final_block_height),
        step: if block.number <= block.final_block_height {
            ForkStep::Irreversible
        } else {
            ForkStep::New
        },
    };
    BlockEvent::New { block, cursor }
}

pub fn undo_event(num: u64, id: &str, lib: u64) -> BlockEvent {
    BlockEvent::Undo {
        target: BlockRef::new(id, num),
        cursor: Cursor {
            block: BlockRef::new(id, num),
            lib: BlockRef::new(block_id(lib), lib),
            step: ForkStep::Undo,
        },
    }
}

/// Replays a fixed event list; `stream(start)` skips new-block events below
/// the requested start.
pub struct MemoryBlockSource {
    events: Vec<BlockEvent>,
}

impl MemoryBlockSource {
    pub fn new(events: Vec<BlockEvent>) -> Self {
        Self { events }
    }

    /// A clean irreversible chain `[start, end)`.
    pub fn chain(start: u64, end: u64) -> Self {
        let events = (start..end).map(|num| new_event(block(num, num))).collect();
        Self::new(events)
    }
}

impl BlockSource for MemoryBlockSource {
    fn stream(
        &self,
        start_block: u64,
    ) -> EngineResult<Box<dyn Iterator<Item = EngineResult<BlockEvent>> + Send + '_>> {
        let events: Vec<BlockEvent> = self
            .events
            .iter()
            .filter(|event| match event {
                BlockEvent::New { block, .. } => block.number >= start_block,
                BlockEvent::Undo { .. } => true,
            })
            .cloned()
            .collect();
        Ok(Box::new(events.into_iter().map(Ok)))
    }
}

/// Execution-order recorder shared between native executors.
pub type ExecutionLog = Arc<Mutex<Vec<(u64, String)>>>;

pub fn execution_log() -> ExecutionLog {
    Arc::new(Mutex::new(Vec::new()))
}

type MapFn = Box<dyn FnMut(&ExecOutBuffer) -> EngineResult<Vec<u8>> + Send>;

/// Map module executor that runs a closure instead of a sandbox instance.
pub struct NativeMapExecutor {
    name: String,
    run: MapFn,
    log: Option<ExecutionLog>,
}

impl NativeMapExecutor {
    pub fn new(name: &str, run: MapFn) -> Self {
        Self {
            name: name.to_string(),
            run,
            log: None,
        }
    }

    pub fn with_log(mut self, log: ExecutionLog) -> Self {
        self.log = Some(log);
        self
    }
}

impl ModuleExecutor for NativeMapExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_store(&self) -> bool {
        false
    }

    fn run(&mut self, buffer: &ExecOutBuffer) -> EngineResult<ModuleOutput> {
        if let Some(log) = &self.log {
            log.lock()
                .unwrap()
                .push((buffer.clock().number, self.name.clone()));
        }
        let data = (self.run)(buffer)?;
        Ok(ModuleOutput {
            module_name: self.name.clone(),
            data: OutputData::Map(data),
            logs: Vec::new(),
            logs_truncated: false,
            cached: false,
        })
    }
}

type StoreFn = Box<dyn FnMut(&ExecOutBuffer, &mut BaseStore) -> EngineResult<()> + Send>;

/// Store module executor driving writer ops directly.
pub struct NativeStoreExecutor {
    name: String,
    store: StoreHandle,
    run: StoreFn,
    log: Option<ExecutionLog>,
}

impl NativeStoreExecutor {
    pub fn new(name: &str, store: StoreHandle, run: StoreFn) -> Self {
        Self {
            name: name.to_string(),
            store,
            run,
            log: None,
        }
    }

    pub fn with_log(mut self, log: ExecutionLog) -> Self {
        self.log = Some(log);
        self
    }
}

impl ModuleExecutor for NativeStoreExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_store(&self) -> bool {
        true
    }

    fn run(&mut self, buffer: &ExecOutBuffer) -> EngineResult<ModuleOutput> {
        if let Some(log) = &self.log {
            log.lock()
                .unwrap()
                .push((buffer.clock().number, self.name.clone()));
        }
        {
            let mut guard = self.store.write();
            (self.run)(buffer, guard.base_mut())?;
        }
        let deltas = self.store.read().base().current_deltas().to_vec();
        Ok(ModuleOutput {
            module_name: self.name.clone(),
            data: OutputData::Deltas(deltas),
            logs: Vec::new(),
            logs_truncated: false,
            cached: false,
        })
    }
}

pub fn source_input() -> ModuleInput {
    ModuleInput::Source {
        kind: "test.Block".to_string(),
    }
}

pub fn map_input(name: &str) -> ModuleInput {
    ModuleInput::Map {
        module_name: name.to_string(),
    }
}

pub fn store_input(name: &str) -> ModuleInput {
    ModuleInput::Store {
        module_name: name.to_string(),
        mode: StoreMode::Get,
    }
}

pub fn map_module(name: &str, initial_block: u64, inputs: Vec<ModuleInput>) -> Module {
    Module {
        name: name.to_string(),
        binary_index: 0,
        binary_entrypoint: name.to_string(),
        initial_block,
        kind: ModuleKind::Map {
            output_type: "proto:test.Output".to_string(),
        },
        inputs,
    }
}

pub fn store_module(
    name: &str,
    initial_block: u64,
    update_policy: UpdatePolicy,
    value_type: ValueType,
    inputs: Vec<ModuleInput>,
) -> Module {
    Module {
        name: name.to_string(),
        binary_index: 0,
        binary_entrypoint: name.to_string(),
        initial_block,
        kind: ModuleKind::Store {
            update_policy,
            value_type,
        },
        inputs,
    }
}

pub fn module_set(modules: Vec<Module>) -> ModuleSet {
    ModuleSet {
        binaries: vec![Binary {
            content: b"native-test-binary".to_vec(),
        }],
        modules,
    }
}

/// Request details for a subrequest-style run over `[start, stop)`.
pub fn subrequest_details(set: &ModuleSet, output_module: &str, start: u64, stop: u64) -> RequestDetails {
    RequestDetails {
        modules: set.clone(),
        output_module: output_module.to_string(),
        production_mode: true,
        is_subrequest: true,
        stop_block_num: stop,
        debug_initial_store_snapshot_for_modules: Vec::new(),
        resolved_start_block_num: start,
        linear_handoff_block_num: stop,
    }
}

/// Request details for a tier-1 style linear run.
pub fn linear_details(
    set: &ModuleSet,
    output_module: &str,
    start: u64,
    stop: u64,
    production_mode: bool,
) -> RequestDetails {
    RequestDetails {
        modules: set.clone(),
        output_module: output_module.to_string(),
        production_mode,
        is_subrequest: false,
        stop_block_num: stop,
        debug_initial_store_snapshot_for_modules: Vec::new(),
        resolved_start_block_num: start,
        linear_handoff_block_num: start,
    }
}
