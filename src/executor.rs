//! Module executors: one per used module, wrapping a sandbox instance and
//! the input wiring it needs at every block.

use std::collections::HashMap;

use crate::api::request::RequestDetails;
use crate::error::{EngineError, EngineResult};
use crate::execout::ExecOutBuffer;
use crate::manifest::{Module, ModuleGraph, ModuleHashes, ModuleInput, ModuleKind, StoreMode};
use crate::store::delta::Delta;
use crate::store::{StoreHandle, StoreMap};
use crate::wasm;

#[derive(Debug, Clone)]
pub enum OutputData {
    Map(Vec<u8>),
    Deltas(Vec<Delta>),
}

#[derive(Debug, Clone)]
pub struct ModuleOutput {
    pub module_name: String,
    pub data: OutputData,
    pub logs: Vec<String>,
    pub logs_truncated: bool,
    pub cached: bool,
}

/// One executable module of the request. The pipeline drives executors in
/// topological order, once per block.
pub trait ModuleExecutor: Send {
    fn name(&self) -> &str;
    fn is_store(&self) -> bool;
    fn run(&mut self, buffer: &ExecOutBuffer) -> EngineResult<ModuleOutput>;
}

/// Input wiring resolved once at construction. Store handles are captured
/// here: the stores outlive every executor of the request.
enum InputBinding {
    Source,
    Params(Vec<u8>),
    MapOutput(String),
    StoreDeltas(StoreHandle),
    Reader(StoreHandle),
}

fn resolve_bindings(module: &Module, stores: &StoreMap) -> EngineResult<Vec<InputBinding>> {
    let mut bindings = Vec::with_capacity(module.inputs.len());
    for input in &module.inputs {
        let binding = match input {
            ModuleInput::Source { .. } => InputBinding::Source,
            ModuleInput::Params { value } => InputBinding::Params(value.clone()),
            ModuleInput::Map { module_name } => InputBinding::MapOutput(module_name.clone()),
            ModuleInput::Store { module_name, mode } => {
                let handle = stores.get(module_name).cloned().ok_or_else(|| {
                    EngineError::UnknownModule {
                        name: module_name.clone(),
                    }
                })?;
                match mode {
                    StoreMode::Deltas => InputBinding::StoreDeltas(handle),
                    StoreMode::Get => InputBinding::Reader(handle),
                }
            }
        };
        bindings.push(binding);
    }
    Ok(bindings)
}

struct BoundCall {
    args: Vec<Vec<u8>>,
    readers: Vec<StoreHandle>,
}

fn bind_call(bindings: &[InputBinding], buffer: &ExecOutBuffer) -> EngineResult<BoundCall> {
    let mut args = Vec::new();
    let mut readers = Vec::new();
    for binding in bindings {
        match binding {
            InputBinding::Source => args.push(buffer.source_payload().to_vec()),
            InputBinding::Params(value) => args.push(value.clone()),
            InputBinding::MapOutput(name) => args.push(buffer.get(name)?.to_vec()),
            InputBinding::StoreDeltas(handle) => {
                let deltas = handle.read().base().current_deltas().to_vec();
                args.push(bincode::serialize(&deltas)?);
            }
            InputBinding::Reader(handle) => readers.push(handle.clone()),
        }
    }
    Ok(BoundCall { args, readers })
}

pub struct WasmMapExecutor {
    module_name: String,
    instance: wasm::Instance,
    bindings: Vec<InputBinding>,
}

impl ModuleExecutor for WasmMapExecutor {
    fn name(&self) -> &str {
        &self.module_name
    }

    fn is_store(&self) -> bool {
        false
    }

    fn run(&mut self, buffer: &ExecOutBuffer) -> EngineResult<ModuleOutput> {
        let call = bind_call(&self.bindings, buffer)?;
        self.instance.begin_call(None, call.readers);
        let result = self.instance.invoke(&call.args)?;

        Ok(ModuleOutput {
            module_name: self.module_name.clone(),
            data: OutputData::Map(result.output.unwrap_or_default()),
            logs: result.logs,
            logs_truncated: result.logs_truncated,
            cached: false,
        })
    }
}

pub struct WasmStoreExecutor {
    module_name: String,
    instance: wasm::Instance,
    bindings: Vec<InputBinding>,
    store: StoreHandle,
}

impl ModuleExecutor for WasmStoreExecutor {
    fn name(&self) -> &str {
        &self.module_name
    }

    fn is_store(&self) -> bool {
        true
    }

    fn run(&mut self, buffer: &ExecOutBuffer) -> EngineResult<ModuleOutput> {
        let call = bind_call(&self.bindings, buffer)?;
        self.instance
            .begin_call(Some(self.store.clone()), call.readers);
        let result = self.instance.invoke(&call.args)?;

        let deltas = self.store.read().base().current_deltas().to_vec();
        Ok(ModuleOutput {
            module_name: self.module_name.clone(),
            data: OutputData::Deltas(deltas),
            logs: result.logs,
            logs_truncated: result.logs_truncated,
            cached: false,
        })
    }
}

/// Builds wasm-backed executors for every module the requested output
/// transitively needs, in execution order. Binaries are compiled once and
/// shared across the modules that reference them.
pub fn build_executors(
    runtime: &wasm::Runtime,
    details: &RequestDetails,
    graph: &ModuleGraph,
    hashes: &ModuleHashes,
    stores: &StoreMap,
) -> EngineResult<Vec<Box<dyn ModuleExecutor>>> {
    let used = graph.used_modules(&[details.output_module.as_str()])?;

    let mut compiled: HashMap<usize, wasm::WasmModule> = HashMap::new();
    for module in &used {
        if !compiled.contains_key(&module.binary_index) {
            let binary = details.modules.binary_for(module)?;
            compiled.insert(module.binary_index, runtime.load(&binary.content)?);
        }
    }

    let mut executors: Vec<Box<dyn ModuleExecutor>> = Vec::with_capacity(used.len());
    for module in used {
        let bindings = resolve_bindings(module, stores)?;
        let instance = runtime.instantiate(
            &compiled[&module.binary_index],
            &module.name,
            &module.binary_entrypoint,
        )?;
        tracing::debug!(
            module = %module.name,
            hash = %hashes.get(&module.name)?,
            "executor built"
        );

        match &module.kind {
            ModuleKind::Map { .. } => executors.push(Box::new(WasmMapExecutor {
                module_name: module.name.clone(),
                instance,
                bindings,
            })),
            ModuleKind::Store { .. } => {
                let store = stores.get(&module.name).cloned().ok_or_else(|| {
                    EngineError::UnknownModule {
                        name: module.name.clone(),
                    }
                })?;
                executors.push(Box::new(WasmStoreExecutor {
                    module_name: module.name.clone(),
                    instance,
                    bindings,
                    store,
                }));
            }
        }
    }
    Ok(executors)
}
