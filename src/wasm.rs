//! Sandbox host: loads module bytecode, instantiates it with the engine's
//! host imports, and invokes entrypoints under a fuel limit.
//!
//! The guest ABI is deliberately small: modules export `memory` and an
//! `alloc` function, receive their inputs as `(ptr, len)` pairs, and talk
//! back through the `env` imports (`output`, `println`, and the `state_*`
//! store externs).

use wasmtime::{Caller, Config, Engine, Func, Linker, Store, Val};

use crate::error::{EngineError, EngineResult};
use crate::manifest::UpdatePolicy;
use crate::store::StoreHandle;

/// Computational budget per entrypoint invocation.
const FUEL_PER_CALL: u64 = 100_000_000;

/// Logs collected past this many bytes are dropped and flagged truncated.
pub const MAX_LOG_BYTE_COUNT: usize = 128 * 1024;

pub struct Runtime {
    engine: Engine,
}

impl Runtime {
    pub fn new() -> EngineResult<Self> {
        let mut config = Config::new();
        config.consume_fuel(true);
        let engine = Engine::new(&config).map_err(sandbox_error)?;
        Ok(Self { engine })
    }

    /// Compiles one binary. Compiled modules are shared by every instance
    /// built from the same binary index.
    pub fn load(&self, code: &[u8]) -> EngineResult<WasmModule> {
        let module = wasmtime::Module::new(&self.engine, code).map_err(sandbox_error)?;
        Ok(WasmModule { module })
    }

    pub fn instantiate(
        &self,
        module: &WasmModule,
        module_name: &str,
        entrypoint: &str,
    ) -> EngineResult<Instance> {
        let mut store = Store::new(&self.engine, CallContext::default());
        let mut linker: Linker<CallContext> = Linker::new(&self.engine);
        register_host_functions(&mut linker).map_err(sandbox_error)?;

        let instance = linker
            .instantiate(&mut store, &module.module)
            .map_err(sandbox_error)?;
        let entrypoint_func = instance
            .get_func(&mut store, entrypoint)
            .ok_or_else(|| EngineError::Sandbox {
                reason: format!("module {module_name:?} does not export entrypoint {entrypoint:?}"),
            })?;

        Ok(Instance {
            store,
            instance,
            entrypoint: entrypoint_func,
            module_name: module_name.to_string(),
        })
    }
}

pub struct WasmModule {
    module: wasmtime::Module,
}

/// Store handles bound to one instance for the duration of one block.
#[derive(Default)]
pub struct CallContext {
    logs: Vec<String>,
    logs_bytes: usize,
    logs_truncated: bool,
    output: Option<Vec<u8>>,
    writer: Option<StoreHandle>,
    readers: Vec<StoreHandle>,
    fatal: Option<EngineError>,
}

impl CallContext {
    fn append_log(&mut self, line: String) {
        if self.logs_bytes + line.len() > MAX_LOG_BYTE_COUNT {
            self.logs_truncated = true;
            return;
        }
        self.logs_bytes += line.len();
        self.logs.push(line);
    }
}

/// Result of one entrypoint invocation.
#[derive(Debug)]
pub struct CallResult {
    pub output: Option<Vec<u8>>,
    pub logs: Vec<String>,
    pub logs_truncated: bool,
}

pub struct Instance {
    store: Store<CallContext>,
    instance: wasmtime::Instance,
    entrypoint: Func,
    module_name: String,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("module_name", &self.module_name)
            .finish()
    }
}

impl Instance {
    /// Resets per-call state and binds the block's store handles.
    pub fn begin_call(&mut self, writer: Option<StoreHandle>, readers: Vec<StoreHandle>) {
        *self.store.data_mut() = CallContext {
            writer,
            readers,
            ..CallContext::default()
        };
    }

    /// Invokes the entrypoint with each input marshaled into guest memory
    /// as a `(ptr, len)` pair.
    pub fn invoke(&mut self, inputs: &[Vec<u8>]) -> EngineResult<CallResult> {
        self.store
            .set_fuel(FUEL_PER_CALL)
            .map_err(sandbox_error)?;

        let mut params = Vec::with_capacity(inputs.len() * 2);
        for input in inputs {
            let (ptr, len) = self.write_to_guest(input)?;
            params.push(Val::I32(ptr));
            params.push(Val::I32(len));
        }

        let call_result = self
            .entrypoint
            .call(&mut self.store, &params, &mut []);

        let ctx = self.store.data_mut();
        if let Some(fatal) = ctx.fatal.take() {
            return Err(fatal);
        }
        if let Err(trap) = call_result {
            return Err(EngineError::ModuleExecution {
                module: self.module_name.clone(),
                reason: format!("{trap:#}"),
                logs: std::mem::take(&mut ctx.logs),
            });
        }

        Ok(CallResult {
            output: ctx.output.take(),
            logs: std::mem::take(&mut ctx.logs),
            logs_truncated: ctx.logs_truncated,
        })
    }

    fn write_to_guest(&mut self, bytes: &[u8]) -> EngineResult<(i32, i32)> {
        let alloc = self
            .instance
            .get_typed_func::<i32, i32>(&mut self.store, "alloc")
            .map_err(|_| EngineError::Sandbox {
                reason: format!(
                    "module {:?} must export an `alloc(i32) -> i32` function",
                    self.module_name
                ),
            })?;
        let ptr = alloc
            .call(&mut self.store, bytes.len() as i32)
            .map_err(sandbox_error)?;
        let memory = self
            .instance
            .get_memory(&mut self.store, "memory")
            .ok_or_else(|| EngineError::Sandbox {
                reason: format!("module {:?} must export `memory`", self.module_name),
            })?;
        memory
            .write(&mut self.store, ptr as usize, bytes)
            .map_err(sandbox_error)?;
        Ok((ptr, bytes.len() as i32))
    }
}

fn sandbox_error(err: impl std::fmt::Display) -> EngineError {
    EngineError::Sandbox {
        reason: format!("{err:#}"),
    }
}

type HostResult<T> = Result<T, wasmtime::Error>;

fn register_host_functions(linker: &mut Linker<CallContext>) -> HostResult<()> {
    linker.func_wrap(
        "env",
        "println",
        |mut caller: Caller<'_, CallContext>, ptr: i32, len: i32| -> HostResult<()> {
            let raw = read_guest_bytes(&mut caller, ptr, len)?;
            let line = String::from_utf8_lossy(&raw).into_owned();
            caller.data_mut().append_log(line);
            Ok(())
        },
    )?;

    linker.func_wrap(
        "env",
        "output",
        |mut caller: Caller<'_, CallContext>, ptr: i32, len: i32| -> HostResult<()> {
            let raw = read_guest_bytes(&mut caller, ptr, len)?;
            caller.data_mut().output = Some(raw);
            Ok(())
        },
    )?;

    register_writer(linker, "state_set", UpdatePolicy::Set, |base, ord, k, v| {
        base.set(ord, k, v)
    })?;
    register_writer(
        linker,
        "state_set_if_not_exists",
        UpdatePolicy::SetIfNotExists,
        |base, ord, k, v| base.set_if_not_exists(ord, k, v),
    )?;
    register_writer(linker, "state_add", UpdatePolicy::Add, |base, ord, k, v| {
        base.add(ord, k, v)
    })?;
    register_writer(linker, "state_min", UpdatePolicy::Min, |base, ord, k, v| {
        base.set_min(ord, k, v)
    })?;
    register_writer(linker, "state_max", UpdatePolicy::Max, |base, ord, k, v| {
        base.set_max(ord, k, v)
    })?;
    register_writer(
        linker,
        "state_append",
        UpdatePolicy::Append,
        |base, ord, k, v| base.append(ord, k, v),
    )?;

    linker.func_wrap(
        "env",
        "state_delete_prefix",
        |mut caller: Caller<'_, CallContext>, ord: i64, ptr: i32, len: i32| -> HostResult<()> {
            let prefix = read_guest_bytes(&mut caller, ptr, len)?;
            let Some(writer) = caller.data().writer.clone() else {
                return Err(wasmtime::Error::msg("module has no writable store"));
            };
            let result = writer.write().base_mut().delete_prefix(ord as u64, &prefix);
            propagate_store_result(&mut caller, result)
        },
    )?;

    register_reader(linker, "state_get_last", |base, key, _ord| {
        base.get_last(key).map(<[u8]>::to_vec)
    })?;
    register_reader(linker, "state_get_first", |base, key, _ord| {
        base.get_first(key)
    })?;

    linker.func_wrap(
        "env",
        "state_get_at",
        |mut caller: Caller<'_, CallContext>,
         store_idx: i32,
         ord: i64,
         kptr: i32,
         klen: i32,
         output_ptr: i32|
         -> HostResult<i32> {
            let key = read_guest_bytes(&mut caller, kptr, klen)?;
            let reader = reader_at(&caller, store_idx)?;
            let found = reader.read().base().get_at(&key, ord as u64);
            match found {
                Some(value) => {
                    write_back_to_guest(&mut caller, &value, output_ptr)?;
                    Ok(1)
                }
                None => Ok(0),
            }
        },
    )?;

    Ok(())
}

fn register_writer(
    linker: &mut Linker<CallContext>,
    name: &str,
    expected_policy: UpdatePolicy,
    op: fn(&mut crate::store::base::BaseStore, u64, &[u8], &[u8]) -> EngineResult<()>,
) -> HostResult<()> {
    linker.func_wrap(
        "env",
        name,
        move |mut caller: Caller<'_, CallContext>,
              ord: i64,
              kptr: i32,
              klen: i32,
              vptr: i32,
              vlen: i32|
              -> HostResult<()> {
            let key = read_guest_bytes(&mut caller, kptr, klen)?;
            let value = read_guest_bytes(&mut caller, vptr, vlen)?;

            let Some(writer) = caller.data().writer.clone() else {
                return Err(wasmtime::Error::msg("module has no writable store"));
            };
            {
                let guard = writer.read();
                if guard.base().update_policy() != expected_policy {
                    return Err(wasmtime::Error::msg(format!(
                        "store {:?} has update policy {:?}, refused a {:?} write",
                        guard.base().name(),
                        guard.base().update_policy().as_str(),
                        expected_policy.as_str(),
                    )));
                }
            }
            let result = op(writer.write().base_mut(), ord as u64, &key, &value);
            propagate_store_result(&mut caller, result)
        },
    )?;
    Ok(())
}

fn register_reader(
    linker: &mut Linker<CallContext>,
    name: &str,
    read: fn(&crate::store::base::BaseStore, &[u8], u64) -> Option<Vec<u8>>,
) -> HostResult<()> {
    linker.func_wrap(
        "env",
        name,
        move |mut caller: Caller<'_, CallContext>,
              store_idx: i32,
              kptr: i32,
              klen: i32,
              output_ptr: i32|
              -> HostResult<i32> {
            let key = read_guest_bytes(&mut caller, kptr, klen)?;
            let reader = reader_at(&caller, store_idx)?;
            let found = {
                let guard = reader.read();
                read(guard.base(), &key, 0)
            };
            match found {
                Some(value) => {
                    write_back_to_guest(&mut caller, &value, output_ptr)?;
                    Ok(1)
                }
                None => Ok(0),
            }
        },
    )?;
    Ok(())
}

/// Fatal store conditions cross the sandbox boundary as traps; the original
/// error is parked on the context so the executor can surface it verbatim.
fn propagate_store_result(
    caller: &mut Caller<'_, CallContext>,
    result: EngineResult<()>,
) -> HostResult<()> {
    match result {
        Ok(()) => Ok(()),
        Err(err) => {
            let message = err.to_string();
            caller.data_mut().fatal = Some(err);
            Err(wasmtime::Error::msg(message))
        }
    }
}

fn reader_at(caller: &Caller<'_, CallContext>, store_idx: i32) -> HostResult<StoreHandle> {
    caller
        .data()
        .readers
        .get(store_idx as usize)
        .cloned()
        .ok_or_else(|| {
            wasmtime::Error::msg(format!("no store reader bound at index {store_idx}"))
        })
}

fn read_guest_bytes(
    caller: &mut Caller<'_, CallContext>,
    ptr: i32,
    len: i32,
) -> HostResult<Vec<u8>> {
    let memory = caller
        .get_export("memory")
        .and_then(|e| e.into_memory())
        .ok_or_else(|| wasmtime::Error::msg("module must export memory"))?;
    let mut buf = vec![0u8; len as usize];
    memory.read(&mut *caller, ptr as usize, &mut buf)?;
    Ok(buf)
}

/// Writes `bytes` into guest memory via the guest's own allocator, then
/// stores the `(ptr, len)` pair at `output_ptr`.
fn write_back_to_guest(
    caller: &mut Caller<'_, CallContext>,
    bytes: &[u8],
    output_ptr: i32,
) -> HostResult<()> {
    let alloc = caller
        .get_export("alloc")
        .and_then(|e| e.into_func())
        .ok_or_else(|| wasmtime::Error::msg("module must export alloc"))?
        .typed::<i32, i32>(&mut *caller)?;
    let ptr = alloc.call(&mut *caller, bytes.len() as i32)?;

    let memory = caller
        .get_export("memory")
        .and_then(|e| e.into_memory())
        .ok_or_else(|| wasmtime::Error::msg("module must export memory"))?;
    memory.write(&mut *caller, ptr as usize, bytes)?;

    let mut pair = [0u8; 8];
    pair[0..4].copy_from_slice(&(ptr as u32).to_le_bytes());
    pair[4..8].copy_from_slice(&(bytes.len() as u32).to_le_bytes());
    memory.write(&mut *caller, output_ptr as usize, &pair)?;
    Ok(())
}
