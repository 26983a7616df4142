//! Bridge runtime implementation using wasmtime.
//!
//! Uses wasmtime-wasi preview1 so modules that also import WASI link cleanly.

use super::abi;
use super::config::{BridgeConfig, WasiCapabilities};
use super::guest::{trap_error, GuestCx, GuestExports};
use super::imports::BridgeImports;
use crate::closure::{Completion, FinalizationQueue, HostClosure};
use crate::codec::{self, GuestSlice};
use crate::error::{BridgeError, Result};
use crate::heap::{Handle, HandleTable};
use crate::host::{HostFunctions, TaskQueue};
use crate::memory::{ViewCache, ViewKind};
use crate::value::HostValue;

use std::path::Path;
use std::time::Instant;

use wasmtime::*;

/// Per-instance state living in the wasmtime store.
pub struct BridgeState {
    pub(crate) heap: HandleTable,
    pub(crate) views: ViewCache,
    pub(crate) exports: Option<GuestExports>,
    pub(crate) finalizers: FinalizationQueue,
    pub(crate) host_fns: HostFunctions,
    pub(crate) tasks: TaskQueue,
    preview1: wasmtime_wasi::preview1::WasiP1Ctx,
    limits: StoreLimits,
}

impl BridgeState {
    /// Get the preview1 context.
    fn preview1(&mut self) -> &mut wasmtime_wasi::preview1::WasiP1Ctx {
        &mut self.preview1
    }
}

/// Engine plus configuration; creates bridged instances.
pub struct Bridge {
    engine: Engine,
    config: BridgeConfig,
    host_fns: HostFunctions,
}

/// A compiled module.
pub struct BridgeModule {
    module: Module,
    name: String,
}

/// An instantiated module wired to the bridge.
pub struct BridgeInstance {
    store: Store<BridgeState>,
    instance: Instance,
    task_budget: Option<usize>,
}

/// Result of a call into the module with timing information.
#[derive(Debug, Clone)]
pub struct CallResult<T> {
    /// The return value
    pub value: T,
    /// Execution time in microseconds
    pub execution_time_us: u64,
    /// Fuel consumed (if fuel metering enabled)
    pub fuel_consumed: Option<u64>,
}

/// Snapshot of an instance's bridge bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct InstanceStats {
    /// Live, non-sentinel handles
    pub live_handles: usize,
    /// Slots ever allocated, sentinels included
    pub handle_capacity: usize,
    /// Closure calls waiting on the host loop
    pub pending_tasks: usize,
    /// Destructors waiting for the next call boundary
    pub pending_finalizers: usize,
    /// Current linear memory size in bytes
    pub memory_bytes: usize,
    /// View rebuilds per kind, in [`ViewKind::ALL`] order
    pub view_rebuilds: [u64; 5],
}

/// One import or export of a module, as listed by [`BridgeModule::inspect`].
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ImportInfo {
    /// Import module
    pub module: String,
    /// Field name
    pub name: String,
    /// Whether the bridge linker resolves it
    pub provided: bool,
}

/// Compatibility report for a module.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ModuleReport {
    /// Module name
    pub name: String,
    /// Every import
    pub imports: Vec<ImportInfo>,
    /// Every export name
    pub exports: Vec<String>,
    /// Required exports the module lacks
    pub missing_exports: Vec<&'static str>,
    /// Optional bridge exports the module provides
    pub optional_exports: Vec<&'static str>,
}

impl ModuleReport {
    /// True if the module can be instantiated by the bridge.
    pub fn is_compatible(&self) -> bool {
        self.missing_exports.is_empty() && self.imports.iter().all(|i| i.provided)
    }
}

impl Bridge {
    /// Create a new bridge with the given configuration.
    pub fn new(config: BridgeConfig) -> Result<Self> {
        let mut engine_config = Config::new();

        engine_config.cranelift_opt_level(match config.optimization_level {
            0 => OptLevel::None,
            _ => OptLevel::Speed,
        });
        engine_config.wasm_simd(config.enable_simd);

        if config.fuel_limit.is_some() {
            engine_config.consume_fuel(true);
        }

        if let Some(ref cache_path) = config.cache_path {
            if let Err(e) = engine_config.cache_config_load(cache_path) {
                tracing::warn!("Failed to load cache config: {}", e);
            }
        }

        let engine = Engine::new(&engine_config)
            .map_err(|e| BridgeError::Wasm(format!("engine creation failed: {}", e)))?;

        Ok(Self {
            engine,
            config,
            host_fns: HostFunctions::with_builtins(),
        })
    }

    /// Builder: replace the host function registry.
    pub fn with_host_functions(mut self, host_fns: HostFunctions) -> Self {
        self.host_fns = host_fns;
        self
    }

    /// Registry used for instances created from now on.
    pub fn host_functions_mut(&mut self) -> &mut HostFunctions {
        &mut self.host_fns
    }

    /// Load a module from a file (binary or text format).
    pub fn load_module(&self, path: impl AsRef<Path>) -> Result<BridgeModule> {
        let path = path.as_ref();
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("unknown")
            .to_string();

        let module = Module::from_file(&self.engine, path)
            .map_err(|e| BridgeError::Wasm(format!("module load failed: {}", e)))?;

        Ok(BridgeModule { module, name })
    }

    /// Load a module from bytes (binary or text format).
    pub fn load_module_bytes(&self, name: &str, bytes: impl AsRef<[u8]>) -> Result<BridgeModule> {
        let module = Module::new(&self.engine, bytes)
            .map_err(|e| BridgeError::Wasm(format!("module creation failed: {}", e)))?;

        Ok(BridgeModule {
            module,
            name: name.to_string(),
        })
    }

    /// Instantiate a module and resolve its bridge exports.
    ///
    /// Does not call `start`; see [`BridgeInstance::start`].
    pub fn instantiate(&self, module: &BridgeModule) -> Result<BridgeInstance> {
        let state = self.build_state(&self.config.capabilities)?;
        let mut store = Store::new(&self.engine, state);

        store.limiter(|state| &mut state.limits);

        if let Some(fuel) = self.config.fuel_limit {
            store
                .set_fuel(fuel)
                .map_err(|e| BridgeError::Wasm(format!("fuel setup failed: {}", e)))?;
        }

        let mut linker: Linker<BridgeState> = Linker::new(&self.engine);
        wasmtime_wasi::preview1::add_to_linker_sync(&mut linker, |state| state.preview1())
            .map_err(|e| BridgeError::Wasm(format!("WASI link failed: {}", e)))?;
        BridgeImports::register(&mut linker)?;

        let instance = linker
            .instantiate(&mut store, &module.module)
            .map_err(|e| trap_error("instantiation", e))?;

        let exports = GuestExports::resolve(&instance, &mut store)?;
        store.data_mut().exports = Some(exports);

        tracing::debug!(module = %module.name, "bridge instance created");
        Ok(BridgeInstance {
            store,
            instance,
            task_budget: self.config.task_budget,
        })
    }

    /// Build store state from capabilities.
    fn build_state(&self, caps: &WasiCapabilities) -> Result<BridgeState> {
        let mut builder = wasmtime_wasi::WasiCtxBuilder::new();

        if caps.stdin {
            builder.inherit_stdin();
        }
        if caps.stdout {
            builder.inherit_stdout();
        }
        if caps.stderr {
            builder.inherit_stderr();
        }

        for (key, value) in &caps.env_vars {
            builder.env(key, value);
        }

        builder.args(&caps.args);

        for dir in &caps.preopened_dirs_ro {
            builder
                .preopened_dir(
                    dir,
                    dir.to_string_lossy(),
                    wasmtime_wasi::DirPerms::READ,
                    wasmtime_wasi::FilePerms::READ,
                )
                .map_err(|e| BridgeError::Wasm(format!("failed to open dir {:?}: {}", dir, e)))?;
        }

        for dir in &caps.preopened_dirs_rw {
            builder
                .preopened_dir(
                    dir,
                    dir.to_string_lossy(),
                    wasmtime_wasi::DirPerms::all(),
                    wasmtime_wasi::FilePerms::all(),
                )
                .map_err(|e| BridgeError::Wasm(format!("failed to open dir {:?}: {}", dir, e)))?;
        }

        let preview1 = builder.build_p1();

        let limits = StoreLimitsBuilder::new()
            .memory_size(self.config.max_memory)
            .build();

        let heap = match self.config.max_handles {
            Some(max) => HandleTable::new().limit(max),
            None => HandleTable::new(),
        };

        Ok(BridgeState {
            heap,
            views: ViewCache::new(),
            exports: None,
            finalizers: FinalizationQueue::new(),
            host_fns: self.host_fns.clone(),
            tasks: TaskQueue::new(),
            preview1,
            limits,
        })
    }

    /// Get the configuration.
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }
}

impl BridgeModule {
    /// Get the module name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get exported function names.
    pub fn exports(&self) -> impl Iterator<Item = &str> {
        self.module.exports().filter_map(|e| {
            if matches!(e.ty(), ExternType::Func(_)) {
                Some(e.name())
            } else {
                None
            }
        })
    }

    /// List imports and exports and check them against the bridge ABI.
    pub fn inspect(&self) -> ModuleReport {
        let imports = self
            .module
            .imports()
            .map(|i| ImportInfo {
                module: i.module().to_string(),
                name: i.name().to_string(),
                provided: abi::is_provided(i.module(), i.name()),
            })
            .collect();
        let exports: Vec<String> = self.module.exports().map(|e| e.name().to_string()).collect();
        let has = |name: &str| exports.iter().any(|e| e == name);

        ModuleReport {
            name: self.name.clone(),
            missing_exports: abi::REQUIRED_EXPORTS
                .iter()
                .copied()
                .filter(|name| !has(name))
                .collect(),
            optional_exports: abi::OPTIONAL_EXPORTS
                .iter()
                .copied()
                .filter(|name| has(name))
                .collect(),
            imports,
            exports,
        }
    }
}

impl BridgeInstance {
    fn timed<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<CallResult<T>> {
        let start = Instant::now();
        let fuel_before = self.store.get_fuel().ok();

        let value = f(self)?;

        let fuel_after = self.store.get_fuel().ok();
        let fuel_consumed = fuel_before.zip(fuel_after).map(|(b, a)| b - a);

        Ok(CallResult {
            value,
            execution_time_us: start.elapsed().as_micros() as u64,
            fuel_consumed,
        })
    }

    /// Call the module's `start` export. Returns `false` if it has none.
    pub fn start(&mut self) -> Result<CallResult<bool>> {
        self.timed(|this| {
            let started = GuestCx::new(&mut this.store)?.start()?;
            this.run_finalizers()?;
            Ok(started)
        })
    }

    /// Call a zero-argument, no-result export by name.
    pub fn call(&mut self, name: &str) -> Result<CallResult<()>> {
        let instance = self.instance;
        self.timed(|this| {
            GuestCx::new(&mut this.store)?.call_export(&instance, name)?;
            this.run_finalizers()?;
            Ok(())
        })
    }

    /// Invoke a closure from the host with argument values.
    ///
    /// The arguments become fresh handles owned by the module. A trap inside
    /// the closure is delivered to the module's error sink as an `Error`
    /// value and reported as [`Completion::Trapped`].
    pub fn invoke(&mut self, closure: &HostClosure, args: Vec<HostValue>) -> Result<Completion> {
        if args.len() != closure.arity().count() {
            return Err(BridgeError::ArityMismatch {
                expected: closure.arity().count(),
                got: args.len(),
            });
        }
        if closure.is_destroyed() || closure.is_running() {
            return Err(BridgeError::ClosureUnavailable);
        }
        let mut handles = Vec::with_capacity(args.len());
        for arg in args {
            handles.push(self.store.data_mut().heap.add(arg)?.as_raw());
        }

        let mut cx = GuestCx::new(&mut self.store)?;
        let completion = closure.invoke(&mut cx, &handles)?;
        if let Completion::Trapped(err) = &completion {
            tracing::debug!(error = %err, "closure trapped");
            cx.raise(HostValue::error("Error", err.to_string()))?;
        }
        self.run_finalizers()?;
        Ok(completion)
    }

    /// Drain the host task queue in FIFO order, then run finalizers.
    ///
    /// Tasks queued while draining run in the same pass, up to the
    /// configured task budget. Returns how many tasks dispatched; tasks
    /// whose closure was destroyed are skipped and do not use the budget.
    pub fn run_until_idle(&mut self) -> Result<usize> {
        let mut ran = 0;
        while self.task_budget.map_or(true, |max| ran < max) {
            let Some(task) = self.store.data_mut().tasks.pop() else {
                break;
            };
            match self.invoke(&task.closure, task.args) {
                Ok(_) => ran += 1,
                Err(BridgeError::ClosureUnavailable) => {
                    tracing::debug!("skipping task for a closure that is gone");
                }
                Err(e) => return Err(e),
            }
        }
        self.run_finalizers()?;
        Ok(ran)
    }

    /// Run destructors for closures the host forgot.
    pub fn run_finalizers(&mut self) -> Result<usize> {
        let queue = self.store.data().finalizers.clone();
        if queue.is_empty() {
            return Ok(0);
        }
        let mut cx = GuestCx::new(&mut self.store)?;
        queue.run(&mut cx)
    }

    /// Park a host value and return its handle.
    pub fn add_value(&mut self, value: HostValue) -> Result<Handle> {
        self.store.data_mut().heap.add(value)
    }

    /// Clone the value behind a handle.
    pub fn value(&self, handle: Handle) -> Result<HostValue> {
        self.store.data().heap.get(handle).cloned()
    }

    /// Release a handle and return its value.
    pub fn take_value(&mut self, handle: Handle) -> Result<HostValue> {
        self.store.data_mut().heap.take(handle)
    }

    /// The instance's handle table.
    pub fn heap(&self) -> &HandleTable {
        &self.store.data().heap
    }

    /// Copy a string into a fresh module allocation.
    pub fn encode_str(&mut self, s: &str) -> Result<GuestSlice> {
        codec::encode_str(&mut GuestCx::new(&mut self.store)?, s)
    }

    /// Decode a UTF-8 range of module memory.
    pub fn decode_str(&mut self, ptr: u32, len: u32) -> Result<String> {
        codec::decode_str(&mut GuestCx::new(&mut self.store)?, ptr, len)
    }

    /// Write bytes to module memory at the given offset.
    pub fn write_memory(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        use crate::memory::LinearMemory;
        GuestCx::new(&mut self.store)?.u8_view()?.set(offset, data)
    }

    /// Read bytes from module memory at the given offset.
    pub fn read_memory(&mut self, offset: u32, len: u32) -> Result<Vec<u8>> {
        codec::read_bytes(&mut GuestCx::new(&mut self.store)?, offset, len)
    }

    /// Get remaining fuel (if fuel metering enabled).
    pub fn remaining_fuel(&self) -> Option<u64> {
        self.store.get_fuel().ok()
    }

    /// True if the module exports an error sink.
    pub fn has_error_sink(&self) -> bool {
        self.store
            .data()
            .exports
            .as_ref()
            .is_some_and(GuestExports::has_error_sink)
    }

    /// Bookkeeping snapshot.
    pub fn stats(&self) -> InstanceStats {
        let state = self.store.data();
        let memory_bytes = state
            .exports
            .as_ref()
            .map_or(0, |e| e.memory.data_size(&self.store));
        InstanceStats {
            live_handles: state.heap.live(),
            handle_capacity: state.heap.capacity(),
            pending_tasks: state.tasks.len(),
            pending_finalizers: state.finalizers.len(),
            memory_bytes,
            view_rebuilds: ViewKind::ALL.map(|kind| state.views.rebuilds(kind)),
        }
    }
}
