//! The guest side of the bridge, as seen from wasmtime.
//!
//! [`GuestCx`] pairs a store (either the embedder's `Store` or the `Caller`
//! inside an import) with the module's cached exports, and implements the
//! core traits on top of them: views over the exported memory, the
//! allocator, and closure dispatch. Every call into the module bumps the
//! view generation.

use wasmtime::{AsContextMut, Caller, Instance, Memory, Store, TypedFunc};

use super::abi;
use super::runtime::BridgeState;
use crate::closure::{Arity, DestructorId, Dispatcher};
use crate::codec::Guest;
use crate::error::{BridgeError, Result};
use crate::memory::{LinearMemory, ViewCache};
use crate::value::HostValue;

/// Store handles that can reach the bridge state.
pub(crate) trait StoreAccess: AsContextMut<Data = BridgeState> {
    fn state(&mut self) -> &mut BridgeState;
}

impl StoreAccess for Store<BridgeState> {
    fn state(&mut self) -> &mut BridgeState {
        self.data_mut()
    }
}

impl StoreAccess for Caller<'_, BridgeState> {
    fn state(&mut self) -> &mut BridgeState {
        self.data_mut()
    }
}

/// Turn a wasmtime error back into a bridge error, keeping bridge errors
/// raised by imports intact.
pub(crate) fn trap_error(export: &str, err: wasmtime::Error) -> BridgeError {
    match err.downcast::<BridgeError>() {
        Ok(bridge) => bridge,
        Err(err) => BridgeError::Wasm(format!("{} trapped: {:#}", export, err)),
    }
}

/// Exports resolved once after instantiation.
#[derive(Clone)]
pub(crate) struct GuestExports {
    pub memory: Memory,
    malloc: TypedFunc<(u32, u32), u32>,
    realloc: Option<TypedFunc<(u32, u32, u32, u32), u32>>,
    free: Option<TypedFunc<(u32, u32, u32), ()>>,
    exn_store: Option<TypedFunc<u32, ()>>,
    call0: Option<TypedFunc<(u32, u32), ()>>,
    call1: Option<TypedFunc<(u32, u32, u32), ()>>,
    call2: Option<TypedFunc<(u32, u32, u32, u32), ()>>,
    call3: Option<TypedFunc<(u32, u32, u32, u32, u32), ()>>,
    closure_destroy: Option<TypedFunc<(u32, u32, u32), ()>>,
    pub start: Option<TypedFunc<(), ()>>,
}

fn optional<P, R>(
    instance: &Instance,
    store: &mut Store<BridgeState>,
    name: &str,
) -> Result<Option<TypedFunc<P, R>>>
where
    P: wasmtime::WasmParams,
    R: wasmtime::WasmResults,
{
    match instance.get_func(&mut *store, name) {
        None => Ok(None),
        Some(func) => func
            .typed::<P, R>(&*store)
            .map(Some)
            .map_err(|e| {
                BridgeError::Wasm(format!("export '{}' has the wrong signature: {}", name, e))
            }),
    }
}

impl GuestExports {
    pub fn resolve(instance: &Instance, store: &mut Store<BridgeState>) -> Result<Self> {
        let memory = instance
            .get_memory(&mut *store, abi::MEMORY)
            .ok_or(BridgeError::MissingExport(abi::MEMORY))?;
        let malloc = optional(instance, store, abi::MALLOC)?
            .ok_or(BridgeError::MissingExport(abi::MALLOC))?;

        Ok(Self {
            memory,
            malloc,
            realloc: optional(instance, store, abi::REALLOC)?,
            free: optional(instance, store, abi::FREE)?,
            exn_store: optional(instance, store, abi::EXN_STORE)?,
            call0: optional(instance, store, Arity::Zero.export_name())?,
            call1: optional(instance, store, Arity::One.export_name())?,
            call2: optional(instance, store, Arity::Two.export_name())?,
            call3: optional(instance, store, Arity::Three.export_name())?,
            closure_destroy: optional(instance, store, abi::CLOSURE_DESTROY)?,
            start: optional(instance, store, abi::START)?,
        })
    }

    pub fn has_error_sink(&self) -> bool {
        self.exn_store.is_some()
    }
}

/// A store borrowed together with the module's exports.
pub(crate) struct GuestCx<'s, S: StoreAccess> {
    store: &'s mut S,
    exports: GuestExports,
}

impl<'s, S: StoreAccess> GuestCx<'s, S> {
    /// Fails until the instance finished resolving its exports, which is the
    /// case for imports called from a wasm start section.
    pub fn new(store: &'s mut S) -> Result<Self> {
        let exports = store
            .state()
            .exports
            .clone()
            .ok_or(BridgeError::MissingExport(abi::MEMORY))?;
        Ok(Self { store, exports })
    }

    pub fn state(&mut self) -> &mut BridgeState {
        self.store.state()
    }

    fn returned<T>(&mut self, export: &str, result: wasmtime::Result<T>) -> Result<T> {
        self.state().views.invalidate();
        result.map_err(|e| trap_error(export, e))
    }

    /// Run the module's `start` export, if any.
    pub fn start(&mut self) -> Result<bool> {
        let Some(start) = self.exports.start.clone() else {
            return Ok(false);
        };
        let result = start.call(&mut *self.store, ());
        self.returned(abi::START, result)?;
        Ok(true)
    }

    /// Call a zero-argument export by name.
    pub fn call_export(&mut self, instance: &Instance, name: &str) -> Result<()> {
        let func = instance
            .get_typed_func::<(), ()>(&mut *self.store, name)
            .map_err(|e| BridgeError::Wasm(format!("function '{}' not found: {}", name, e)))?;
        let result = func.call(&mut *self.store, ());
        self.returned(name, result)
    }

    /// Deliver a host exception to the module's error sink.
    ///
    /// Without a sink the exception cannot be observed by the module, so the
    /// call aborts with `Unhandled` instead.
    pub fn raise(&mut self, exception: HostValue) -> Result<()> {
        let Some(sink) = self.exports.exn_store.clone() else {
            return Err(BridgeError::Unhandled(exception.debug_string()));
        };
        tracing::debug!(exception = %exception.debug_string(), "delivering exception to module");
        let handle = self.state().heap.add(exception)?;
        let result = sink.call(&mut *self.store, handle.as_raw());
        self.returned(abi::EXN_STORE, result)
    }
}

impl<S: StoreAccess> LinearMemory for GuestCx<'_, S> {
    fn view_parts(&mut self) -> (&mut ViewCache, Option<&mut [u8]>) {
        let memory = self.exports.memory;
        let (data, state) = memory.data_and_store_mut(self.store.as_context_mut());
        (&mut state.views, Some(data))
    }
}

impl<S: StoreAccess> Guest for GuestCx<'_, S> {
    fn malloc(&mut self, size: u32, align: u32) -> Result<u32> {
        let result = self.exports.malloc.call(&mut *self.store, (size, align));
        self.returned(abi::MALLOC, result)
    }

    fn realloc(&mut self, ptr: u32, old_size: u32, new_size: u32, align: u32) -> Result<u32> {
        let realloc = self
            .exports
            .realloc
            .clone()
            .ok_or(BridgeError::MissingExport(abi::REALLOC))?;
        let result = realloc.call(&mut *self.store, (ptr, old_size, new_size, align));
        self.returned(abi::REALLOC, result)
    }

    fn free(&mut self, ptr: u32, size: u32, align: u32) -> Result<()> {
        // A module without a deallocator leaks by choice.
        let Some(free) = self.exports.free.clone() else {
            return Ok(());
        };
        let result = free.call(&mut *self.store, (ptr, size, align));
        self.returned(abi::FREE, result)
    }

    fn has_realloc(&self) -> bool {
        self.exports.realloc.is_some()
    }
}

impl<S: StoreAccess> Dispatcher for GuestCx<'_, S> {
    fn dispatch(&mut self, arity: Arity, a: u32, b: u32, args: &[u32]) -> Result<()> {
        let missing = || BridgeError::MissingExport(arity.export_name());
        let store = &mut *self.store;
        let result = match (arity, args) {
            (Arity::Zero, []) => self
                .exports
                .call0
                .clone()
                .ok_or_else(missing)?
                .call(store, (a, b)),
            (Arity::One, &[x]) => self
                .exports
                .call1
                .clone()
                .ok_or_else(missing)?
                .call(store, (a, b, x)),
            (Arity::Two, &[x, y]) => self
                .exports
                .call2
                .clone()
                .ok_or_else(missing)?
                .call(store, (a, b, x, y)),
            (Arity::Three, &[x, y, z]) => self
                .exports
                .call3
                .clone()
                .ok_or_else(missing)?
                .call(store, (a, b, x, y, z)),
            _ => {
                return Err(BridgeError::ArityMismatch {
                    expected: arity.count(),
                    got: args.len(),
                })
            }
        };
        self.returned(arity.export_name(), result)
    }

    fn destroy(&mut self, a: u32, b: u32, dtor: DestructorId) -> Result<()> {
        let destroy = self
            .exports
            .closure_destroy
            .clone()
            .ok_or(BridgeError::MissingExport(abi::CLOSURE_DESTROY))?;
        let result = destroy.call(&mut *self.store, (a, b, dtor.0));
        self.returned(abi::CLOSURE_DESTROY, result)
    }
}

/// How an import adapter fails.
pub(crate) enum Fault {
    /// A host exception the module should observe through its error sink.
    Throw(HostValue),
    /// A bridge failure that aborts the current call.
    Abort(BridgeError),
}

impl From<BridgeError> for Fault {
    fn from(err: BridgeError) -> Self {
        Fault::Abort(err)
    }
}

impl<S: StoreAccess> GuestCx<'_, S> {
    /// Settle an adapter result: exceptions go to the error sink and the
    /// import returns its zero value, aborts become traps.
    pub fn settle<R: Default>(
        &mut self,
        result: std::result::Result<R, Fault>,
    ) -> wasmtime::Result<R> {
        match result {
            Ok(value) => Ok(value),
            Err(Fault::Throw(exception)) => {
                self.raise(exception)?;
                Ok(R::default())
            }
            Err(Fault::Abort(err)) => Err(err.into()),
        }
    }
}
