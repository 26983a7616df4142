//! Import table offered to bridged modules.
//!
//! Every function takes and returns only integers and floats. Handles are
//! `u32` indices into the instance's handle table; strings and byte arrays
//! travel as `(ptr, len)` pairs and come back through the two-word
//! out-parameter convention.
//!
//! ## Ownership
//!
//! Handle arguments are borrowed unless noted: the module still owns them
//! after the call. Returned handles are owned by the module. `cb_drop`
//! consumes its handle, and `log` frees its string through `tether_free`.
//!
//! ## Import Module
//!
//! ```wat
//! (import "tether" "string_new" (func $string_new (param i32 i32) (result i32)))
//! ```

use std::sync::Arc;

use wasmtime::{Caller, IntoFunc, Linker};

use super::abi;
use super::guest::{Fault, GuestCx};
use super::runtime::BridgeState;
use crate::closure::{Arity, DestructorId, HostClosure};
use crate::codec;
use crate::error::{BridgeError, Result};
use crate::heap::Handle;
use crate::host::HostScope;
use crate::value::{HostError, HostValue, TypedArray};

type Cx<'a, 'c> = GuestCx<'a, Caller<'c, BridgeState>>;

/// Bridge import functions.
///
/// A marker struct organizing registration, like the rest of the runtime
/// the adapters themselves are stateless.
pub struct BridgeImports;

impl BridgeImports {
    /// Register every bridge import with the wasmtime linker.
    pub fn register(linker: &mut Linker<BridgeState>) -> Result<()> {
        Self::register_handles(linker)?;
        Self::register_primitives(linker)?;
        Self::register_type_tests(linker)?;
        Self::register_arrays(linker)?;
        Self::register_json(linker)?;
        Self::register_console(linker)?;
        Self::register_closures(linker)?;
        Self::register_host_calls(linker)?;
        Ok(())
    }

    // ========================================================================
    // Handles
    // ========================================================================

    fn register_handles(linker: &mut Linker<BridgeState>) -> Result<()> {
        link(
            linker,
            "object_drop_ref",
            |mut caller: Caller<'_, BridgeState>, h: u32| -> wasmtime::Result<()> {
                caller.data_mut().heap.drop_ref(Handle::from_raw(h))?;
                Ok(())
            },
        )?;

        link(
            linker,
            "object_clone_ref",
            |mut caller: Caller<'_, BridgeState>, h: u32| -> wasmtime::Result<u32> {
                Ok(caller.data_mut().heap.clone_ref(Handle::from_raw(h))?.as_raw())
            },
        )?;

        Ok(())
    }

    // ========================================================================
    // Strings, numbers, booleans
    // ========================================================================

    fn register_primitives(linker: &mut Linker<BridgeState>) -> Result<()> {
        link(
            linker,
            "string_new",
            |mut caller: Caller<'_, BridgeState>, ptr: u32, len: u32| -> wasmtime::Result<u32> {
                let mut cx = GuestCx::new(&mut caller)?;
                let s = codec::decode_str(&mut cx, ptr, len)?;
                Ok(add(&mut cx, HostValue::from(s))?)
            },
        )?;

        link(
            linker,
            "string_get",
            |mut caller: Caller<'_, BridgeState>, out: u32, h: u32| -> wasmtime::Result<()> {
                let mut cx = GuestCx::new(&mut caller)?;
                let s = match cx.state().heap.get(Handle::from_raw(h))? {
                    HostValue::String(s) => Some(s.clone()),
                    _ => None,
                };
                let slice = s.map(|s| codec::encode_str(&mut cx, &s)).transpose()?;
                codec::write_slice_ret(&mut cx, out, slice)?;
                Ok(())
            },
        )?;

        link(
            linker,
            "number_new",
            |mut caller: Caller<'_, BridgeState>, n: f64| -> wasmtime::Result<u32> {
                Ok(caller.data_mut().heap.add(HostValue::Number(n))?.as_raw())
            },
        )?;

        link(
            linker,
            "number_get",
            |mut caller: Caller<'_, BridgeState>, out: u32, h: u32| -> wasmtime::Result<()> {
                let mut cx = GuestCx::new(&mut caller)?;
                let n = cx.state().heap.get(Handle::from_raw(h))?.as_f64();
                codec::write_number_ret(&mut cx, out, n)?;
                Ok(())
            },
        )?;

        link(
            linker,
            "boolean_get",
            |caller: Caller<'_, BridgeState>, h: u32| -> wasmtime::Result<u32> {
                Ok(match caller.data().heap.get(Handle::from_raw(h))?.as_bool() {
                    Some(true) => 1u32,
                    Some(false) => 0,
                    None => 2,
                })
            },
        )?;

        link(
            linker,
            "debug_string",
            |mut caller: Caller<'_, BridgeState>, out: u32, h: u32| -> wasmtime::Result<()> {
                let mut cx = GuestCx::new(&mut caller)?;
                let rendered = cx.state().heap.get(Handle::from_raw(h))?.debug_string();
                let slice = codec::encode_str(&mut cx, &rendered)?;
                codec::write_slice_ret(&mut cx, out, Some(slice))?;
                Ok(())
            },
        )?;

        Ok(())
    }

    // ========================================================================
    // Type tests
    // ========================================================================

    fn register_type_tests(linker: &mut Linker<BridgeState>) -> Result<()> {
        let tests: [(&str, fn(&HostValue) -> bool); 5] = [
            ("is_undefined", |v| matches!(v, HostValue::Undefined)),
            ("is_null", |v| matches!(v, HostValue::Null)),
            ("is_string", |v| matches!(v, HostValue::String(_))),
            ("is_object", HostValue::is_object),
            ("is_function", |v| matches!(v, HostValue::Function(_))),
        ];
        for (name, test) in tests {
            link(
                linker,
                name,
                move |caller: Caller<'_, BridgeState>, h: u32| -> wasmtime::Result<u32> {
                    Ok(test(caller.data().heap.get(Handle::from_raw(h))?) as u32)
                },
            )?;
        }
        Ok(())
    }

    // ========================================================================
    // Byte and typed arrays
    // ========================================================================

    fn register_arrays(linker: &mut Linker<BridgeState>) -> Result<()> {
        link(
            linker,
            "bytes_new",
            |mut caller: Caller<'_, BridgeState>, ptr: u32, len: u32| -> wasmtime::Result<u32> {
                let mut cx = GuestCx::new(&mut caller)?;
                let bytes = codec::read_bytes(&mut cx, ptr, len)?;
                Ok(add(&mut cx, HostValue::Array(TypedArray::Bytes(bytes.into())))?)
            },
        )?;

        link(
            linker,
            "bytes_get",
            |mut caller: Caller<'_, BridgeState>, out: u32, h: u32| -> wasmtime::Result<()> {
                let mut cx = GuestCx::new(&mut caller)?;
                let bytes = match cx.state().heap.get(Handle::from_raw(h))? {
                    HostValue::Array(TypedArray::Bytes(b) | TypedArray::Clamped(b)) => {
                        Some(Arc::clone(b))
                    }
                    _ => None,
                };
                let slice = bytes.map(|b| codec::encode_bytes(&mut cx, &b)).transpose()?;
                codec::write_slice_ret(&mut cx, out, slice)?;
                Ok(())
            },
        )?;

        link(
            linker,
            "u32_array_new",
            |mut caller: Caller<'_, BridgeState>, ptr: u32, len: u32| -> wasmtime::Result<u32> {
                let mut cx = GuestCx::new(&mut caller)?;
                let words = codec::read_u32s(&mut cx, ptr, len)?;
                Ok(add(&mut cx, HostValue::Array(TypedArray::U32(words.into())))?)
            },
        )?;

        link(
            linker,
            "f32_array_new",
            |mut caller: Caller<'_, BridgeState>, ptr: u32, len: u32| -> wasmtime::Result<u32> {
                let mut cx = GuestCx::new(&mut caller)?;
                let floats = codec::read_f32s(&mut cx, ptr, len)?;
                Ok(add(&mut cx, HostValue::Array(TypedArray::F32(floats.into())))?)
            },
        )?;

        link(
            linker,
            "clamped_array_new",
            |mut caller: Caller<'_, BridgeState>, ptr: u32, len: u32| -> wasmtime::Result<u32> {
                let mut cx = GuestCx::new(&mut caller)?;
                let pixels = codec::read_clamped(&mut cx, ptr, len)?;
                Ok(add(&mut cx, HostValue::Array(TypedArray::Clamped(pixels.into())))?)
            },
        )?;

        Ok(())
    }

    // ========================================================================
    // JSON
    // ========================================================================

    fn register_json(linker: &mut Linker<BridgeState>) -> Result<()> {
        link(
            linker,
            "json_parse",
            |mut caller: Caller<'_, BridgeState>, ptr: u32, len: u32| -> wasmtime::Result<u32> {
                let mut cx = GuestCx::new(&mut caller)?;
                let result = json_parse(&mut cx, ptr, len);
                cx.settle(result)
            },
        )?;

        link(
            linker,
            "json_stringify",
            |mut caller: Caller<'_, BridgeState>, h: u32| -> wasmtime::Result<u32> {
                let mut cx = GuestCx::new(&mut caller)?;
                let result = json_stringify(&mut cx, h);
                cx.settle(result)
            },
        )?;

        Ok(())
    }

    // ========================================================================
    // Console and aborts
    // ========================================================================

    fn register_console(linker: &mut Linker<BridgeState>) -> Result<()> {
        link(
            linker,
            "log",
            |mut caller: Caller<'_, BridgeState>,
             level: u32,
             ptr: u32,
             len: u32|
             -> wasmtime::Result<()> {
                let mut cx = GuestCx::new(&mut caller)?;
                let message = codec::take_str(&mut cx, ptr, len)?;
                match level {
                    0 => tracing::error!(target: "tether::guest", "{}", message),
                    1 => tracing::warn!(target: "tether::guest", "{}", message),
                    2 => tracing::info!(target: "tether::guest", "{}", message),
                    3 => tracing::debug!(target: "tether::guest", "{}", message),
                    _ => tracing::trace!(target: "tether::guest", "{}", message),
                }
                Ok(())
            },
        )?;

        link(
            linker,
            "throw",
            |mut caller: Caller<'_, BridgeState>, ptr: u32, len: u32| -> wasmtime::Result<()> {
                let mut cx = GuestCx::new(&mut caller)?;
                let message = codec::decode_str(&mut cx, ptr, len)?;
                Err(BridgeError::Thrown(message).into())
            },
        )?;

        Ok(())
    }

    // ========================================================================
    // Closures
    // ========================================================================

    fn register_closures(linker: &mut Linker<BridgeState>) -> Result<()> {
        link(
            linker,
            "closure_new",
            |mut caller: Caller<'_, BridgeState>,
             a: u32,
             b: u32,
             dtor: u32,
             arity: u32|
             -> wasmtime::Result<u32> {
                let arity = Arity::from_tag(arity)?;
                let state = caller.data_mut();
                let closure = HostClosure::new(a, b, DestructorId(dtor), arity, &state.finalizers);
                Ok(state.heap.add(HostValue::Function(closure))?.as_raw())
            },
        )?;

        link(
            linker,
            "cb_drop",
            |mut caller: Caller<'_, BridgeState>, h: u32| -> wasmtime::Result<u32> {
                let heap = &mut caller.data_mut().heap;
                let handle = Handle::from_raw(h);
                // Type check before consuming, so a bad handle stays owned.
                let closure = expect_closure(heap.get(handle)?)?.clone();
                heap.take(handle)?;
                Ok(closure.release()? as u32)
            },
        )?;

        link(
            linker,
            "queue_callback",
            |mut caller: Caller<'_, BridgeState>, h: u32| -> wasmtime::Result<()> {
                let state = caller.data_mut();
                let closure = expect_closure(state.heap.get(Handle::from_raw(h))?)?.clone();
                state.tasks.push(closure, Vec::new())?;
                Ok(())
            },
        )?;

        Ok(())
    }

    // ========================================================================
    // Embedder host functions
    // ========================================================================

    fn register_host_calls(linker: &mut Linker<BridgeState>) -> Result<()> {
        link(
            linker,
            "call_host",
            |mut caller: Caller<'_, BridgeState>,
             name_ptr: u32,
             name_len: u32,
             args_ptr: u32,
             args_len: u32| -> wasmtime::Result<u32> {
                let mut cx = GuestCx::new(&mut caller)?;
                let result = call_host(&mut cx, name_ptr, name_len, args_ptr, args_len);
                cx.settle(result)
            },
        )?;

        Ok(())
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn link<Params, Args>(
    linker: &mut Linker<BridgeState>,
    name: &str,
    func: impl IntoFunc<BridgeState, Params, Args>,
) -> Result<()> {
    linker
        .func_wrap(abi::IMPORT_MODULE, name, func)
        .map_err(|e| BridgeError::Wasm(format!("failed to register {}: {}", name, e)))?;
    Ok(())
}

fn add(cx: &mut Cx<'_, '_>, value: HostValue) -> Result<u32> {
    Ok(cx.state().heap.add(value)?.as_raw())
}

fn expect_closure(value: &HostValue) -> Result<&HostClosure> {
    value.as_closure().ok_or(BridgeError::TypeMismatch {
        expected: "function",
        found: value.kind(),
    })
}

fn json_parse(cx: &mut Cx<'_, '_>, ptr: u32, len: u32) -> std::result::Result<u32, Fault> {
    let text = codec::decode_str(cx, ptr, len)?;
    let doc: serde_json::Value = serde_json::from_str(&text)
        .map_err(|e| Fault::Throw(HostValue::error("SyntaxError", e.to_string())))?;
    Ok(add(cx, HostValue::from(doc))?)
}

fn json_stringify(cx: &mut Cx<'_, '_>, h: u32) -> std::result::Result<u32, Fault> {
    let value = cx.state().heap.get(Handle::from_raw(h))?.clone();
    if matches!(value, HostValue::Undefined) {
        return Ok(Handle::UNDEFINED.as_raw());
    }
    let doc = value.to_json().ok_or_else(|| {
        Fault::Throw(HostValue::from(HostError::type_error(format!(
            "{} has no JSON representation",
            value.kind()
        ))))
    })?;
    Ok(add(cx, HostValue::from(doc.to_string()))?)
}

fn call_host(
    cx: &mut Cx<'_, '_>,
    name_ptr: u32,
    name_len: u32,
    args_ptr: u32,
    args_len: u32,
) -> std::result::Result<u32, Fault> {
    let name = codec::decode_str(cx, name_ptr, name_len)?;
    let raw = codec::read_u32s(cx, args_ptr, args_len)?;

    let state = cx.state();
    let args = raw
        .into_iter()
        .map(|h| state.heap.get(Handle::from_raw(h)).cloned())
        .collect::<Result<Vec<_>>>()?;
    let func = state.host_fns.get(&name).map_err(|_| {
        Fault::Throw(HostValue::from(HostError::type_error(format!(
            "{} is not a function",
            name
        ))))
    })?;

    tracing::trace!(function = %name, args = args.len(), "calling host function");
    let result = func(&mut HostScope::new(&mut state.tasks), args).map_err(Fault::Throw)?;
    Ok(state.heap.add(result)?.as_raw())
}
