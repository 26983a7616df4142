//! # Tether Bridge
//!
//! Host-side runtime for WebAssembly modules that exchange rich values with
//! their embedder.
//!
//! A sandboxed module only understands integers and its own linear memory.
//! This crate supplies everything the host needs to meet it halfway:
//!
//! | Piece | Module | What the module sees |
//! |-------|--------|----------------------|
//! | Object handles | [`heap`] | `u32` handles; 0-3 are `undefined`, `null`, `true`, `false` |
//! | Memory views | [`memory`] | Nothing; the host re-fetches typed views after every call |
//! | String codec | [`codec`] | `(ptr, len)` UTF-8 ranges in its own allocations |
//! | Closures | [`closure`] | `(a, b)` word pairs dispatched through `tether_callN` |
//! | Host calls | [`host`] | `call_host(name, args)` plus a task queue for callbacks |
//!
//! The core modules are independent of any engine. The `runtime` feature
//! (on by default) adds [`wasm`], which links the `tether` import table into
//! wasmtime and drives instances.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tether_bridge::wasm::{Bridge, BridgeConfig};
//! use tether_bridge::HostValue;
//!
//! let mut bridge = Bridge::new(BridgeConfig::default())?;
//! bridge.host_functions_mut().register("greet", |_scope, args| {
//!     let name = args.first().and_then(HostValue::as_str).unwrap_or("world");
//!     Ok(HostValue::string(format!("hello, {}", name)))
//! });
//!
//! let module = bridge.load_module("app.wasm")?;
//! let mut instance = bridge.instantiate(&module)?;
//! instance.start()?;
//! instance.run_until_idle()?;
//! ```
//!
//! ## Features
//!
//! - `runtime` - wasmtime host: import table, export resolution, host loop

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod closure;
pub mod codec;
pub mod error;
pub mod heap;
pub mod host;
pub mod memory;
pub mod value;

#[cfg(feature = "runtime")]
pub mod wasm;

#[cfg(test)]
mod testing;

// Re-export main types
pub use closure::{Arity, Completion, DestructorId, FinalizationQueue, HostClosure};
pub use codec::GuestSlice;
pub use error::{BridgeError, Result};
pub use heap::{Handle, HandleTable};
pub use host::{HostFn, HostFunctions, HostScope};
pub use value::{HostError, HostResource, HostValue, TypedArray};
