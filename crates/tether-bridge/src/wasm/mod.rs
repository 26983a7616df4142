//! wasmtime host for bridged modules.
//!
//! This module wires the bridge core (handle table, views, codec, closure
//! trampoline) to a real wasmtime instance: it links the `tether` import
//! table, resolves the module's bridge exports after instantiation, and
//! runs the host loop that drives scheduled closures.
//!
//! ## Security Model
//!
//! - **Memory isolation**: Each module runs in its own linear memory space
//! - **Handles, not pointers**: The module only ever sees integer handles for host values
//! - **Deny-by-default**: WASI filesystem, env vars and stdio require explicit opt-in
//! - **Resource limits**: Memory cap, optional fuel metering, optional handle cap
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tether_bridge::wasm::{Bridge, BridgeConfig};
//!
//! let bridge = Bridge::new(BridgeConfig::default())?;
//! let module = bridge.load_module("app.wasm")?;
//! let mut instance = bridge.instantiate(&module)?;
//!
//! instance.start()?;
//! instance.run_until_idle()?;
//! ```

pub mod abi;
mod config;
mod guest;
mod imports;
mod runtime;

pub use config::{BridgeConfig, WasiCapabilities};
pub use imports::BridgeImports;
pub use runtime::{
    Bridge, BridgeInstance, BridgeModule, BridgeState, CallResult, ImportInfo, InstanceStats,
    ModuleReport,
};

#[cfg(test)]
mod tests;
