//! Tests for the wasmtime host.

use super::*;

/// Smallest module the bridge accepts: memory plus a bump allocator.
const MINIMAL_GUEST: &str = r#"
(module
  (memory (export "memory") 1)
  (global $next (mut i32) (i32.const 1024))
  (func (export "tether_malloc") (param $size i32) (param $align i32) (result i32)
    (local $ptr i32)
    (local.set $ptr (global.get $next))
    (global.set $next (i32.add (global.get $next) (local.get $size)))
    (local.get $ptr))
  (func (export "start")))
"#;

#[test]
fn test_config_default() {
    let config = BridgeConfig::default();
    assert_eq!(config.max_memory, 256 * 1024 * 1024);
    assert!(config.enable_simd);
    assert!(config.max_handles.is_none());
    assert!(config.task_budget.is_none());
}

#[test]
fn test_config_minimal() {
    let config = BridgeConfig::minimal();
    assert_eq!(config.max_memory, 64 * 1024 * 1024);
    assert!(config.fuel_limit.is_some());
    assert!(config.max_handles.is_some());
    assert_eq!(config.capabilities, WasiCapabilities::none());
}

#[test]
fn test_config_presets_by_name() {
    assert_eq!(BridgeConfig::preset("minimal"), Some(BridgeConfig::minimal()));
    assert_eq!(
        BridgeConfig::preset("dev").map(|c| c.optimization_level),
        Some(0)
    );
    assert!(BridgeConfig::preset("turbo").is_none());
}

#[test]
fn test_config_json_fills_defaults() {
    let config: BridgeConfig =
        serde_json::from_str(r#"{"max_handles": 4096, "capabilities": {"stderr": true}}"#).unwrap();
    assert_eq!(config.max_handles, Some(4096));
    assert!(config.capabilities.stderr);
    assert!(!config.capabilities.stdout);
    assert_eq!(config.max_memory, BridgeConfig::default().max_memory);
}

#[test]
fn test_wasi_capabilities_none() {
    let caps = WasiCapabilities::none();
    assert!(!caps.stdin);
    assert!(!caps.stdout);
    assert!(!caps.stderr);
    assert!(caps.preopened_dirs_ro.is_empty());
    assert!(caps.preopened_dirs_rw.is_empty());
}

#[test]
fn test_wasi_capabilities_builder() {
    let caps = WasiCapabilities::none()
        .stdin(true)
        .stdout(true)
        .stderr(true)
        .env("DEBUG", "1")
        .arg("--verbose");

    assert!(caps.stdin);
    assert!(caps.stdout);
    assert!(caps.stderr);
    assert_eq!(caps.env_vars.len(), 1);
    assert_eq!(caps.args.len(), 1);
}

#[test]
fn test_bridge_creation() {
    assert!(Bridge::new(BridgeConfig::default()).is_ok());
}

#[test]
fn test_abi_names() {
    assert!(abi::is_provided("tether", "string_new"));
    assert!(abi::is_provided("wasi_snapshot_preview1", "fd_write"));
    assert!(!abi::is_provided("tether", "fft"));
    assert!(!abi::is_provided("env", "memory"));
}

#[test]
fn test_inspect_minimal_guest() {
    let bridge = Bridge::new(BridgeConfig::default()).unwrap();
    let module = bridge.load_module_bytes("minimal", MINIMAL_GUEST).unwrap();
    let report = module.inspect();

    assert!(report.is_compatible());
    assert!(report.imports.is_empty());
    assert_eq!(report.optional_exports, vec!["start"]);
    assert_eq!(module.exports().collect::<Vec<_>>(), vec!["tether_malloc", "start"]);
}

#[test]
fn test_inspect_flags_problems() {
    let bridge = Bridge::new(BridgeConfig::default()).unwrap();
    let module = bridge
        .load_module_bytes(
            "broken",
            r#"(module
                (import "env" "abort" (func))
                (import "tether" "log" (func (param i32 i32 i32))))"#,
        )
        .unwrap();
    let report = module.inspect();

    assert!(!report.is_compatible());
    assert_eq!(report.missing_exports, vec!["memory", "tether_malloc"]);
    assert!(!report.imports[0].provided);
    assert!(report.imports[1].provided);
}

#[test]
fn test_instantiate_requires_allocator() {
    let bridge = Bridge::new(BridgeConfig::default()).unwrap();
    let module = bridge
        .load_module_bytes("no-malloc", r#"(module (memory (export "memory") 1))"#)
        .unwrap();
    assert!(matches!(
        bridge.instantiate(&module),
        Err(crate::BridgeError::MissingExport("tether_malloc"))
    ));
}

#[test]
fn test_host_side_string_round_trip() {
    let bridge = Bridge::new(BridgeConfig::default()).unwrap();
    let module = bridge.load_module_bytes("minimal", MINIMAL_GUEST).unwrap();
    let mut instance = bridge.instantiate(&module).unwrap();

    assert!(instance.start().unwrap().value);
    // No reallocator: single exact-length allocation.
    let slice = instance.encode_str("grüße").unwrap();
    assert_eq!(slice.ptr, 1024);
    assert_eq!(slice.len, "grüße".len() as u32);
    assert_eq!(instance.decode_str(slice.ptr, slice.len).unwrap(), "grüße");

    instance.write_memory(64, &[0xFF]).unwrap();
    assert!(instance.decode_str(64, 1).is_err());
    assert_eq!(instance.read_memory(64, 1).unwrap(), vec![0xFF]);
}

#[test]
fn test_stats_and_handles() {
    let bridge = Bridge::new(BridgeConfig::default().max_handles(5)).unwrap();
    let module = bridge.load_module_bytes("minimal", MINIMAL_GUEST).unwrap();
    let mut instance = bridge.instantiate(&module).unwrap();

    let h = instance.add_value(crate::HostValue::string("kept")).unwrap();
    assert_eq!(h.as_raw(), 4);
    assert!(instance.add_value(crate::HostValue::Null).is_err());

    let stats = instance.stats();
    assert_eq!(stats.live_handles, 1);
    assert_eq!(stats.handle_capacity, 5);
    assert_eq!(stats.memory_bytes, 65536);
    assert_eq!(stats.pending_tasks, 0);

    assert_eq!(instance.take_value(h).unwrap().as_str(), Some("kept"));
    assert_eq!(instance.heap().live(), 0);
}

#[test]
fn test_fuel_metering() {
    let bridge = Bridge::new(BridgeConfig::default().fuel_limit(1_000_000)).unwrap();
    let module = bridge.load_module_bytes("minimal", MINIMAL_GUEST).unwrap();
    let mut instance = bridge.instantiate(&module).unwrap();
    let result = instance.call("start").unwrap();
    assert!(result.fuel_consumed.is_some());
    assert!(instance.remaining_fuel().unwrap() <= 1_000_000);
}
