//! Integration tests for the bridge with a real guest module.
//!
//! The guest is written in WAT: a bump allocator plus a handful of exports
//! that drive the `tether` imports. Results land at fixed addresses so the
//! tests can read them back through the instance's memory accessors.

use std::io::Write;

use tether_bridge::wasm::{Bridge, BridgeConfig, BridgeInstance};
use tether_bridge::{BridgeError, Handle, HostError, HostValue};

/// Memory map shared with the guest below.
const OUT_SLICE: u32 = 64;
const EXN_SLOT: u32 = 128;
const CALL0_COUNT: u32 = 132;
const DESTROY_COUNT: u32 = 136;
const DESTROYED_A: u32 = 140;
const RESULT_SLOT: u32 = 144;
const PARSED_SLOT: u32 = 148;

const GUEST: &str = r#"
(module
  (import "tether" "string_new" (func $string_new (param i32 i32) (result i32)))
  (import "tether" "string_get" (func $string_get (param i32 i32)))
  (import "tether" "number_new" (func $number_new (param f64) (result i32)))
  (import "tether" "json_parse" (func $json_parse (param i32 i32) (result i32)))
  (import "tether" "closure_new" (func $closure_new (param i32 i32 i32 i32) (result i32)))
  (import "tether" "queue_callback" (func $queue_callback (param i32)))
  (import "tether" "cb_drop" (func $cb_drop (param i32) (result i32)))
  (import "tether" "object_drop_ref" (func $drop_ref (param i32)))
  (import "tether" "call_host" (func $call_host (param i32 i32 i32 i32) (result i32)))

  (memory (export "memory") 1)
  (data (i32.const 16) "h\c3\a9llo")
  (data (i32.const 32) "{oops")
  (data (i32.const 48) "double")
  (data (i32.const 56) "[1,2]")

  (global $next (mut i32) (i32.const 1024))
  (global $closure (mut i32) (i32.const 0))

  (func $malloc (export "tether_malloc") (param $size i32) (param $align i32) (result i32)
    (local $ptr i32)
    (local.set $ptr (global.get $next))
    (global.set $next (i32.add (global.get $next) (local.get $size)))
    (local.get $ptr))

  (func (export "tether_realloc")
    (param $ptr i32) (param $old i32) (param $new i32) (param $align i32) (result i32)
    (local $fresh i32)
    (local.set $fresh (call $malloc (local.get $new) (local.get $align)))
    (memory.copy
      (local.get $fresh)
      (local.get $ptr)
      (select (local.get $old) (local.get $new) (i32.lt_u (local.get $old) (local.get $new))))
    (local.get $fresh))

  (func (export "tether_free") (param i32 i32 i32))

  (func (export "tether_exn_store") (param $h i32)
    (i32.store (i32.const 128) (local.get $h)))

  ;; Closures with b = 1 drop themselves while running.
  (func (export "tether_call0") (param $a i32) (param $b i32)
    (i32.store (i32.const 132) (i32.add (i32.load (i32.const 132)) (i32.const 1)))
    (if (i32.eq (local.get $b) (i32.const 1))
      (then (drop (call $cb_drop (global.get $closure))))))

  (func (export "tether_closure_destroy") (param $a i32) (param $b i32) (param $dtor i32)
    (i32.store (i32.const 136) (i32.add (i32.load (i32.const 136)) (i32.const 1)))
    (i32.store (i32.const 140) (local.get $a)))

  (func (export "roundtrip")
    (call $string_get (i32.const 64) (call $string_new (i32.const 16) (i32.const 6))))

  (func (export "good_json")
    (i32.store (i32.const 148) (call $json_parse (i32.const 56) (i32.const 5))))

  (func (export "bad_json")
    (i32.store (i32.const 148) (call $json_parse (i32.const 32) (i32.const 5))))

  (func (export "self_dropping")
    (global.set $closure
      (call $closure_new (i32.const 77) (i32.const 1) (i32.const 5) (i32.const 0)))
    (call $queue_callback (global.get $closure)))

  (func (export "forgotten")
    (local $h i32)
    (local.set $h (call $closure_new (i32.const 99) (i32.const 2) (i32.const 6) (i32.const 0)))
    (call $queue_callback (local.get $h))
    (call $drop_ref (local.get $h)))

  (func (export "call_double")
    (i32.store (i32.const 96) (call $number_new (f64.const 21)))
    (i32.store (i32.const 144)
      (call $call_host (i32.const 48) (i32.const 6) (i32.const 96) (i32.const 1))))

  (func (export "call_missing")
    (i32.store (i32.const 144)
      (call $call_host (i32.const 16) (i32.const 6) (i32.const 96) (i32.const 0)))))
"#;

/// Same calls, but no error sink and an explicit throw.
const SINKLESS_GUEST: &str = r#"
(module
  (import "tether" "json_parse" (func $json_parse (param i32 i32) (result i32)))
  (import "tether" "throw" (func $throw (param i32 i32)))
  (memory (export "memory") 1)
  (data (i32.const 32) "{oops")
  (data (i32.const 48) "boom")
  (func (export "tether_malloc") (param i32 i32) (result i32) (i32.const 1024))
  (func (export "bad_json")
    (drop (call $json_parse (i32.const 32) (i32.const 5))))
  (func (export "explode")
    (call $throw (i32.const 48) (i32.const 4))))
"#;

fn instantiate(bridge: &Bridge, wat: &str) -> BridgeInstance {
    let module = bridge.load_module_bytes("guest", wat).expect("failed to compile guest");
    bridge.instantiate(&module).expect("failed to instantiate")
}

fn read_u32(instance: &mut BridgeInstance, addr: u32) -> u32 {
    let bytes = instance.read_memory(addr, 4).expect("read failed");
    u32::from_le_bytes(bytes.try_into().expect("four bytes"))
}

#[test]
fn test_string_round_trip() {
    let bridge = Bridge::new(BridgeConfig::default()).expect("failed to create bridge");
    let mut instance = instantiate(&bridge, GUEST);

    instance.call("roundtrip").expect("roundtrip call failed");

    let ptr = read_u32(&mut instance, OUT_SLICE);
    let len = read_u32(&mut instance, OUT_SLICE + 4);
    assert_ne!(ptr, 0);
    assert_eq!(len, 6);
    assert_eq!(instance.decode_str(ptr, len).unwrap(), "héllo");

    // string_new's handle is still owned by the module.
    assert_eq!(instance.heap().live(), 1);
    let h = Handle::from_raw(4);
    assert_eq!(instance.value(h).unwrap().as_str(), Some("héllo"));
}

#[test]
fn test_json_parse() {
    let bridge = Bridge::new(BridgeConfig::default()).expect("failed to create bridge");
    let mut instance = instantiate(&bridge, GUEST);

    instance.call("good_json").expect("good_json call failed");
    let h = Handle::from_raw(read_u32(&mut instance, PARSED_SLOT));
    assert!(!h.is_reserved());
    assert_eq!(
        instance.value(h).unwrap().to_json(),
        Some(serde_json::json!([1, 2]))
    );
    assert_eq!(read_u32(&mut instance, EXN_SLOT), 0);
}

#[test]
fn test_json_error_reaches_sink() {
    let bridge = Bridge::new(BridgeConfig::default()).expect("failed to create bridge");
    let mut instance = instantiate(&bridge, GUEST);
    assert!(instance.has_error_sink());

    instance.call("bad_json").expect("exceptions must not trap");

    // The import returned 0 and the sink got one handle.
    assert_eq!(read_u32(&mut instance, PARSED_SLOT), 0);
    let exn = Handle::from_raw(read_u32(&mut instance, EXN_SLOT));
    match instance.take_value(exn).unwrap() {
        HostValue::Error(HostError { name, .. }) => assert_eq!(name, "SyntaxError"),
        other => panic!("expected an error value, got {}", other.debug_string()),
    }
    assert_eq!(instance.heap().live(), 0);
}

#[test]
fn test_closure_dropped_during_its_own_call() {
    let bridge = Bridge::new(BridgeConfig::default()).expect("failed to create bridge");
    let mut instance = instantiate(&bridge, GUEST);

    instance.call("self_dropping").expect("self_dropping call failed");
    assert_eq!(instance.stats().pending_tasks, 1);

    let ran = instance.run_until_idle().expect("host loop failed");
    assert_eq!(ran, 1);
    assert_eq!(read_u32(&mut instance, CALL0_COUNT), 1);
    assert_eq!(read_u32(&mut instance, DESTROY_COUNT), 1);
    assert_eq!(read_u32(&mut instance, DESTROYED_A), 77);

    // Nothing left for the finalizer backstop.
    assert_eq!(instance.run_finalizers().unwrap(), 0);
    assert_eq!(read_u32(&mut instance, DESTROY_COUNT), 1);
    assert_eq!(instance.heap().live(), 0);
}

#[test]
fn test_forgotten_closure_is_finalized() {
    let bridge = Bridge::new(BridgeConfig::default()).expect("failed to create bridge");
    let mut instance = instantiate(&bridge, GUEST);

    instance.call("forgotten").expect("forgotten call failed");
    assert_eq!(instance.heap().live(), 0);

    instance.run_until_idle().expect("host loop failed");
    assert_eq!(read_u32(&mut instance, CALL0_COUNT), 1);
    assert_eq!(read_u32(&mut instance, DESTROY_COUNT), 1);
    assert_eq!(read_u32(&mut instance, DESTROYED_A), 99);
    assert_eq!(instance.stats().pending_finalizers, 0);
}

#[test]
fn test_call_host_function() {
    let mut bridge = Bridge::new(BridgeConfig::default()).expect("failed to create bridge");
    bridge.host_functions_mut().register("double", |_scope, args| {
        let n = args
            .first()
            .and_then(HostValue::as_f64)
            .ok_or_else(|| HostValue::from(HostError::type_error("expected a number")))?;
        Ok(HostValue::Number(n * 2.0))
    });
    let mut instance = instantiate(&bridge, GUEST);

    instance.call("call_double").expect("call_double failed");
    let h = Handle::from_raw(read_u32(&mut instance, RESULT_SLOT));
    assert_eq!(instance.value(h).unwrap().as_f64(), Some(42.0));
}

#[test]
fn test_call_unknown_host_function_throws() {
    let bridge = Bridge::new(BridgeConfig::default()).expect("failed to create bridge");
    let mut instance = instantiate(&bridge, GUEST);

    instance.call("call_missing").expect("call_missing failed");
    assert_eq!(read_u32(&mut instance, RESULT_SLOT), 0);

    let exn = Handle::from_raw(read_u32(&mut instance, EXN_SLOT));
    match instance.value(exn).unwrap() {
        HostValue::Error(err) => {
            assert_eq!(err.name, "TypeError");
            assert_eq!(err.message, "héllo is not a function");
        }
        other => panic!("expected an error value, got {}", other.debug_string()),
    }
}

#[test]
fn test_exception_without_sink_aborts() {
    let bridge = Bridge::new(BridgeConfig::default()).expect("failed to create bridge");
    let mut instance = instantiate(&bridge, SINKLESS_GUEST);
    assert!(!instance.has_error_sink());

    let err = instance.call("bad_json").unwrap_err();
    assert!(matches!(err, BridgeError::Unhandled(_)), "got {:?}", err);

    let err = instance.call("explode").unwrap_err();
    assert_eq!(err, BridgeError::Thrown("boom".to_string()));
}

#[test]
fn test_load_module_from_file() {
    let mut file = tempfile::Builder::new()
        .suffix(".wat")
        .tempfile()
        .expect("failed to create temp file");
    file.write_all(GUEST.as_bytes()).unwrap();

    let bridge = Bridge::new(BridgeConfig::minimal()).expect("failed to create bridge");
    let module = bridge.load_module(file.path()).expect("failed to load module");
    let report = module.inspect();
    assert!(report.is_compatible(), "{:?}", report);
    assert!(report.optional_exports.contains(&"tether_exn_store"));

    let mut instance = bridge.instantiate(&module).expect("failed to instantiate");
    let result = instance.call("roundtrip").expect("roundtrip call failed");
    assert!(result.fuel_consumed.is_some());
    println!("roundtrip ({}us)", result.execution_time_us);
}
