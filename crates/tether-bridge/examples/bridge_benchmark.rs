//! Bridge Benchmarks
//!
//! Run with: cargo run -p tether-bridge --example bridge_benchmark --release

use std::time::Instant;
use tether_bridge::wasm::{Bridge, BridgeConfig, BridgeInstance};
use tether_bridge::{HandleTable, HostValue};

/// Bump allocator with a reallocator, a string-churning export and a
/// closure that re-queues nothing.
const GUEST: &str = r#"
(module
  (import "tether" "string_new" (func $string_new (param i32 i32) (result i32)))
  (import "tether" "object_drop_ref" (func $drop_ref (param i32)))
  (import "tether" "closure_new" (func $closure_new (param i32 i32 i32 i32) (result i32)))
  (import "tether" "queue_callback" (func $queue_callback (param i32)))
  (memory (export "memory") 16)
  (data (i32.const 16) "a short ascii string")
  (global $next (mut i32) (i32.const 4096))
  (global $closure (mut i32) (i32.const 0))
  (func $malloc (export "tether_malloc") (param $size i32) (param $align i32) (result i32)
    (local $ptr i32)
    ;; wrap around instead of growing; the benchmark never keeps allocations
    (if (i32.gt_u (i32.add (global.get $next) (local.get $size)) (i32.const 1000000))
      (then (global.set $next (i32.const 4096))))
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
  (func (export "tether_call0") (param i32 i32))
  (func (export "tether_closure_destroy") (param i32 i32 i32))
  (func (export "churn_string")
    (call $drop_ref (call $string_new (i32.const 16) (i32.const 20))))
  (func (export "make_closure")
    (global.set $closure
      (call $closure_new (i32.const 1) (i32.const 2) (i32.const 0) (i32.const 0))))
  (func (export "queue_closure")
    (call $queue_callback (global.get $closure))))
"#;

fn main() {
    println!("=== Bridge Benchmarks ===\n");

    bench_handle_table();
    bench_instantiation();
    bench_string_import();
    bench_host_strings();
    bench_closure_dispatch();

    println!("\n=== Benchmark Complete ===");
}

fn guest(bridge: &Bridge) -> BridgeInstance {
    let module = bridge.load_module_bytes("bench", GUEST).unwrap();
    bridge.instantiate(&module).unwrap()
}

fn bench_handle_table() {
    println!("## Handle Table");

    let mut heap = HandleTable::new();
    let iterations = 1_000_000;

    let start = Instant::now();
    for i in 0..iterations {
        let h = heap.add(HostValue::Number(i as f64)).unwrap();
        heap.drop_ref(h).unwrap();
    }
    let elapsed = start.elapsed();

    println!(
        "  add+drop ({} pairs): {:?} ({:.1} ns/pair), capacity stayed at {}",
        iterations,
        elapsed,
        elapsed.as_nanos() as f64 / iterations as f64,
        heap.capacity()
    );
    println!();
}

fn bench_instantiation() {
    println!("## Instantiation");

    let bridge = Bridge::new(BridgeConfig::default()).unwrap();
    let module = bridge.load_module_bytes("bench", GUEST).unwrap();

    let mut times = Vec::new();

    // Warm up
    for _ in 0..5 {
        let _ = bridge.instantiate(&module).unwrap();
    }

    // Benchmark
    for _ in 0..100 {
        let start = Instant::now();
        let _ = bridge.instantiate(&module).unwrap();
        times.push(start.elapsed().as_micros() as u64);
    }

    print_stats("instantiate", &times);
    println!();
}

fn bench_string_import() {
    println!("## string_new + object_drop_ref");

    let bridge = Bridge::new(BridgeConfig::default()).unwrap();
    let mut instance = guest(&bridge);

    let mut times = Vec::new();
    for _ in 0..1000 {
        times.push(instance.call("churn_string").unwrap().execution_time_us);
    }

    print_stats("churn_string", &times);
    println!("  live handles after: {}", instance.stats().live_handles);
    println!();
}

fn bench_host_strings() {
    println!("## Host String Encoding");

    let bridge = Bridge::new(BridgeConfig::default()).unwrap();
    let mut instance = guest(&bridge);

    let samples = [
        ("ascii", "x".repeat(256)),
        ("mixed", format!("{}{}", "x".repeat(128), "é".repeat(128))),
        ("cjk", "漢".repeat(256)),
    ];

    for (name, text) in &samples {
        let mut times = Vec::new();
        for _ in 0..1000 {
            let start = Instant::now();
            let slice = instance.encode_str(text).unwrap();
            let _ = instance.decode_str(slice.ptr, slice.len).unwrap();
            times.push(start.elapsed().as_micros() as u64);
        }
        print_stats(&format!("encode+decode {}", name), &times);
    }
    println!();
}

fn bench_closure_dispatch() {
    println!("## Closure Dispatch");

    let bridge = Bridge::new(BridgeConfig::default()).unwrap();
    let mut instance = guest(&bridge);
    instance.call("make_closure").unwrap();

    let iterations = 10_000;
    for _ in 0..iterations {
        instance.call("queue_closure").unwrap();
    }

    let start = Instant::now();
    let ran = instance.run_until_idle().unwrap();
    let elapsed = start.elapsed();

    println!(
        "  run_until_idle ({} tasks): {:?} ({:.2} us/task)",
        ran,
        elapsed,
        elapsed.as_micros() as f64 / ran.max(1) as f64
    );
    println!();
}

fn print_stats(name: &str, times: &[u64]) {
    if times.is_empty() {
        println!("  {}: no samples", name);
        return;
    }

    let mut sorted = times.to_vec();
    sorted.sort();

    let min = sorted[0];
    let max = sorted[sorted.len() - 1];
    let mean = times.iter().sum::<u64>() as f64 / times.len() as f64;
    let p50 = sorted[sorted.len() / 2];
    let p99 = sorted[(sorted.len() * 99) / 100];

    println!("  {}: n={} min={}us mean={:.1}us p50={}us p99={}us max={}us",
             name, times.len(), min, mean, p50, p99, max);
}
