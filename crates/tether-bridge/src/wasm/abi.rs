//! Names shared by the import and export sides of the bridge ABI.

/// Import module every bridge function lives in.
pub const IMPORT_MODULE: &str = "tether";

/// WASI preview1 import module, linked alongside the bridge.
pub const WASI_MODULE: &str = "wasi_snapshot_preview1";

/// Linear memory export.
pub const MEMORY: &str = "memory";
/// `(size, align) -> ptr`
pub const MALLOC: &str = "tether_malloc";
/// `(ptr, old_size, new_size, align) -> ptr`
pub const REALLOC: &str = "tether_realloc";
/// `(ptr, size, align)`
pub const FREE: &str = "tether_free";
/// `(handle)`: the module's error sink
pub const EXN_STORE: &str = "tether_exn_store";
/// `(a, b, dtor)`
pub const CLOSURE_DESTROY: &str = "tether_closure_destroy";
/// Entry point called after instantiation.
pub const START: &str = "start";

/// Exports an instance cannot work without.
pub const REQUIRED_EXPORTS: &[&str] = &[MEMORY, MALLOC];

/// Exports that enable optional behaviour when present.
pub const OPTIONAL_EXPORTS: &[&str] = &[
    REALLOC,
    FREE,
    EXN_STORE,
    "tether_call0",
    "tether_call1",
    "tether_call2",
    "tether_call3",
    CLOSURE_DESTROY,
    START,
];

/// Every function the bridge provides under [`IMPORT_MODULE`].
pub const IMPORTS: &[&str] = &[
    "object_drop_ref",
    "object_clone_ref",
    "string_new",
    "string_get",
    "number_new",
    "number_get",
    "boolean_get",
    "is_undefined",
    "is_null",
    "is_string",
    "is_object",
    "is_function",
    "debug_string",
    "bytes_new",
    "bytes_get",
    "u32_array_new",
    "f32_array_new",
    "clamped_array_new",
    "json_parse",
    "json_stringify",
    "log",
    "throw",
    "closure_new",
    "cb_drop",
    "queue_callback",
    "call_host",
];

/// True if `(module, name)` is resolved by the bridge's linker.
pub fn is_provided(module: &str, name: &str) -> bool {
    match module {
        IMPORT_MODULE => IMPORTS.contains(&name),
        WASI_MODULE => true,
        _ => false,
    }
}
