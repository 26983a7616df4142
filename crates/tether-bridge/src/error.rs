//! Error types for the bridge crate.

use thiserror::Error;

/// Bridge error type
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BridgeError {
    /// Handle was never issued, or was already dropped
    #[error("invalid handle {0}")]
    InvalidHandle(u32),

    /// Handle table reached its configured slot limit
    #[error("handle table exhausted: limit of {0} slots reached")]
    HandlesExhausted(usize),

    /// Linear memory is detached or empty, views cannot be rebuilt
    #[error("sandbox memory invalidated while building {0} view")]
    MemoryInvalidated(&'static str),

    /// Access outside the current linear memory
    #[error("memory access out of bounds: {ptr}+{len} exceeds {size} bytes")]
    OutOfBounds {
        /// Start address
        ptr: u64,
        /// Length in bytes
        len: u64,
        /// Current memory size in bytes
        size: usize,
    },

    /// Word view accessed at an address that is not a multiple of the word size
    #[error("misaligned {width}-byte access at {ptr}")]
    Misaligned {
        /// Byte address
        ptr: u32,
        /// Element width in bytes
        width: u32,
    },

    /// Module memory did not hold valid UTF-8
    #[error("invalid UTF-8 at {ptr}+{len} (valid up to {valid_up_to})")]
    InvalidUtf8 {
        /// Start address
        ptr: u32,
        /// Length in bytes
        len: u32,
        /// Offset of the first invalid byte
        valid_up_to: usize,
    },

    /// Value behind a handle has the wrong type for the operation
    #[error("type error: expected {expected}, found {found}")]
    TypeMismatch {
        /// Expected kind
        expected: &'static str,
        /// Actual kind
        found: &'static str,
    },

    /// Closure is executing or already destroyed
    #[error("closure invoked recursively or after being dropped")]
    ClosureUnavailable,

    /// Wrong number of arguments for a closure's arity
    #[error("closure expects {expected} arguments, got {got}")]
    ArityMismatch {
        /// Arity of the closure
        expected: usize,
        /// Number of arguments supplied
        got: usize,
    },

    /// Arity tag outside the dispatch table
    #[error("unknown closure arity tag {0}")]
    UnknownArity(u32),

    /// The guest does not export a function the operation needs
    #[error("guest export `{0}` is missing")]
    MissingExport(&'static str),

    /// No host function registered under the requested name
    #[error("no host function named `{0}`")]
    UnknownHostFunction(String),

    /// A host exception had no error sink to go to
    #[error("unhandled host exception: {0}")]
    Unhandled(String),

    /// The guest aborted the call through the `throw` import
    #[error("guest threw: {0}")]
    Thrown(String),

    /// WebAssembly engine error
    #[error("WASM error: {0}")]
    Wasm(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        BridgeError::Io(err.to_string())
    }
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;
