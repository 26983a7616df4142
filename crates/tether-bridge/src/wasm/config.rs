//! Configuration for bridge instances.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// WASI capability grants for modules that also import WASI.
///
/// Following the deny-by-default security model, all capabilities
/// start disabled and must be explicitly enabled.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WasiCapabilities {
    /// Allow access to stdin
    pub stdin: bool,

    /// Allow access to stdout
    pub stdout: bool,

    /// Allow access to stderr
    pub stderr: bool,

    /// Directories to pre-open for filesystem access (read-only)
    pub preopened_dirs_ro: Vec<PathBuf>,

    /// Directories to pre-open for filesystem access (read-write)
    pub preopened_dirs_rw: Vec<PathBuf>,

    /// Environment variables to expose
    pub env_vars: Vec<(String, String)>,

    /// Command-line arguments to pass
    pub args: Vec<String>,
}

impl WasiCapabilities {
    /// Create capabilities with nothing allowed (maximum isolation)
    pub fn none() -> Self {
        Self::default()
    }

    /// Create capabilities for modules that print diagnostics
    ///
    /// Allows: stdout/stderr
    /// Denies: stdin, filesystem, env vars
    pub fn console() -> Self {
        Self {
            stdout: true,
            stderr: true,
            ..Default::default()
        }
    }

    /// Create capabilities with stdio allowed
    pub fn with_stdio() -> Self {
        Self {
            stdin: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        }
    }

    /// Builder: enable stdin
    pub fn stdin(mut self, allow: bool) -> Self {
        self.stdin = allow;
        self
    }

    /// Builder: enable stdout
    pub fn stdout(mut self, allow: bool) -> Self {
        self.stdout = allow;
        self
    }

    /// Builder: enable stderr
    pub fn stderr(mut self, allow: bool) -> Self {
        self.stderr = allow;
        self
    }

    /// Builder: add read-only directory
    pub fn preopened_dir_ro(mut self, path: impl Into<PathBuf>) -> Self {
        self.preopened_dirs_ro.push(path.into());
        self
    }

    /// Builder: add read-write directory
    pub fn preopened_dir_rw(mut self, path: impl Into<PathBuf>) -> Self {
        self.preopened_dirs_rw.push(path.into());
        self
    }

    /// Builder: add environment variable
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.push((key.into(), value.into()));
        self
    }

    /// Builder: add command-line argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// Configuration for the bridge runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// WASI capability configuration
    pub capabilities: WasiCapabilities,

    /// Maximum linear memory in bytes (default = 256MB)
    pub max_memory: usize,

    /// Maximum handle table slots, sentinels included (None = unbounded)
    pub max_handles: Option<usize>,

    /// Enable fuel-based execution limiting
    pub fuel_limit: Option<u64>,

    /// Maximum tasks run by one `run_until_idle` pass (None = until empty)
    pub task_budget: Option<usize>,

    /// Cranelift optimization level (0-3)
    pub optimization_level: u8,

    /// Enable SIMD support
    pub enable_simd: bool,

    /// Cache compiled modules to disk
    pub cache_path: Option<PathBuf>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            capabilities: WasiCapabilities::console(),
            max_memory: 256 * 1024 * 1024, // 256 MB
            max_handles: None,
            fuel_limit: None,
            task_budget: None,
            optimization_level: 2,
            enable_simd: true,
            cache_path: None,
        }
    }
}

impl BridgeConfig {
    /// Create a minimal config for maximum isolation
    pub fn minimal() -> Self {
        Self {
            capabilities: WasiCapabilities::none(),
            max_memory: 64 * 1024 * 1024,    // 64 MB
            max_handles: Some(1 << 20),
            fuel_limit: Some(1_000_000_000), // 1B fuel units
            task_budget: Some(10_000),
            ..Default::default()
        }
    }

    /// Create config for development/debugging
    pub fn development() -> Self {
        Self {
            capabilities: WasiCapabilities::with_stdio(),
            optimization_level: 0, // Faster compilation
            ..Default::default()
        }
    }

    /// Look up a preset by name: `default`, `minimal` or `development`.
    pub fn preset(name: &str) -> Option<Self> {
        match name {
            "default" => Some(Self::default()),
            "minimal" => Some(Self::minimal()),
            "development" | "dev" => Some(Self::development()),
            _ => None,
        }
    }

    /// Builder: set capabilities
    pub fn capabilities(mut self, caps: WasiCapabilities) -> Self {
        self.capabilities = caps;
        self
    }

    /// Builder: set max memory
    pub fn max_memory(mut self, bytes: usize) -> Self {
        self.max_memory = bytes;
        self
    }

    /// Builder: cap the handle table
    pub fn max_handles(mut self, slots: usize) -> Self {
        self.max_handles = Some(slots);
        self
    }

    /// Builder: set fuel limit
    pub fn fuel_limit(mut self, fuel: u64) -> Self {
        self.fuel_limit = Some(fuel);
        self
    }

    /// Builder: bound each task queue drain
    pub fn task_budget(mut self, tasks: usize) -> Self {
        self.task_budget = Some(tasks);
        self
    }

    /// Builder: enable SIMD
    pub fn simd(mut self, enable: bool) -> Self {
        self.enable_simd = enable;
        self
    }

    /// Builder: set optimization level
    pub fn optimize(mut self, level: u8) -> Self {
        self.optimization_level = level.min(3);
        self
    }

    /// Builder: set cache path
    pub fn cache(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_path = Some(path.into());
        self
    }
}
