//! Embedder-registered host functions and the host task queue.
//!
//! The module reaches these through the `call_host` import. A host function
//! that starts asynchronous work does not block; it keeps a closure the
//! module passed in and schedules it on the task queue, which the embedder
//! drains with `BridgeInstance::run_until_idle`.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use crate::closure::HostClosure;
use crate::error::{BridgeError, Result};
use crate::value::HostValue;

/// Signature of a registered host function. `Err` carries the exception
/// delivered to the module's error sink.
pub type HostFn = Arc<
    dyn Fn(&mut HostScope<'_>, Vec<HostValue>) -> std::result::Result<HostValue, HostValue>
        + Send
        + Sync,
>;

/// Named host functions available to one bridge.
#[derive(Clone, Default)]
pub struct HostFunctions {
    fns: HashMap<String, HostFn>,
}

impl HostFunctions {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the clock functions every embedder expects:
    /// `performance.now` (milliseconds since registration) and `Date.now`
    /// (milliseconds since the Unix epoch).
    pub fn with_builtins() -> Self {
        let mut fns = Self::new();
        let origin = Instant::now();
        fns.register("performance.now", move |_, _| {
            Ok(HostValue::Number(origin.elapsed().as_secs_f64() * 1000.0))
        });
        fns.register("Date.now", |_, _| {
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map_err(|e| HostValue::error("Error", e.to_string()))?;
            Ok(HostValue::Number(now.as_millis() as f64))
        });
        fns
    }

    /// Register (or replace) a function under `name`.
    pub fn register<F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(&mut HostScope<'_>, Vec<HostValue>) -> std::result::Result<HostValue, HostValue>
            + Send
            + Sync
            + 'static,
    {
        self.fns.insert(name.into(), Arc::new(f));
        self
    }

    /// Look up a function.
    pub fn get(&self, name: &str) -> Result<HostFn> {
        self.fns
            .get(name)
            .cloned()
            .ok_or_else(|| BridgeError::UnknownHostFunction(name.to_string()))
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.fns.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of registered functions.
    pub fn len(&self) -> usize {
        self.fns.len()
    }

    /// True if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.fns.is_empty()
    }
}

impl fmt::Debug for HostFunctions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFunctions")
            .field("names", &self.names())
            .finish()
    }
}

/// A closure invocation waiting on the host loop.
#[derive(Debug, Clone)]
pub struct Task {
    /// Closure to call
    pub closure: HostClosure,
    /// Arguments, turned into fresh handles owned by the callee
    pub args: Vec<HostValue>,
}

/// FIFO of pending closure invocations.
#[derive(Debug, Default)]
pub struct TaskQueue {
    tasks: VecDeque<Task>,
}

impl TaskQueue {
    /// Empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a call, checking the argument count against the closure.
    pub fn push(&mut self, closure: HostClosure, args: Vec<HostValue>) -> Result<()> {
        let expected = closure.arity().count();
        if args.len() != expected {
            return Err(BridgeError::ArityMismatch {
                expected,
                got: args.len(),
            });
        }
        self.tasks.push_back(Task { closure, args });
        Ok(())
    }

    /// Oldest pending task.
    pub fn pop(&mut self) -> Option<Task> {
        self.tasks.pop_front()
    }

    /// Number of pending tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// True if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Discard every pending task.
    pub fn clear(&mut self) {
        self.tasks.clear();
    }
}

/// What a host function may do besides computing its result.
pub struct HostScope<'a> {
    tasks: &'a mut TaskQueue,
}

impl<'a> HostScope<'a> {
    /// Scope over an instance's task queue.
    pub fn new(tasks: &'a mut TaskQueue) -> Self {
        Self { tasks }
    }

    /// Arrange for `closure` to be called with `args` from the host loop.
    pub fn schedule(&mut self, closure: HostClosure, args: Vec<HostValue>) -> Result<()> {
        self.tasks.push(closure, args)
    }

    /// Number of tasks already queued.
    pub fn pending(&self) -> usize {
        self.tasks.len()
    }
}
