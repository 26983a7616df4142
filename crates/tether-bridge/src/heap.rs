//! Object handle table.
//!
//! The sandboxed module cannot hold a reference to a host value, so every
//! value that crosses the boundary is parked in a slot and the module gets
//! the slot index back. Freed slots are threaded into a singly-linked free
//! list through the slots themselves, which keeps both allocation and release
//! O(1) no matter how many handles are churned per frame.
//!
//! ```text
//! index:  0          1      2      3       4       5        6
//!        [undefined][null][true][false][Live A][Free(6)][Live B]  next_free = 5
//! ```

use crate::error::{BridgeError, Result};
use crate::value::HostValue;
use std::fmt;

/// Number of reserved sentinel slots at the bottom of the table.
pub const RESERVED_SLOTS: u32 = 4;

/// A small integer naming a host value held by the module.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(u32);

impl Handle {
    /// Sentinel for `undefined`
    pub const UNDEFINED: Handle = Handle(0);
    /// Sentinel for `null`
    pub const NULL: Handle = Handle(1);
    /// Sentinel for `true`
    pub const TRUE: Handle = Handle(2);
    /// Sentinel for `false`
    pub const FALSE: Handle = Handle(3);

    /// Wrap a raw index received from the module.
    pub const fn from_raw(raw: u32) -> Self {
        Handle(raw)
    }

    /// Raw index handed to the module.
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    /// True for the four sentinel handles.
    pub const fn is_reserved(self) -> bool {
        self.0 < RESERVED_SLOTS
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({})", self.0)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

enum Slot {
    Live(HostValue),
    /// Index of the next free slot; equal to the slot count means "append".
    Free(u32),
}

/// Growable slot array mapping handles to host values.
pub struct HandleTable {
    slots: Vec<Slot>,
    next_free: u32,
    live: usize,
    max_slots: Option<usize>,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleTable {
    /// Create a table holding only the sentinels.
    pub fn new() -> Self {
        Self::with_capacity(128)
    }

    /// Create a table with room for `capacity` slots before reallocating.
    pub fn with_capacity(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity.max(RESERVED_SLOTS as usize));
        slots.push(Slot::Live(HostValue::Undefined));
        slots.push(Slot::Live(HostValue::Null));
        slots.push(Slot::Live(HostValue::Bool(true)));
        slots.push(Slot::Live(HostValue::Bool(false)));
        Self {
            slots,
            next_free: RESERVED_SLOTS,
            live: 0,
            max_slots: None,
        }
    }

    /// Builder: cap the total number of slots (sentinels included).
    pub fn limit(mut self, max_slots: usize) -> Self {
        self.max_slots = Some(max_slots.max(RESERVED_SLOTS as usize));
        self
    }

    /// Park a value and return its handle.
    ///
    /// Reuses the most recently freed slot when there is one, otherwise
    /// appends. Never returns a sentinel handle.
    pub fn add(&mut self, value: HostValue) -> Result<Handle> {
        let idx = self.next_free;
        if idx as usize == self.slots.len() {
            if let Some(max) = self.max_slots {
                if self.slots.len() >= max {
                    return Err(BridgeError::HandlesExhausted(max));
                }
            }
            self.slots.push(Slot::Free(idx + 1));
        }

        let slot = &mut self.slots[idx as usize];
        self.next_free = match *slot {
            Slot::Free(next) => next,
            Slot::Live(_) => unreachable!("free list head {} points at a live slot", idx),
        };
        *slot = Slot::Live(value);
        self.live += 1;
        Ok(Handle(idx))
    }

    /// Look up a handle without changing the table.
    pub fn get(&self, handle: Handle) -> Result<&HostValue> {
        match self.slots.get(handle.0 as usize) {
            Some(Slot::Live(value)) => Ok(value),
            _ => Err(BridgeError::InvalidHandle(handle.0)),
        }
    }

    /// Release a handle. Sentinels are ignored.
    pub fn drop_ref(&mut self, handle: Handle) -> Result<()> {
        self.release(handle).map(|_| ())
    }

    /// Release a handle and return the value it held.
    pub fn take(&mut self, handle: Handle) -> Result<HostValue> {
        if handle.is_reserved() {
            return self.get(handle).cloned();
        }
        self.release(handle)
            .map(|value| value.unwrap_or(HostValue::Undefined))
    }

    /// Issue a second, independent handle to the same value.
    pub fn clone_ref(&mut self, handle: Handle) -> Result<Handle> {
        let value = self.get(handle)?.clone();
        self.add(value)
    }

    /// Replace the value behind a live, non-sentinel handle.
    pub fn replace(&mut self, handle: Handle, value: HostValue) -> Result<HostValue> {
        if handle.is_reserved() {
            return Err(BridgeError::InvalidHandle(handle.0));
        }
        match self.slots.get_mut(handle.0 as usize) {
            Some(Slot::Live(old)) => Ok(std::mem::replace(old, value)),
            _ => Err(BridgeError::InvalidHandle(handle.0)),
        }
    }

    /// True if the handle currently names a value.
    pub fn contains(&self, handle: Handle) -> bool {
        matches!(self.slots.get(handle.0 as usize), Some(Slot::Live(_)))
    }

    /// Number of live, non-sentinel handles.
    pub fn live(&self) -> usize {
        self.live
    }

    /// Number of slots ever allocated, sentinels included.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn release(&mut self, handle: Handle) -> Result<Option<HostValue>> {
        if handle.is_reserved() {
            return Ok(None);
        }
        let slot = self
            .slots
            .get_mut(handle.0 as usize)
            .ok_or(BridgeError::InvalidHandle(handle.0))?;
        match std::mem::replace(slot, Slot::Free(self.next_free)) {
            Slot::Live(value) => {
                self.next_free = handle.0;
                self.live -= 1;
                Ok(Some(value))
            }
            free @ Slot::Free(_) => {
                // Double drop: put the original link back so the list stays acyclic.
                *slot = free;
                tracing::warn!(handle = handle.0, "drop of a handle that is not live");
                Err(BridgeError::InvalidHandle(handle.0))
            }
        }
    }
}

impl fmt::Debug for HandleTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleTable")
            .field("live", &self.live)
            .field("capacity", &self.slots.len())
            .field("next_free", &self.next_free)
            .finish()
    }
}
