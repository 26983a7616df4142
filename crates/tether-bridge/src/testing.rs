//! In-process stand-in for a guest module, used by the unit tests.

use crate::closure::{Arity, DestructorId, Dispatcher};
use crate::codec::Guest;
use crate::error::{BridgeError, Result};
use crate::memory::{LinearMemory, ViewCache};

pub(crate) const PAGE: usize = 65536;

/// Allocator calls seen by the fake, sizes only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AllocCall {
    Malloc { size: u32 },
    Realloc { old: u32, new: u32 },
    Free { size: u32 },
}

type Hook = Box<dyn FnMut(Arity, u32, u32, &[u32]) -> Result<()>>;

/// Vec-backed memory with a bump allocator.
///
/// `realloc` always moves a growing block, and running out of memory grows
/// the buffer by whole pages into a fresh allocation, so the base address
/// changes the way a real `memory.grow` can.
pub(crate) struct FakeGuest {
    pub views: ViewCache,
    pub memory: Vec<u8>,
    pub detached: bool,
    pub realloc_enabled: bool,
    /// Advertise a reallocator that always fails.
    pub fail_realloc: bool,
    pub allocs: Vec<AllocCall>,
    pub dispatched: Vec<(Arity, u32, u32, Vec<u32>)>,
    pub destroyed: Vec<(u32, u32, DestructorId)>,
    pub hook: Option<Hook>,
    next: u32,
}

impl FakeGuest {
    pub fn with_pages(pages: usize) -> Self {
        Self {
            views: ViewCache::new(),
            memory: vec![0; pages * PAGE],
            detached: false,
            realloc_enabled: true,
            fail_realloc: false,
            allocs: Vec::new(),
            dispatched: Vec::new(),
            destroyed: Vec::new(),
            hook: None,
            // Keep address 0 free so a zero pointer always means "absent".
            next: 8,
        }
    }

    /// Grow by `pages`, moving the buffer.
    pub fn grow(&mut self, pages: usize) {
        let mut grown = Vec::with_capacity(self.memory.len() + pages * PAGE);
        grown.extend_from_slice(&self.memory);
        grown.resize(self.memory.len() + pages * PAGE, 0);
        self.memory = grown;
    }

    fn bump(&mut self, size: u32, align: u32) -> u32 {
        let align = align.max(1);
        let ptr = self.next.div_ceil(align) * align;
        self.next = ptr + size;
        let needed = self.next as usize;
        if needed > self.memory.len() {
            self.grow((needed - self.memory.len()).div_ceil(PAGE));
        }
        ptr
    }
}

impl LinearMemory for FakeGuest {
    fn view_parts(&mut self) -> (&mut ViewCache, Option<&mut [u8]>) {
        let data = if self.detached {
            None
        } else {
            Some(self.memory.as_mut_slice())
        };
        (&mut self.views, data)
    }
}

impl Guest for FakeGuest {
    fn malloc(&mut self, size: u32, align: u32) -> Result<u32> {
        self.allocs.push(AllocCall::Malloc { size });
        Ok(self.bump(size, align))
    }

    fn realloc(&mut self, ptr: u32, old_size: u32, new_size: u32, align: u32) -> Result<u32> {
        if !self.realloc_enabled {
            return Err(BridgeError::MissingExport("tether_realloc"));
        }
        if self.fail_realloc {
            return Err(BridgeError::Wasm("tether_realloc trapped".into()));
        }
        self.allocs.push(AllocCall::Realloc {
            old: old_size,
            new: new_size,
        });
        if new_size <= old_size {
            return Ok(ptr);
        }
        let moved = self.bump(new_size, align);
        let (src, dst) = (ptr as usize, moved as usize);
        self.memory.copy_within(src..src + old_size as usize, dst);
        Ok(moved)
    }

    fn free(&mut self, _ptr: u32, size: u32, _align: u32) -> Result<()> {
        self.allocs.push(AllocCall::Free { size });
        Ok(())
    }

    fn has_realloc(&self) -> bool {
        self.realloc_enabled
    }
}

impl Dispatcher for FakeGuest {
    fn dispatch(&mut self, arity: Arity, a: u32, b: u32, args: &[u32]) -> Result<()> {
        self.dispatched.push((arity, a, b, args.to_vec()));
        match self.hook.as_mut() {
            Some(hook) => hook(arity, a, b, args),
            None => Ok(()),
        }
    }

    fn destroy(&mut self, a: u32, b: u32, dtor: DestructorId) -> Result<()> {
        self.destroyed.push((a, b, dtor));
        Ok(())
    }
}
