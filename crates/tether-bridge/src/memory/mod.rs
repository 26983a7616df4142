//! Typed views over the module's linear memory.
//!
//! The module's memory can grow at any call boundary the bridge does not
//! control, which moves or resizes the backing buffer. A view is therefore
//! never trusted across a call: each fetch checks a stamp recorded when the
//! view was last built (generation, byte length, base address) and rebuilds
//! the view when any of them changed. The generation is bumped explicitly by
//! the glue after every call into the guest; the structural checks catch
//! growth that happens without a notification.

mod views;

pub use views::{ByteView, ClampedView, DataView, F32View, U32View};

use crate::error::{BridgeError, Result};

/// The five view kinds the cache tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewKind {
    /// `u8` elements
    Bytes,
    /// `u8` elements with saturating writes
    Clamped,
    /// little-endian `u32` elements
    U32,
    /// little-endian `f32` elements
    F32,
    /// byte-addressed mixed-width accessor
    Data,
}

impl ViewKind {
    /// Every kind, in cache slot order.
    pub const ALL: [ViewKind; 5] = [
        ViewKind::Bytes,
        ViewKind::Clamped,
        ViewKind::U32,
        ViewKind::F32,
        ViewKind::Data,
    ];

    fn slot(self) -> usize {
        self as usize
    }

    /// Name used in errors and traces.
    pub fn name(self) -> &'static str {
        match self {
            ViewKind::Bytes => "u8",
            ViewKind::Clamped => "u8-clamped",
            ViewKind::U32 => "u32",
            ViewKind::F32 => "f32",
            ViewKind::Data => "data",
        }
    }
}

/// Snapshot of the buffer a view was built over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Stamp {
    generation: u64,
    byte_len: usize,
    base: usize,
}

/// Lazily rebuilt typed views.
#[derive(Debug, Default)]
pub struct ViewCache {
    generation: u64,
    stamps: [Option<Stamp>; 5],
    rebuilds: [u64; 5],
}

impl ViewCache {
    /// Create an empty cache; every view is built on first use.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark every cached view stale. Called after each guest call boundary.
    pub fn invalidate(&mut self) {
        self.generation = self.generation.wrapping_add(1);
    }

    /// Drop every stamp, as after re-instantiation.
    pub fn reset(&mut self) {
        self.stamps = [None; 5];
        self.invalidate();
    }

    /// Current generation counter.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// How many times a view kind has been (re)built.
    pub fn rebuilds(&self, kind: ViewKind) -> u64 {
        self.rebuilds[kind.slot()]
    }

    /// True if a fetch of `kind` over `data` would serve the cached view.
    pub fn is_fresh(&self, kind: ViewKind, data: Option<&[u8]>) -> bool {
        match (self.stamps[kind.slot()], data) {
            (Some(stamp), Some(data)) => stamp == self.stamp_for(data),
            _ => false,
        }
    }

    fn stamp_for(&self, data: &[u8]) -> Stamp {
        Stamp {
            generation: self.generation,
            byte_len: data.len(),
            base: data.as_ptr() as usize,
        }
    }

    /// Validate or rebuild the stamp for `kind`.
    fn refresh(&mut self, kind: ViewKind, data: Option<&[u8]>) -> Result<()> {
        let data = match data {
            Some(d) if !d.is_empty() => d,
            _ => {
                self.stamps[kind.slot()] = None;
                return Err(BridgeError::MemoryInvalidated(kind.name()));
            }
        };
        let current = self.stamp_for(data);
        if self.stamps[kind.slot()] != Some(current) {
            tracing::trace!(
                view = kind.name(),
                byte_len = current.byte_len,
                generation = current.generation,
                "rebuilding memory view"
            );
            self.stamps[kind.slot()] = Some(current);
            self.rebuilds[kind.slot()] += 1;
        }
        Ok(())
    }

    /// Byte view over the current buffer.
    pub fn bytes<'m>(&mut self, data: Option<&'m mut [u8]>) -> Result<ByteView<'m>> {
        self.refresh(ViewKind::Bytes, data.as_deref())?;
        Ok(ByteView::new(data.unwrap_or_default()))
    }

    /// Clamped byte view over the current buffer.
    pub fn clamped<'m>(&mut self, data: Option<&'m mut [u8]>) -> Result<ClampedView<'m>> {
        self.refresh(ViewKind::Clamped, data.as_deref())?;
        Ok(ClampedView::new(data.unwrap_or_default()))
    }

    /// `u32` view over the current buffer.
    pub fn u32<'m>(&mut self, data: Option<&'m mut [u8]>) -> Result<U32View<'m>> {
        self.refresh(ViewKind::U32, data.as_deref())?;
        Ok(U32View::new(data.unwrap_or_default()))
    }

    /// `f32` view over the current buffer.
    pub fn f32<'m>(&mut self, data: Option<&'m mut [u8]>) -> Result<F32View<'m>> {
        self.refresh(ViewKind::F32, data.as_deref())?;
        Ok(F32View::new(data.unwrap_or_default()))
    }

    /// Data view over the current buffer.
    pub fn data<'m>(&mut self, data: Option<&'m mut [u8]>) -> Result<DataView<'m>> {
        self.refresh(ViewKind::Data, data.as_deref())?;
        Ok(DataView::new(data.unwrap_or_default()))
    }
}

/// A linear memory the bridge can look at.
///
/// Implementors hand out the current bytes together with the view cache
/// that guards them; `None` means the buffer is detached.
pub trait LinearMemory {
    /// Current buffer (if attached) and the cache validating views over it.
    fn view_parts(&mut self) -> (&mut ViewCache, Option<&mut [u8]>);

    /// Byte view.
    fn u8_view(&mut self) -> Result<ByteView<'_>> {
        let (cache, data) = self.view_parts();
        cache.bytes(data)
    }

    /// Clamped byte view.
    fn clamped_view(&mut self) -> Result<ClampedView<'_>> {
        let (cache, data) = self.view_parts();
        cache.clamped(data)
    }

    /// `u32` view.
    fn u32_view(&mut self) -> Result<U32View<'_>> {
        let (cache, data) = self.view_parts();
        cache.u32(data)
    }

    /// `f32` view.
    fn f32_view(&mut self) -> Result<F32View<'_>> {
        let (cache, data) = self.view_parts();
        cache.f32(data)
    }

    /// Data view.
    fn data_view(&mut self) -> Result<DataView<'_>> {
        let (cache, data) = self.view_parts();
        cache.data(data)
    }
}

/// Check `[ptr, ptr + len)` against a buffer of `size` bytes.
pub(crate) fn check_range(ptr: u64, len: u64, size: usize) -> Result<std::ops::Range<usize>> {
    let end = ptr
        .checked_add(len)
        .filter(|end| *end <= size as u64)
        .ok_or(BridgeError::OutOfBounds { ptr, len, size })?;
    Ok(ptr as usize..end as usize)
}
