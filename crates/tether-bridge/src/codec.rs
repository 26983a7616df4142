//! String and byte marshalling between host values and module memory.
//!
//! Decoding is strict UTF-8: a malformed range is an error, never a string
//! full of replacement characters. Encoding has two paths depending on what
//! the guest exports:
//!
//! - with a reallocator, the buffer starts at the string's UTF-16 length,
//!   the ASCII prefix is copied byte for byte, and on the first non-ASCII
//!   character the buffer is regrown to `prefix + 3 * remaining UTF-16 units`
//!   (the worst-case UTF-8 expansion), written, then shrunk to fit;
//! - without one, a single allocation of the exact UTF-8 length.

use crate::error::{BridgeError, Result};
use crate::memory::LinearMemory;

/// Allocator surface of the guest module.
///
/// Every call may grow memory, so views must be re-fetched afterwards.
pub trait Guest: LinearMemory {
    /// Allocate `size` bytes with the given alignment.
    fn malloc(&mut self, size: u32, align: u32) -> Result<u32>;

    /// Resize an allocation, possibly moving it.
    fn realloc(&mut self, ptr: u32, old_size: u32, new_size: u32, align: u32) -> Result<u32>;

    /// Release an allocation.
    fn free(&mut self, ptr: u32, size: u32, align: u32) -> Result<()>;

    /// Whether the guest exports a reallocator.
    fn has_realloc(&self) -> bool;
}

/// A `(ptr, len)` pair naming a range of guest memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GuestSlice {
    /// Start address
    pub ptr: u32,
    /// Length in bytes
    pub len: u32,
}

fn wasm_len(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| BridgeError::OutOfBounds {
        ptr: 0,
        len: len as u64,
        size: u32::MAX as usize,
    })
}

fn utf16_len(s: &str) -> usize {
    s.chars().map(char::len_utf16).sum()
}

/// Decode `[ptr, ptr + len)` as UTF-8.
pub fn decode_str<M: LinearMemory + ?Sized>(mem: &mut M, ptr: u32, len: u32) -> Result<String> {
    let view = mem.u8_view()?;
    let bytes = view.subarray(ptr, len)?;
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|e| BridgeError::InvalidUtf8 {
            ptr,
            len,
            valid_up_to: e.valid_up_to(),
        })
}

/// Copy a host string into a fresh guest allocation.
///
/// On failure the allocation is handed back through the deallocator.
pub fn encode_str<G: Guest + ?Sized>(guest: &mut G, s: &str) -> Result<GuestSlice> {
    if !guest.has_realloc() {
        return encode_bytes(guest, s.as_bytes());
    }

    let capacity = wasm_len(utf16_len(s))?;
    let mut block = GuestSlice {
        ptr: guest.malloc(capacity, 1)?,
        len: capacity,
    };
    match fill_str(guest, s, &mut block) {
        Ok(slice) => Ok(slice),
        Err(e) => {
            guest.free(block.ptr, block.len, 1)?;
            Err(e)
        }
    }
}

/// Write `s` into `block`, growing and shrinking it through `realloc`.
/// `block` always describes the allocation the module currently owns.
fn fill_str<G: Guest + ?Sized>(
    guest: &mut G,
    s: &str,
    block: &mut GuestSlice,
) -> Result<GuestSlice> {
    let ascii = s.bytes().position(|b| b >= 0x80).unwrap_or(s.len());
    guest.u8_view()?.set(block.ptr, &s.as_bytes()[..ascii])?;
    let mut written = wasm_len(ascii)?;

    if ascii < s.len() {
        let rest = &s[ascii..];
        let grown = wasm_len(utf16_len(rest))?
            .checked_mul(3)
            .and_then(|n| n.checked_add(written))
            .ok_or(BridgeError::OutOfBounds {
                ptr: block.ptr as u64,
                len: rest.len() as u64 * 3,
                size: u32::MAX as usize,
            })?;
        block.ptr = guest.realloc(block.ptr, block.len, grown, 1)?;
        block.len = grown;

        guest
            .u8_view()?
            .set(block.ptr.saturating_add(written), rest.as_bytes())?;
        written += wasm_len(rest.len())?;
        block.ptr = guest.realloc(block.ptr, block.len, written, 1)?;
        block.len = written;
    }

    Ok(GuestSlice {
        ptr: block.ptr,
        len: written,
    })
}

/// Decode a string whose ownership the module handed over, then free it.
///
/// The allocation is released even when decoding fails.
pub fn take_str<G: Guest + ?Sized>(guest: &mut G, ptr: u32, len: u32) -> Result<String> {
    let decoded = decode_str(guest, ptr, len);
    guest.free(ptr, len, 1)?;
    decoded
}

/// Copy bytes into a fresh guest allocation.
pub fn encode_bytes<G: Guest + ?Sized>(guest: &mut G, bytes: &[u8]) -> Result<GuestSlice> {
    let len = wasm_len(bytes.len())?;
    let ptr = guest.malloc(len, 1)?;
    let copied = guest.u8_view().and_then(|mut view| view.set(ptr, bytes));
    if let Err(e) = copied {
        guest.free(ptr, len, 1)?;
        return Err(e);
    }
    Ok(GuestSlice { ptr, len })
}

/// Copy `len` bytes out of guest memory.
pub fn read_bytes<M: LinearMemory + ?Sized>(mem: &mut M, ptr: u32, len: u32) -> Result<Vec<u8>> {
    Ok(mem.u8_view()?.subarray(ptr, len)?.to_vec())
}

/// Copy `len` bytes out through the clamped view.
pub fn read_clamped<M: LinearMemory + ?Sized>(mem: &mut M, ptr: u32, len: u32) -> Result<Vec<u8>> {
    Ok(mem.clamped_view()?.subarray(ptr, len)?.to_vec())
}

/// Copy `len` `u32` elements out of guest memory.
pub fn read_u32s<M: LinearMemory + ?Sized>(mem: &mut M, ptr: u32, len: u32) -> Result<Vec<u32>> {
    mem.u32_view()?.to_vec(ptr, len)
}

/// Copy `len` `f32` elements out of guest memory.
pub fn read_f32s<M: LinearMemory + ?Sized>(mem: &mut M, ptr: u32, len: u32) -> Result<Vec<f32>> {
    mem.f32_view()?.to_vec(ptr, len)
}

/// Write the two-word return: pointer at `out`, length at `out + 4`.
///
/// `None` writes a zero pointer, which the module reads as "absent".
pub fn write_slice_ret<M: LinearMemory + ?Sized>(
    mem: &mut M,
    out: u32,
    slice: Option<GuestSlice>,
) -> Result<()> {
    let slice = slice.unwrap_or_default();
    let mut view = mem.data_view()?;
    view.set_u32(out.saturating_add(4), slice.len)?;
    view.set_u32(out, slice.ptr)
}

/// Write an optional number: value at `out + 8`, presence flag at `out`.
pub fn write_number_ret<M: LinearMemory + ?Sized>(
    mem: &mut M,
    out: u32,
    value: Option<f64>,
) -> Result<()> {
    let mut view = mem.data_view()?;
    view.set_f64(out.saturating_add(8), value.unwrap_or(0.0))?;
    view.set_i32(out, value.is_some() as i32)
}
