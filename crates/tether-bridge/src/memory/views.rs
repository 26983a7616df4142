//! View types handed out by the cache.
//!
//! All multi-byte access is little-endian, matching wasm linear memory.

use super::check_range;
use crate::error::{BridgeError, Result};

/// `u8` window over linear memory.
pub struct ByteView<'m> {
    data: &'m mut [u8],
}

impl<'m> ByteView<'m> {
    pub(super) fn new(data: &'m mut [u8]) -> Self {
        Self { data }
    }

    /// Buffer length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True for a zero-length buffer.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Borrow `len` bytes at `ptr`.
    pub fn subarray(&self, ptr: u32, len: u32) -> Result<&[u8]> {
        let range = check_range(ptr as u64, len as u64, self.data.len())?;
        Ok(&self.data[range])
    }

    /// Mutably borrow `len` bytes at `ptr`.
    pub fn subarray_mut(&mut self, ptr: u32, len: u32) -> Result<&mut [u8]> {
        let range = check_range(ptr as u64, len as u64, self.data.len())?;
        Ok(&mut self.data[range])
    }

    /// Copy `bytes` into memory at `ptr`.
    pub fn set(&mut self, ptr: u32, bytes: &[u8]) -> Result<()> {
        self.subarray_mut(ptr, bytes.len() as u32)?
            .copy_from_slice(bytes);
        Ok(())
    }
}

/// `u8` window with saturating stores, for pixel data.
pub struct ClampedView<'m> {
    data: &'m mut [u8],
}

impl<'m> ClampedView<'m> {
    pub(super) fn new(data: &'m mut [u8]) -> Self {
        Self { data }
    }

    /// Buffer length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True for a zero-length buffer.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Borrow `len` bytes at `ptr`.
    pub fn subarray(&self, ptr: u32, len: u32) -> Result<&[u8]> {
        let range = check_range(ptr as u64, len as u64, self.data.len())?;
        Ok(&self.data[range])
    }

    /// Store `value` at `index`, rounded half-to-even and clamped to `0..=255`.
    pub fn set_clamped(&mut self, index: u32, value: f64) -> Result<()> {
        let range = check_range(index as u64, 1, self.data.len())?;
        self.data[range.start] = clamp_u8(value);
        Ok(())
    }
}

/// Uint8ClampedArray conversion: NaN becomes 0, ties round to even.
pub(crate) fn clamp_u8(value: f64) -> u8 {
    if value.is_nan() || value <= 0.0 {
        return 0;
    }
    if value >= 255.0 {
        return 255;
    }
    let floor = value.floor();
    let diff = value - floor;
    let rounded = if diff > 0.5 || (diff == 0.5 && floor % 2.0 != 0.0) {
        floor + 1.0
    } else {
        floor
    };
    rounded as u8
}

macro_rules! word_view {
    ($(#[$meta:meta])* $name:ident, $elem:ty) => {
        $(#[$meta])*
        pub struct $name<'m> {
            data: &'m mut [u8],
        }

        impl<'m> $name<'m> {
            const WIDTH: u32 = std::mem::size_of::<$elem>() as u32;

            pub(super) fn new(data: &'m mut [u8]) -> Self {
                Self { data }
            }

            /// Number of whole elements in the buffer.
            pub fn len(&self) -> usize {
                self.data.len() / Self::WIDTH as usize
            }

            /// True if the buffer holds no whole element.
            pub fn is_empty(&self) -> bool {
                self.len() == 0
            }

            /// Copy `len` elements starting at byte address `ptr`.
            pub fn to_vec(&self, ptr: u32, len: u32) -> Result<Vec<$elem>> {
                let range = self.range(ptr, len)?;
                Ok(self.data[range]
                    .chunks_exact(Self::WIDTH as usize)
                    .map(|c| <$elem>::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect())
            }

            /// Read the element at element index `index`.
            pub fn get(&self, index: u32) -> Result<$elem> {
                let ptr = index
                    .checked_mul(Self::WIDTH)
                    .ok_or(BridgeError::OutOfBounds {
                        ptr: index as u64 * Self::WIDTH as u64,
                        len: Self::WIDTH as u64,
                        size: self.data.len(),
                    })?;
                Ok(self.to_vec(ptr, 1)?[0])
            }

            /// Write `values` starting at byte address `ptr`.
            pub fn set(&mut self, ptr: u32, values: &[$elem]) -> Result<()> {
                let range = self.range(ptr, values.len() as u32)?;
                for (chunk, v) in self.data[range]
                    .chunks_exact_mut(Self::WIDTH as usize)
                    .zip(values)
                {
                    chunk.copy_from_slice(&v.to_le_bytes());
                }
                Ok(())
            }

            fn range(&self, ptr: u32, len: u32) -> Result<std::ops::Range<usize>> {
                if ptr % Self::WIDTH != 0 {
                    return Err(BridgeError::Misaligned {
                        ptr,
                        width: Self::WIDTH,
                    });
                }
                check_range(
                    ptr as u64,
                    len as u64 * Self::WIDTH as u64,
                    self.data.len(),
                )
            }
        }
    };
}

word_view!(
    /// Little-endian `u32` window; addresses must be 4-aligned.
    U32View,
    u32
);

word_view!(
    /// Little-endian `f32` window; addresses must be 4-aligned.
    F32View,
    f32
);

/// Byte-addressed accessor for mixed-width fields such as out-parameters.
pub struct DataView<'m> {
    data: &'m mut [u8],
}

impl<'m> DataView<'m> {
    pub(super) fn new(data: &'m mut [u8]) -> Self {
        Self { data }
    }

    /// Buffer length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True for a zero-length buffer.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn read<const N: usize>(&self, offset: u32) -> Result<[u8; N]> {
        let range = check_range(offset as u64, N as u64, self.data.len())?;
        let mut out = [0u8; N];
        out.copy_from_slice(&self.data[range]);
        Ok(out)
    }

    fn write<const N: usize>(&mut self, offset: u32, bytes: [u8; N]) -> Result<()> {
        let range = check_range(offset as u64, N as u64, self.data.len())?;
        self.data[range].copy_from_slice(&bytes);
        Ok(())
    }

    /// Read an `i32`.
    pub fn get_i32(&self, offset: u32) -> Result<i32> {
        self.read(offset).map(i32::from_le_bytes)
    }

    /// Read a `u32`.
    pub fn get_u32(&self, offset: u32) -> Result<u32> {
        self.read(offset).map(u32::from_le_bytes)
    }

    /// Read an `f64`.
    pub fn get_f64(&self, offset: u32) -> Result<f64> {
        self.read(offset).map(f64::from_le_bytes)
    }

    /// Write an `i32`.
    pub fn set_i32(&mut self, offset: u32, value: i32) -> Result<()> {
        self.write(offset, value.to_le_bytes())
    }

    /// Write a `u32`.
    pub fn set_u32(&mut self, offset: u32, value: u32) -> Result<()> {
        self.write(offset, value.to_le_bytes())
    }

    /// Write an `f64`.
    pub fn set_f64(&mut self, offset: u32, value: f64) -> Result<()> {
        self.write(offset, value.to_le_bytes())
    }
}
