use crate::util::checked_range;
use crate::{DiskError, ExtentReader, Result};

/// Fixed logical block size shared by every format in this crate.
pub const SECTOR_SIZE: usize = 512;

/// Maximum differencing-chain length accepted at open time.
///
/// Chains must terminate; anything deeper than this is treated as a broken
/// (most likely cyclic) parent reference rather than walked further.
pub const MAX_PARENT_CHAIN: u32 = 32;

/// Read-only, byte-addressed view of a decoded disk image.
pub trait VirtualDisk {
    /// Size of the logical address space in bytes.
    fn capacity_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes at byte `offset`.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Number of parent images behind this one (0 for a base image).
    fn parent_chain_len(&self) -> u32 {
        0
    }

    /// Total number of 512-byte logical blocks.
    fn total_sectors(&self) -> u64 {
        self.capacity_bytes() / SECTOR_SIZE as u64
    }

    /// Read whole 512-byte blocks starting at logical block `lba`.
    fn read_sectors(&mut self, lba: u64, buf: &mut [u8]) -> Result<()> {
        if !buf.len().is_multiple_of(SECTOR_SIZE) {
            return Err(DiskError::UnalignedLength {
                len: buf.len(),
                alignment: SECTOR_SIZE,
            });
        }
        let offset = lba
            .checked_mul(SECTOR_SIZE as u64)
            .ok_or(DiskError::OffsetOverflow)?;
        self.read_at(offset, buf)
    }
}

/// Raw (headerless) image: the logical address space is the backing extent
/// itself.
pub struct RawDisk<B> {
    backend: B,
    capacity: u64,
}

impl<B: ExtentReader> RawDisk<B> {
    pub fn open(mut backend: B) -> Result<Self> {
        let capacity = backend.len()?;
        Ok(Self { backend, capacity })
    }

    pub fn into_backend(self) -> B {
        self.backend
    }
}

impl<B: ExtentReader> VirtualDisk for RawDisk<B> {
    fn capacity_bytes(&self) -> u64 {
        self.capacity
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        checked_range(offset, buf.len(), self.capacity)?;
        if buf.is_empty() {
            return Ok(());
        }
        self.backend.read_at(offset, buf)
    }
}
