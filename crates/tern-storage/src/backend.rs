//! Byte-level access to the store backing an image.
//!
//! Formats never touch files directly; they go through [`ExtentReader`] so the
//! same decoder works over an in-memory fixture, a local file, or anything
//! else that can service positioned reads.

use std::fs::File;
use std::path::Path;

use crate::{DiskError, Result};

/// Random-access reader over a named underlying byte store.
///
/// Reads are positioned: implementations must not rely on a shared
/// seek-then-read pair, which races when a handle is shared.
pub trait ExtentReader {
    /// Total length of the extent in bytes.
    fn len(&mut self) -> Result<u64>;

    /// Read exactly `buf.len()` bytes at `offset`.
    ///
    /// A read that would run past the end of the extent fails with
    /// [`DiskError::OutOfBounds`] without transferring anything.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;
}

/// Growable in-memory extent.
///
/// The trait surface is read-only like every other backend; the inherent
/// mutators exist so tests and tools can assemble image fixtures.
#[derive(Debug, Default, Clone)]
pub struct MemBackend {
    data: Vec<u8>,
}

impl MemBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_len(len: u64) -> Result<Self> {
        let len: usize = len
            .try_into()
            .map_err(|_| DiskError::InvalidConfig("backend length does not fit in memory"))?;
        Ok(Self {
            data: vec![0u8; len],
        })
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    /// Write `buf` at `offset`, growing the extent as needed.
    pub fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        let offset: usize = offset.try_into().map_err(|_| DiskError::OffsetOverflow)?;
        let end = offset
            .checked_add(buf.len())
            .ok_or(DiskError::OffsetOverflow)?;
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[offset..end].copy_from_slice(buf);
        Ok(())
    }

    /// Grow or truncate the extent; new bytes read as zero.
    pub fn set_len(&mut self, len: u64) -> Result<()> {
        let len: usize = len.try_into().map_err(|_| DiskError::OffsetOverflow)?;
        self.data.resize(len, 0);
        Ok(())
    }
}

impl ExtentReader for MemBackend {
    fn len(&mut self) -> Result<u64> {
        Ok(self.data.len() as u64)
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or(DiskError::OffsetOverflow)?;
        if end > self.data.len() as u64 {
            return Err(DiskError::OutOfBounds {
                offset,
                len: buf.len(),
                capacity: self.data.len() as u64,
            });
        }
        let offset = offset as usize;
        buf.copy_from_slice(&self.data[offset..offset + buf.len()]);
        Ok(())
    }
}

/// Positioned reads over a [`std::fs::File`].
///
/// On unix the file cursor is never moved, so a handle obtained with
/// `try_clone` can be shared with other readers.
#[derive(Debug)]
pub struct FileBackend {
    file: File,
}

impl FileBackend {
    /// Open `path` read-only.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref()).map_err(|e| DiskError::Io(e.to_string()))?;
        Ok(Self { file })
    }

    pub fn from_file(file: File) -> Self {
        Self { file }
    }

    pub fn into_file(self) -> File {
        self.file
    }
}

impl ExtentReader for FileBackend {
    fn len(&mut self) -> Result<u64> {
        self.file
            .metadata()
            .map(|m| m.len())
            .map_err(|e| DiskError::Io(e.to_string()))
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let file_len = self.len()?;
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or(DiskError::OffsetOverflow)?;
        if end > file_len {
            return Err(DiskError::OutOfBounds {
                offset,
                len: buf.len(),
                capacity: file_len,
            });
        }
        read_exact_at(&self.file, offset, buf)
    }
}

#[cfg(unix)]
fn read_exact_at(file: &File, offset: u64, buf: &mut [u8]) -> Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
        .map_err(|e| DiskError::Io(e.to_string()))
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut offset: u64, mut buf: &mut [u8]) -> Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = file
            .seek_read(buf, offset)
            .map_err(|e| DiskError::Io(e.to_string()))?;
        if n == 0 {
            return Err(DiskError::Io("unexpected end of file".into()));
        }
        let rest = buf;
        buf = &mut rest[n..];
        offset += n as u64;
    }
    Ok(())
}
