//! Adapter types for using `tern-storage` disks with `std::io`-shaped
//! consumers.
//!
//! The decoders expose [`tern_storage::VirtualDisk`], a byte-addressed,
//! `&mut self` interface. Two wrappers bridge the common gaps:
//!
//! - [`SharedSectorDisk`]: a lock-guarded, sector-aligned view for callers
//!   that share one open handle (the directory behind a handle is immutable,
//!   so serializing the calls is all that's needed)
//! - [`DiskReader`]: a `std::io::Read + Seek` adapter so filesystem parsers
//!   and other stream consumers can walk image contents
//!
//! Error classification into [`std::io::ErrorKind`] lives in
//! [`map_disk_error_to_io`] and preserves the source error for downcasting.

use std::io;
use std::sync::Mutex;

use tern_storage::{DiskError, VirtualDisk, SECTOR_SIZE};

/// Classify a [`DiskError`] into the closest [`io::ErrorKind`], keeping the
/// original error as the source.
pub fn map_disk_error_to_io(err: DiskError) -> io::Error {
    match err {
        err @ (DiskError::UnalignedLength { .. }
        | DiskError::OffsetOverflow
        | DiskError::InvalidConfig(_)) => io::Error::new(io::ErrorKind::InvalidInput, err),
        err @ (DiskError::CorruptImage(_) | DiskError::BrokenChain(_)) => {
            io::Error::new(io::ErrorKind::InvalidData, err)
        }
        err @ DiskError::OutOfBounds { .. } => io::Error::new(io::ErrorKind::UnexpectedEof, err),
        err @ (DiskError::Unsupported(_) | DiskError::NotSupported(_)) => {
            io::Error::new(io::ErrorKind::Unsupported, err)
        }
        err @ DiskError::Io(_) => io::Error::other(err),
    }
}

/// Lock-guarded, sector-aligned view over one shared disk handle.
///
/// Enforces 512-byte alignment and bounds at the boundary so device-style
/// consumers cannot issue torn sector reads.
pub struct SharedSectorDisk {
    disk: Mutex<Box<dyn VirtualDisk>>,
}

impl SharedSectorDisk {
    pub const SECTOR_SIZE: u64 = SECTOR_SIZE as u64;

    pub fn new(disk: Box<dyn VirtualDisk>) -> Self {
        Self {
            disk: Mutex::new(disk),
        }
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.with_disk(|disk| disk.capacity_bytes())
    }

    /// Read exactly `buf.len()` bytes at `offset`, both sector-aligned.
    pub fn read_at_aligned(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.check_access(offset, buf.len())?;
        self.with_disk_mut(|disk| disk.read_at(offset, buf))
            .map_err(map_disk_error_to_io)
    }

    fn check_access(&self, offset: u64, len: usize) -> io::Result<()> {
        let len_u64 = u64::try_from(len).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "length does not fit in u64")
        })?;
        if !offset.is_multiple_of(Self::SECTOR_SIZE) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "unaligned offset {offset} (expected multiple of {})",
                    Self::SECTOR_SIZE
                ),
            ));
        }
        if !len_u64.is_multiple_of(Self::SECTOR_SIZE) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "unaligned length {len} (expected multiple of {})",
                    Self::SECTOR_SIZE
                ),
            ));
        }
        let end = offset
            .checked_add(len_u64)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "offset overflow"))?;
        let cap = self.capacity_bytes();
        if end > cap {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("out of bounds: offset={offset} len={len} capacity={cap}"),
            ));
        }
        Ok(())
    }

    fn with_disk<R>(&self, f: impl FnOnce(&dyn VirtualDisk) -> R) -> R {
        let guard = self
            .disk
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&**guard)
    }

    fn with_disk_mut<R>(&self, f: impl FnOnce(&mut dyn VirtualDisk) -> R) -> R {
        let mut guard = self
            .disk
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut **guard)
    }
}

impl From<Box<dyn VirtualDisk>> for SharedSectorDisk {
    fn from(disk: Box<dyn VirtualDisk>) -> Self {
        Self::new(disk)
    }
}

/// `std::io::Read + Seek` adapter over a decoded disk.
///
/// Reads past the end of the image return 0 like any other reader at EOF.
pub struct DiskReader<D> {
    disk: D,
    pos: u64,
}

impl<D: VirtualDisk> DiskReader<D> {
    pub fn new(disk: D) -> Self {
        Self { disk, pos: 0 }
    }

    pub fn into_inner(self) -> D {
        self.disk
    }

    pub fn position(&self) -> u64 {
        self.pos
    }
}

impl<D: VirtualDisk> io::Read for DiskReader<D> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let capacity = self.disk.capacity_bytes();
        if self.pos >= capacity {
            return Ok(0);
        }
        let available = capacity - self.pos;
        let len = (buf.len() as u64).min(available) as usize;
        self.disk
            .read_at(self.pos, &mut buf[..len])
            .map_err(map_disk_error_to_io)?;
        self.pos += len as u64;
        Ok(len)
    }
}

impl<D: VirtualDisk> io::Seek for DiskReader<D> {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        let capacity = self.disk.capacity_bytes();
        let new_pos = match pos {
            io::SeekFrom::Start(offset) => Some(offset),
            io::SeekFrom::End(delta) => capacity.checked_add_signed(delta),
            io::SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
        };
        match new_pos {
            // Seeking past the end is allowed; subsequent reads return 0.
            Some(p) => {
                self.pos = p;
                Ok(p)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek to a negative or overflowing position",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom};
    use tern_storage::{MemBackend, RawDisk};

    fn pattern_disk(sectors: u64) -> RawDisk<MemBackend> {
        let len = sectors * SECTOR_SIZE as u64;
        let bytes: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let mut backend = MemBackend::new();
        backend.write_at(0, &bytes).unwrap();
        RawDisk::open(backend).unwrap()
    }

    #[test]
    fn shared_disk_enforces_alignment_and_bounds() {
        let cap = 4 * SECTOR_SIZE as u64;
        let disk = RawDisk::open(MemBackend::with_len(cap).unwrap()).unwrap();
        let shared = SharedSectorDisk::new(Box::new(disk));

        // Unaligned length.
        let mut buf = [0u8; 1];
        let err = shared.read_at_aligned(0, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

        // Unaligned offset.
        let mut buf = [0u8; SECTOR_SIZE];
        let err = shared.read_at_aligned(1, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

        // Out of bounds.
        let err = shared.read_at_aligned(cap, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);

        // Offset arithmetic overflow (but still sector-aligned).
        let offset = u64::MAX - (SECTOR_SIZE as u64 - 1);
        let err = shared.read_at_aligned(offset, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

        // A proper read works.
        shared.read_at_aligned(0, &mut buf).unwrap();
    }

    #[test]
    fn map_disk_error_classifies_and_preserves_the_source() {
        let err = map_disk_error_to_io(DiskError::Unsupported("feature"));
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
        assert!(matches!(
            err.get_ref().and_then(|e| e.downcast_ref::<DiskError>()),
            Some(DiskError::Unsupported("feature"))
        ));

        let err = map_disk_error_to_io(DiskError::CorruptImage("bad"));
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let err = map_disk_error_to_io(DiskError::BrokenChain("no parent"));
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let err = map_disk_error_to_io(DiskError::OutOfBounds {
            offset: 4,
            len: 1,
            capacity: 4,
        });
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);

        let err = map_disk_error_to_io(DiskError::UnalignedLength {
            len: 1,
            alignment: SECTOR_SIZE,
        });
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

        let err = map_disk_error_to_io(DiskError::OffsetOverflow);
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

        let err = map_disk_error_to_io(DiskError::Io("boom".into()));
        assert_eq!(err.kind(), io::ErrorKind::Other);
    }

    #[test]
    fn disk_reader_streams_the_whole_image() {
        let mut reader = DiskReader::new(pattern_disk(3));
        let mut all = Vec::new();
        reader.read_to_end(&mut all).unwrap();
        assert_eq!(all.len(), 3 * SECTOR_SIZE);
        assert_eq!(all[0], 0);
        assert_eq!(all[300], (300 % 251) as u8);
    }

    #[test]
    fn disk_reader_seeks_like_a_file() {
        let mut reader = DiskReader::new(pattern_disk(3));

        reader.seek(SeekFrom::Start(600)).unwrap();
        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(buf[0], (600 % 251) as u8);
        assert_eq!(reader.position(), 604);

        let end = reader.seek(SeekFrom::End(-4)).unwrap();
        assert_eq!(end, 3 * SECTOR_SIZE as u64 - 4);
        assert_eq!(reader.read(&mut buf).unwrap(), 4);

        // At EOF reads return 0.
        assert_eq!(reader.read(&mut buf).unwrap(), 0);

        let err = reader.seek(SeekFrom::Current(-1_000_000)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
