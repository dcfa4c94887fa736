//! Sparse VM disks: two-level grain-directory/grain-table addressing.
//!
//! All multi-byte fields are little-endian. A 512-byte header describes a
//! grain directory (array of `u32` grain-table sector offsets); each grain
//! table holds `u32` grain sector pointers, one per grain-sized run of
//! logical blocks. Pointer `0` means "unallocated — consult the parent if
//! this image has one, otherwise read zero"; pointer `1` means "unallocated,
//! read zero" regardless of any parent. The whole directory is decoded into
//! memory at open time and never changes afterwards.

use std::sync::Arc;

use crate::cache::{BlockCache, CacheStats, ChunkCache, ChunkKey, DEFAULT_CHUNK_CACHE_BYTES};
use crate::util::checked_range;
use crate::{DiskError, ExtentReader, Result, VirtualDisk, MAX_PARENT_CHAIN, SECTOR_SIZE};

const SPARSE_MAGIC: [u8; 4] = *b"KDMV";
const SPARSE_HEADER_SIZE: usize = 512;

/// Grain-pointer sentinels.
const GRAIN_UNALLOCATED: u32 = 0;
const GRAIN_ZERO: u32 = 1;

// Directory metadata lives past this sentinel only in stream-optimized
// images, which this decoder does not handle.
const GD_AT_END: u64 = u64::MAX;

// Hard caps to avoid absurd allocations from untrusted images.
const MAX_GD_BYTES: u64 = 16 * 1024 * 1024; // 16 MiB
const MAX_GT_TOTAL_BYTES: u64 = 128 * 1024 * 1024; // 128 MiB
const MAX_GRAIN_BYTES: u64 = 64 * 1024 * 1024; // 64 MiB

#[derive(Debug, Clone)]
struct SparseHeader {
    capacity_sectors: u64,
    grain_size_sectors: u64,
    gtes_per_gt: u32,
    gd_offset_sectors: u64,
    /// End of the metadata region in sectors; grain data never starts before
    /// this.
    overhead_sectors: u64,
}

impl SparseHeader {
    fn parse(raw: &[u8; SPARSE_HEADER_SIZE]) -> Result<Self> {
        if raw[..4] != SPARSE_MAGIC {
            return Err(DiskError::CorruptImage("sparse extent magic mismatch"));
        }
        let version = le_u32(&raw[4..8]);
        if !(1..=3).contains(&version) {
            return Err(DiskError::Unsupported("sparse extent version"));
        }

        let capacity_sectors = le_u64(&raw[12..20]);
        let grain_size_sectors = le_u64(&raw[20..28]);
        let gtes_per_gt = le_u32(&raw[44..48]);
        let gd_offset_sectors = le_u64(&raw[56..64]);
        let overhead_sectors = le_u64(&raw[64..72]);
        let compress_algorithm = le_u16(&raw[77..79]);

        if capacity_sectors == 0 {
            return Err(DiskError::CorruptImage("sparse extent capacity is zero"));
        }
        if grain_size_sectors == 0 || !grain_size_sectors.is_power_of_two() {
            return Err(DiskError::CorruptImage("sparse extent grain size invalid"));
        }
        if gtes_per_gt == 0 {
            return Err(DiskError::CorruptImage("sparse extent grain table size is zero"));
        }
        if gd_offset_sectors == 0 {
            return Err(DiskError::CorruptImage("sparse extent directory offset is zero"));
        }
        if gd_offset_sectors == GD_AT_END {
            return Err(DiskError::Unsupported("grain directory at end of file"));
        }
        if compress_algorithm != 0 {
            return Err(DiskError::Unsupported("compressed sparse extent"));
        }

        Ok(Self {
            capacity_sectors,
            grain_size_sectors,
            gtes_per_gt,
            gd_offset_sectors,
            overhead_sectors,
        })
    }
}

/// Sparse VM disk, read-only, optionally layered over a parent.
pub struct VmdkDisk<B> {
    backend: B,
    header: SparseHeader,
    /// One slot per grain directory entry; `None` when the whole grain-table
    /// span is unallocated (directory entry 0).
    grain_tables: Vec<Option<Vec<u32>>>,
    parent: Option<Box<dyn VirtualDisk>>,
    grain_cache: ChunkCache,
    block_cache: BlockCache,
}

impl<B> std::fmt::Debug for VmdkDisk<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmdkDisk").finish_non_exhaustive()
    }
}

impl<B: ExtentReader> VmdkDisk<B> {
    /// Open a base image: unallocated grains read as zero.
    pub fn open(backend: B) -> Result<Self> {
        Self::open_with_cache(backend, None, DEFAULT_CHUNK_CACHE_BYTES)
    }

    /// Open a copy-on-write image over an already-open parent: unallocated
    /// grains (pointer `0`) are forwarded to the parent instead of reading as
    /// zero. Explicit zero grains (pointer `1`) never consult the parent.
    ///
    /// The parent is validated once, here, by size equality and chain depth.
    pub fn open_with_parent(backend: B, parent: Box<dyn VirtualDisk>) -> Result<Self> {
        Self::open_with_cache(backend, Some(parent), DEFAULT_CHUNK_CACHE_BYTES)
    }

    /// Open with an explicit grain-cache byte budget; the block cache gets the
    /// same byte budget, counted in blocks.
    pub fn open_with_cache(
        mut backend: B,
        parent: Option<Box<dyn VirtualDisk>>,
        cache_bytes: u64,
    ) -> Result<Self> {
        let mut raw_header = [0u8; SPARSE_HEADER_SIZE];
        match backend.read_at(0, &mut raw_header) {
            Ok(()) => {}
            Err(DiskError::OutOfBounds { .. }) => {
                return Err(DiskError::CorruptImage("sparse extent header truncated"));
            }
            Err(e) => return Err(e),
        }
        let header = SparseHeader::parse(&raw_header)?;

        let capacity_bytes = header
            .capacity_sectors
            .checked_mul(SECTOR_SIZE as u64)
            .ok_or(DiskError::CorruptImage("sparse extent capacity overflow"))?;

        let grain_bytes = header
            .grain_size_sectors
            .checked_mul(SECTOR_SIZE as u64)
            .ok_or(DiskError::OffsetOverflow)?;
        if grain_bytes > MAX_GRAIN_BYTES {
            return Err(DiskError::Unsupported("sparse extent grain too large"));
        }

        if let Some(parent) = &parent {
            if parent.capacity_bytes() != capacity_bytes {
                return Err(DiskError::BrokenChain("parent size mismatch"));
            }
            if parent.parent_chain_len() >= MAX_PARENT_CHAIN {
                return Err(DiskError::BrokenChain("parent chain too deep"));
            }
        }

        let grains_per_gt_span = header
            .grain_size_sectors
            .checked_mul(header.gtes_per_gt as u64)
            .ok_or(DiskError::OffsetOverflow)?;
        let gd_entries = header.capacity_sectors.div_ceil(grains_per_gt_span);

        let gd_bytes = gd_entries.checked_mul(4).ok_or(DiskError::OffsetOverflow)?;
        if gd_bytes > MAX_GD_BYTES {
            return Err(DiskError::Unsupported("grain directory too large"));
        }
        let gt_bytes = (header.gtes_per_gt as u64)
            .checked_mul(4)
            .ok_or(DiskError::OffsetOverflow)?;
        let gt_total_bytes = gd_entries
            .checked_mul(gt_bytes)
            .ok_or(DiskError::OffsetOverflow)?;
        if gt_total_bytes > MAX_GT_TOTAL_BYTES {
            return Err(DiskError::Unsupported("grain tables too large"));
        }

        let gd_offset = header
            .gd_offset_sectors
            .checked_mul(SECTOR_SIZE as u64)
            .ok_or(DiskError::OffsetOverflow)?;
        let mut gd_buf = vec![0u8; gd_bytes as usize];
        match backend.read_at(gd_offset, &mut gd_buf) {
            Ok(()) => {}
            Err(DiskError::OutOfBounds { .. }) => {
                return Err(DiskError::CorruptImage("grain directory truncated"));
            }
            Err(e) => return Err(e),
        }

        // The directory is built exactly once: every referenced grain table is
        // read in full here, so per-read work is pure arithmetic plus data I/O.
        let mut grain_tables = Vec::with_capacity(gd_entries as usize);
        let mut gt_buf = vec![0u8; gt_bytes as usize];
        for gde in gd_buf.chunks_exact(4) {
            let gt_offset_sectors = le_u32(gde);
            if gt_offset_sectors == 0 {
                grain_tables.push(None);
                continue;
            }
            let gt_offset = (gt_offset_sectors as u64)
                .checked_mul(SECTOR_SIZE as u64)
                .ok_or(DiskError::OffsetOverflow)?;
            match backend.read_at(gt_offset, &mut gt_buf) {
                Ok(()) => {}
                Err(DiskError::OutOfBounds { .. }) => {
                    return Err(DiskError::CorruptImage("grain table truncated"));
                }
                Err(e) => return Err(e),
            }
            grain_tables.push(Some(gt_buf.chunks_exact(4).map(le_u32).collect()));
        }

        Ok(Self {
            backend,
            header,
            grain_tables,
            parent,
            grain_cache: ChunkCache::new(cache_bytes),
            block_cache: BlockCache::with_byte_budget(cache_bytes),
        })
    }

    pub fn into_backend(self) -> B {
        self.backend
    }

    pub fn grain_size_sectors(&self) -> u64 {
        self.header.grain_size_sectors
    }

    pub fn grain_cache_stats(&self) -> CacheStats {
        self.grain_cache.stats()
    }

    pub fn block_cache_stats(&self) -> CacheStats {
        self.block_cache.stats()
    }

    fn grain_pointer(&self, grain_index: u64) -> Result<u32> {
        let gd_index: usize = (grain_index / self.header.gtes_per_gt as u64)
            .try_into()
            .map_err(|_| DiskError::OffsetOverflow)?;
        match self.grain_tables.get(gd_index) {
            None => Err(DiskError::CorruptImage("grain index out of range")),
            Some(None) => Ok(GRAIN_UNALLOCATED),
            Some(Some(gt)) => {
                let gt_index = (grain_index % self.header.gtes_per_gt as u64) as usize;
                Ok(gt[gt_index])
            }
        }
    }

    /// Read one whole grain through the grain cache.
    fn materialize_grain(&mut self, grain_index: u64, pointer: u32) -> Result<Arc<Vec<u8>>> {
        let key = ChunkKey {
            extent: 0,
            start_sector: grain_index * self.header.grain_size_sectors,
        };
        if let Some(buf) = self.grain_cache.get(&key) {
            return Ok(buf);
        }

        if (pointer as u64) < self.header.overhead_sectors {
            return Err(DiskError::CorruptImage("grain overlaps metadata"));
        }
        let grain_bytes = (self.header.grain_size_sectors as usize) * SECTOR_SIZE;
        let at = (pointer as u64)
            .checked_mul(SECTOR_SIZE as u64)
            .ok_or(DiskError::OffsetOverflow)?;
        let mut buf = vec![0u8; grain_bytes];
        match self.backend.read_at(at, &mut buf) {
            Ok(()) => {}
            Err(DiskError::OutOfBounds { .. }) => {
                return Err(DiskError::CorruptImage("grain data truncated"));
            }
            Err(e) => return Err(e),
        }

        let buf = Arc::new(buf);
        self.grain_cache.insert(key, buf.clone());
        Ok(buf)
    }

    fn read_one_sector(&mut self, lba: u64, out: &mut [u8; SECTOR_SIZE]) -> Result<()> {
        if self.block_cache.get(lba, out) {
            return Ok(());
        }

        let grain_index = lba / self.header.grain_size_sectors;
        let sector_in_grain = lba % self.header.grain_size_sectors;

        match self.grain_pointer(grain_index)? {
            GRAIN_UNALLOCATED => match self.parent.as_mut() {
                Some(parent) => parent.read_at(lba * SECTOR_SIZE as u64, out)?,
                None => out.fill(0),
            },
            GRAIN_ZERO => out.fill(0),
            pointer => {
                let grain = self.materialize_grain(grain_index, pointer)?;
                let start = sector_in_grain as usize * SECTOR_SIZE;
                out.copy_from_slice(&grain[start..start + SECTOR_SIZE]);
            }
        }

        self.block_cache.insert(lba, out);
        Ok(())
    }
}

impl<B: ExtentReader> VirtualDisk for VmdkDisk<B> {
    fn capacity_bytes(&self) -> u64 {
        self.header.capacity_sectors * SECTOR_SIZE as u64
    }

    fn parent_chain_len(&self) -> u32 {
        self.parent.as_ref().map_or(0, |p| 1 + p.parent_chain_len())
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        checked_range(offset, buf.len(), self.capacity_bytes())?;

        let mut pos = 0usize;
        let mut sector_buf = [0u8; SECTOR_SIZE];
        while pos < buf.len() {
            let abs = offset + pos as u64;
            let lba = abs / SECTOR_SIZE as u64;
            let within = (abs % SECTOR_SIZE as u64) as usize;
            let chunk_len = (SECTOR_SIZE - within).min(buf.len() - pos);

            self.read_one_sector(lba, &mut sector_buf)?;
            buf[pos..pos + chunk_len].copy_from_slice(&sector_buf[within..within + chunk_len]);

            pos += chunk_len;
        }

        Ok(())
    }
}

fn le_u16(bytes: &[u8]) -> u16 {
    u16::from_le_bytes([bytes[0], bytes[1]])
}

fn le_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn le_u64(bytes: &[u8]) -> u64 {
    u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ])
}
