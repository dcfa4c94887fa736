//! Fixed, dynamic, and differencing disks addressed through a Block
//! Allocation Table with per-block dirty bitmaps.
//!
//! All multi-byte fields are big-endian. The footer lives in the last 512
//! bytes of the file (sparse variants keep a copy in the first 512 bytes);
//! sparse variants add a 1024-byte header, a BAT of `u32` sector offsets
//! (`0xFFFFFFFF` = unallocated), and per-block bitmaps stored immediately
//! before each block's data.
//!
//! A *dynamic* image reads unallocated space as zero. A *differencing* image
//! forwards unallocated space — and allocated sectors whose bitmap bit is
//! clear — to a caller-supplied parent image instead; the two behaviors are
//! deliberately kept apart.

use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Arc;

use crate::util::{align_up_u64, checked_range};
use crate::{DiskError, ExtentReader, Result, VirtualDisk, MAX_PARENT_CHAIN, SECTOR_SIZE};

const VHD_FOOTER_COOKIE: [u8; 8] = *b"conectix";
const VHD_DYNAMIC_COOKIE: [u8; 8] = *b"cxsparse";

const VHD_DISK_TYPE_FIXED: u32 = 2;
const VHD_DISK_TYPE_DYNAMIC: u32 = 3;
const VHD_DISK_TYPE_DIFFERENCING: u32 = 4;

const BAT_UNALLOCATED: u32 = u32::MAX;

// Hard caps to avoid absurd allocations from untrusted images.
const MAX_BAT_BYTES: u64 = 128 * 1024 * 1024; // 128 MiB
const MAX_BITMAP_BYTES: u64 = 32 * 1024 * 1024; // 32 MiB

// Bound bitmap caching when reading large fully-allocated sparse images.
const BITMAP_CACHE_BUDGET_BYTES: u64 = 16 * 1024 * 1024; // 16 MiB

/// Decoded footer fields the read path needs.
///
/// The 512-byte wire form is not kept around; this decoder never rewrites it.
#[derive(Debug, Clone)]
struct VhdFooter {
    data_offset: u64,
    current_size: u64,
    disk_type: u32,
}

impl VhdFooter {
    fn parse(raw: &[u8; SECTOR_SIZE]) -> Result<Self> {
        if raw[..8] != VHD_FOOTER_COOKIE {
            return Err(DiskError::CorruptImage("vhd footer cookie mismatch"));
        }

        let expected = be_u32(&raw[64..68]);
        let actual = vhd_footer_checksum(raw);
        if expected != actual {
            return Err(DiskError::CorruptImage("vhd footer checksum mismatch"));
        }

        let data_offset = be_u64(&raw[16..24]);
        let current_size = be_u64(&raw[48..56]);
        let disk_type = be_u32(&raw[60..64]);

        if current_size == 0 || !current_size.is_multiple_of(SECTOR_SIZE as u64) {
            return Err(DiskError::CorruptImage("vhd current_size invalid"));
        }

        Ok(Self {
            data_offset,
            current_size,
            disk_type,
        })
    }
}

#[derive(Debug, Clone)]
struct VhdSparseHeader {
    table_offset: u64,
    max_table_entries: u32,
    block_size: u32,
    /// Identity of the parent image as recorded by the producer. Reporting
    /// only: many producers leave it stale, so parent validation is by size.
    parent_unique_id: [u8; 16],
}

impl VhdSparseHeader {
    fn parse(raw: &[u8; 1024]) -> Result<Self> {
        if raw[..8] != VHD_DYNAMIC_COOKIE {
            return Err(DiskError::CorruptImage("vhd sparse header cookie mismatch"));
        }

        let expected = be_u32(&raw[36..40]);
        let actual = vhd_sparse_header_checksum(raw);
        if expected != actual {
            return Err(DiskError::CorruptImage(
                "vhd sparse header checksum mismatch",
            ));
        }

        let table_offset = be_u64(&raw[16..24]);
        let max_table_entries = be_u32(&raw[28..32]);
        let block_size = be_u32(&raw[32..36]);
        let mut parent_unique_id = [0u8; 16];
        parent_unique_id.copy_from_slice(&raw[40..56]);

        if !table_offset.is_multiple_of(SECTOR_SIZE as u64) {
            return Err(DiskError::CorruptImage("vhd bat offset misaligned"));
        }
        if max_table_entries == 0 {
            return Err(DiskError::CorruptImage("vhd max_table_entries is zero"));
        }
        if block_size == 0 || !(block_size as u64).is_multiple_of(SECTOR_SIZE as u64) {
            return Err(DiskError::CorruptImage("vhd block_size invalid"));
        }

        Ok(Self {
            table_offset,
            max_table_entries,
            block_size,
            parent_unique_id,
        })
    }
}

/// VHD fixed/dynamic/differencing disk, read-only.
pub struct VhdDisk<B> {
    backend: B,
    footer: VhdFooter,
    sparse: Option<VhdSparseHeader>,
    bat: Vec<u32>,
    bitmap_cache: LruCache<u64, Arc<Vec<u8>>>,
    parent: Option<Box<dyn VirtualDisk>>,
}

impl<B> std::fmt::Debug for VhdDisk<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VhdDisk").finish_non_exhaustive()
    }
}

impl<B: ExtentReader> VhdDisk<B> {
    /// Open a fixed or dynamic image.
    ///
    /// Differencing images need their parent resolved and opened by the
    /// caller first; without one the chain is broken by definition.
    pub fn open(mut backend: B) -> Result<Self> {
        let (footer, len) = read_footer(&mut backend)?;

        match footer.disk_type {
            VHD_DISK_TYPE_FIXED => {
                let required_len = footer
                    .current_size
                    .checked_add(SECTOR_SIZE as u64)
                    .ok_or(DiskError::CorruptImage("vhd current_size overflow"))?;
                if len < required_len {
                    return Err(DiskError::CorruptImage("vhd fixed disk truncated"));
                }
                Ok(Self {
                    backend,
                    footer,
                    sparse: None,
                    bat: Vec::new(),
                    bitmap_cache: LruCache::new(NonZeroUsize::MIN),
                    parent: None,
                })
            }
            VHD_DISK_TYPE_DYNAMIC => Self::open_sparse(backend, footer, len, None),
            VHD_DISK_TYPE_DIFFERENCING => Err(DiskError::BrokenChain(
                "differencing image requires a parent",
            )),
            _ => Err(DiskError::Unsupported("vhd disk type")),
        }
    }

    /// Open a differencing image over an already-open parent.
    ///
    /// The parent is validated once, here: its size must match this image's
    /// virtual size, and the chain behind it must stay under
    /// [`MAX_PARENT_CHAIN`]. The stored parent identifier is *not* consulted —
    /// producers do not populate it reliably, and rejecting on it would
    /// refuse legitimate images.
    pub fn open_with_parent(mut backend: B, parent: Box<dyn VirtualDisk>) -> Result<Self> {
        let (footer, len) = read_footer(&mut backend)?;

        if footer.disk_type != VHD_DISK_TYPE_DIFFERENCING {
            return Err(DiskError::InvalidConfig(
                "parent supplied for a non-differencing image",
            ));
        }
        if parent.capacity_bytes() != footer.current_size {
            return Err(DiskError::BrokenChain("parent size mismatch"));
        }
        if parent.parent_chain_len() >= MAX_PARENT_CHAIN {
            return Err(DiskError::BrokenChain("parent chain too deep"));
        }

        Self::open_sparse(backend, footer, len, Some(parent))
    }

    fn open_sparse(
        mut backend: B,
        footer: VhdFooter,
        len: u64,
        parent: Option<Box<dyn VirtualDisk>>,
    ) -> Result<Self> {
        if footer.data_offset == u64::MAX {
            return Err(DiskError::CorruptImage("vhd sparse header offset invalid"));
        }
        if !footer.data_offset.is_multiple_of(SECTOR_SIZE as u64) {
            return Err(DiskError::CorruptImage(
                "vhd sparse header offset misaligned",
            ));
        }
        if footer.data_offset < SECTOR_SIZE as u64 {
            return Err(DiskError::CorruptImage(
                "vhd sparse header overlaps footer copy",
            ));
        }
        let footer_offset = len - SECTOR_SIZE as u64;
        let sparse_header_end = footer
            .data_offset
            .checked_add(1024)
            .ok_or(DiskError::OffsetOverflow)?;
        if sparse_header_end > footer_offset {
            return Err(DiskError::CorruptImage("vhd sparse header truncated"));
        }

        let mut raw_header = [0u8; 1024];
        match backend.read_at(footer.data_offset, &mut raw_header) {
            Ok(()) => {}
            Err(DiskError::OutOfBounds { .. }) => {
                return Err(DiskError::CorruptImage("vhd sparse header truncated"));
            }
            Err(e) => return Err(e),
        }
        let sparse = VhdSparseHeader::parse(&raw_header)?;

        let required_entries = footer.current_size.div_ceil(sparse.block_size as u64);
        if (sparse.max_table_entries as u64) < required_entries {
            return Err(DiskError::CorruptImage("vhd bat too small"));
        }

        // Validate the on-disk BAT region based on `max_table_entries`; only
        // the portion required for the advertised virtual size is read, but
        // the metadata region must still be coherent.
        let bat_size_on_disk = {
            let bat_bytes = (sparse.max_table_entries as u64)
                .checked_mul(4)
                .ok_or(DiskError::OffsetOverflow)?;
            let bat_bytes_aligned = align_up_u64(bat_bytes, SECTOR_SIZE as u64)?;
            if bat_bytes_aligned > MAX_BAT_BYTES {
                return Err(DiskError::Unsupported("vhd bat too large"));
            }
            bat_bytes_aligned
        };
        let bat_end_on_disk = sparse
            .table_offset
            .checked_add(bat_size_on_disk)
            .ok_or(DiskError::OffsetOverflow)?;
        if bat_end_on_disk > footer_offset {
            return Err(DiskError::CorruptImage("vhd bat truncated"));
        }
        if sparse.table_offset < SECTOR_SIZE as u64 {
            return Err(DiskError::CorruptImage("vhd bat overlaps footer copy"));
        }
        if sparse.table_offset < sparse_header_end && footer.data_offset < bat_end_on_disk {
            return Err(DiskError::CorruptImage("vhd bat overlaps sparse header"));
        }

        let bat_bytes = required_entries
            .checked_mul(4)
            .ok_or(DiskError::OffsetOverflow)?;
        if bat_bytes > MAX_BAT_BYTES {
            return Err(DiskError::Unsupported("vhd bat too large"));
        }
        let entries: usize = required_entries
            .try_into()
            .map_err(|_| DiskError::Unsupported("vhd bat too large"))?;
        let bat_bytes_usize: usize = bat_bytes
            .try_into()
            .map_err(|_| DiskError::Unsupported("vhd bat too large"))?;

        let mut bat_buf = vec![0u8; bat_bytes_usize];
        match backend.read_at(sparse.table_offset, &mut bat_buf) {
            Ok(()) => {}
            Err(DiskError::OutOfBounds { .. }) => {
                return Err(DiskError::CorruptImage("vhd bat truncated"));
            }
            Err(e) => return Err(e),
        }
        let mut bat = Vec::with_capacity(entries);
        for chunk in bat_buf.chunks_exact(4) {
            bat.push(be_u32(chunk));
        }

        // Size bitmap caching from the per-block bitmap size of this image.
        let sectors_per_block = (sparse.block_size as u64) / SECTOR_SIZE as u64;
        let bitmap_bytes = sectors_per_block.div_ceil(8);
        let bitmap_size = align_up_u64(bitmap_bytes, SECTOR_SIZE as u64)?;
        let cap_entries = (BITMAP_CACHE_BUDGET_BYTES / bitmap_size).max(1) as usize;
        let cap_entries = cap_entries
            .min(BITMAP_CACHE_BUDGET_BYTES as usize / SECTOR_SIZE)
            .max(1);
        let cap = NonZeroUsize::new(cap_entries).ok_or(DiskError::InvalidConfig("vhd cache"))?;

        Ok(Self {
            backend,
            footer,
            sparse: Some(sparse),
            bat,
            bitmap_cache: LruCache::new(cap),
            parent,
        })
    }

    pub fn into_backend(self) -> B {
        self.backend
    }

    pub fn is_differencing(&self) -> bool {
        self.footer.disk_type == VHD_DISK_TYPE_DIFFERENCING
    }

    /// Parent identity recorded by the producer, for reporting only.
    pub fn parent_unique_id(&self) -> Option<&[u8; 16]> {
        match (&self.sparse, self.is_differencing()) {
            (Some(header), true) => Some(&header.parent_unique_id),
            _ => None,
        }
    }

    fn backend_read_at(&mut self, offset: u64, buf: &mut [u8], ctx: &'static str) -> Result<()> {
        match self.backend.read_at(offset, buf) {
            Ok(()) => Ok(()),
            Err(DiskError::OutOfBounds { .. }) => Err(DiskError::CorruptImage(ctx)),
            Err(e) => Err(e),
        }
    }

    /// Bytes not present locally: a differencing image forwards them to its
    /// parent; a dynamic image reads zero.
    fn read_absent(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        match self.parent.as_mut() {
            Some(parent) => parent.read_at(offset, buf),
            None => {
                buf.fill(0);
                Ok(())
            }
        }
    }

    fn sparse_params(&self) -> Result<(u64, u64)> {
        let header = self
            .sparse
            .as_ref()
            .ok_or(DiskError::CorruptImage("vhd is not sparse"))?;
        let sectors_per_block = (header.block_size as u64) / SECTOR_SIZE as u64;
        let bitmap_bytes = sectors_per_block.div_ceil(8);
        let bitmap_size = align_up_u64(bitmap_bytes, SECTOR_SIZE as u64)?;
        if bitmap_size > MAX_BITMAP_BYTES {
            return Err(DiskError::Unsupported("vhd bitmap too large"));
        }
        Ok((sectors_per_block, bitmap_size))
    }

    /// Dirty-bitmap test, most-significant-bit first: bit set means the
    /// sector's data is meaningfully present in this image.
    fn bitmap_get(bitmap: &[u8], sector_in_block: u64) -> Result<bool> {
        let byte: usize = (sector_in_block / 8)
            .try_into()
            .map_err(|_| DiskError::OffsetOverflow)?;
        if byte >= bitmap.len() {
            return Err(DiskError::CorruptImage("vhd bitmap too small"));
        }
        let bit = 7 - (sector_in_block % 8) as u8;
        Ok((bitmap[byte] & (1u8 << bit)) != 0)
    }

    /// Length of the run of sectors sharing one bitmap state, starting at
    /// byte offset `within_block`, clipped to `remaining` bytes.
    fn sector_run_len(
        bitmap: &[u8],
        sectors_per_block: u64,
        within_block: u64,
        remaining: u64,
        present: bool,
    ) -> Result<u64> {
        let start_sector = within_block / SECTOR_SIZE as u64;
        let limit = within_block
            .checked_add(remaining)
            .ok_or(DiskError::OffsetOverflow)?;

        let mut sector = start_sector;
        let mut end = ((sector + 1) * SECTOR_SIZE as u64).min(limit);

        while end < limit {
            sector = sector.checked_add(1).ok_or(DiskError::OffsetOverflow)?;
            if sector >= sectors_per_block {
                break;
            }
            if Self::bitmap_get(bitmap, sector)? != present {
                break;
            }
            end = ((sector + 1) * SECTOR_SIZE as u64).min(limit);
        }

        Ok(end - within_block)
    }

    fn load_bitmap(&mut self, block_start: u64, bitmap_size: u64) -> Result<Arc<Vec<u8>>> {
        if let Some(v) = self.bitmap_cache.get(&block_start) {
            return Ok(v.clone());
        }
        let bytes: usize = bitmap_size
            .try_into()
            .map_err(|_| DiskError::Unsupported("vhd bitmap too large"))?;
        let mut bitmap = vec![0u8; bytes];
        self.backend_read_at(block_start, &mut bitmap, "vhd block bitmap truncated")?;
        let arc = Arc::new(bitmap);
        let _ = self.bitmap_cache.push(block_start, arc.clone());
        Ok(arc)
    }

    fn data_region_start(&self) -> Result<u64> {
        let header = self
            .sparse
            .as_ref()
            .ok_or(DiskError::CorruptImage("vhd is not sparse"))?;

        let footer_copy_end = SECTOR_SIZE as u64;
        let sparse_header_end = self
            .footer
            .data_offset
            .checked_add(1024)
            .ok_or(DiskError::OffsetOverflow)?;

        let bat_bytes = (header.max_table_entries as u64)
            .checked_mul(4)
            .ok_or(DiskError::OffsetOverflow)?;
        let bat_size = align_up_u64(bat_bytes, SECTOR_SIZE as u64)?;
        let bat_end = header
            .table_offset
            .checked_add(bat_size)
            .ok_or(DiskError::OffsetOverflow)?;

        Ok(footer_copy_end.max(sparse_header_end).max(bat_end))
    }

    /// A corrupt BAT entry must not let a block alias the metadata region or
    /// the required trailing footer.
    fn validate_block_bounds(&mut self, block_start: u64, bitmap_size: u64) -> Result<()> {
        let header = self
            .sparse
            .as_ref()
            .ok_or(DiskError::CorruptImage("vhd is not sparse"))?;
        let block_size = header.block_size as u64;

        let data_start = self.data_region_start()?;
        if block_start < data_start {
            return Err(DiskError::CorruptImage("vhd block overlaps metadata"));
        }

        let file_len = self.backend.len()?;
        if file_len < SECTOR_SIZE as u64 {
            return Err(DiskError::CorruptImage("vhd file truncated"));
        }
        let footer_offset = file_len - SECTOR_SIZE as u64;
        let block_total_size = bitmap_size
            .checked_add(block_size)
            .ok_or(DiskError::OffsetOverflow)?;
        let block_end = block_start
            .checked_add(block_total_size)
            .ok_or(DiskError::OffsetOverflow)?;
        if block_end > footer_offset {
            return Err(DiskError::CorruptImage("vhd block overlaps footer"));
        }

        Ok(())
    }

    fn read_at_sparse(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let block_size = self
            .sparse
            .as_ref()
            .ok_or(DiskError::CorruptImage("vhd sparse header missing"))?
            .block_size as u64;
        let (sectors_per_block, bitmap_size) = self.sparse_params()?;

        let mut pos = 0usize;
        while pos < buf.len() {
            let abs = offset
                .checked_add(pos as u64)
                .ok_or(DiskError::OffsetOverflow)?;

            let block_index = (abs / block_size) as usize;
            let within_block = abs % block_size;
            let remaining_in_block = block_size - within_block;
            let chunk_len = remaining_in_block.min((buf.len() - pos) as u64) as usize;

            if block_index >= self.bat.len() {
                return Err(DiskError::CorruptImage("vhd block index out of range"));
            }
            let bat_entry = self.bat[block_index];
            if bat_entry == BAT_UNALLOCATED {
                // Nothing local anywhere in this block.
                self.read_absent(abs, &mut buf[pos..pos + chunk_len])?;
                pos += chunk_len;
                continue;
            }

            let block_start = (bat_entry as u64)
                .checked_mul(SECTOR_SIZE as u64)
                .ok_or(DiskError::OffsetOverflow)?;
            self.validate_block_bounds(block_start, bitmap_size)?;
            let bitmap = self.load_bitmap(block_start, bitmap_size)?;

            let mut within = within_block;
            let mut remaining = chunk_len;
            while remaining > 0 {
                let sector_in_block = within / SECTOR_SIZE as u64;
                if sector_in_block >= sectors_per_block {
                    return Err(DiskError::CorruptImage("vhd sector index out of range"));
                }

                let present = Self::bitmap_get(bitmap.as_slice(), sector_in_block)?;
                let run_len_u64 = Self::sector_run_len(
                    bitmap.as_slice(),
                    sectors_per_block,
                    within,
                    remaining as u64,
                    present,
                )?;
                let run_len: usize = run_len_u64
                    .try_into()
                    .map_err(|_| DiskError::Unsupported("vhd read too large"))?;
                let run_abs = abs
                    .checked_add(within - within_block)
                    .ok_or(DiskError::OffsetOverflow)?;

                if present {
                    let phys = block_start
                        .checked_add(bitmap_size)
                        .and_then(|v| v.checked_add(within))
                        .ok_or(DiskError::OffsetOverflow)?;
                    self.backend_read_at(
                        phys,
                        &mut buf[pos..pos + run_len],
                        "vhd block data truncated",
                    )?;
                } else {
                    self.read_absent(run_abs, &mut buf[pos..pos + run_len])?;
                }

                within = within
                    .checked_add(run_len_u64)
                    .ok_or(DiskError::OffsetOverflow)?;
                pos += run_len;
                remaining -= run_len;
            }

            debug_assert_eq!(remaining, 0);
        }

        Ok(())
    }
}

impl<B: ExtentReader> VirtualDisk for VhdDisk<B> {
    fn capacity_bytes(&self) -> u64 {
        self.footer.current_size
    }

    fn parent_chain_len(&self) -> u32 {
        self.parent.as_ref().map_or(0, |p| 1 + p.parent_chain_len())
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        checked_range(offset, buf.len(), self.capacity_bytes())?;
        if buf.is_empty() {
            return Ok(());
        }

        if self.sparse.is_none() {
            return self.backend_read_at(offset, buf, "vhd fixed disk truncated");
        }

        self.read_at_sparse(offset, buf)
    }
}

fn read_footer<B: ExtentReader>(backend: &mut B) -> Result<(VhdFooter, u64)> {
    let len = backend.len()?;
    if len < SECTOR_SIZE as u64 {
        return Err(DiskError::CorruptImage("vhd file too small"));
    }
    if !len.is_multiple_of(SECTOR_SIZE as u64) {
        return Err(DiskError::CorruptImage("vhd file length misaligned"));
    }

    let footer_offset = len - SECTOR_SIZE as u64;
    let mut raw_footer = [0u8; SECTOR_SIZE];
    match backend.read_at(footer_offset, &mut raw_footer) {
        Ok(()) => {}
        Err(DiskError::OutOfBounds { .. }) => {
            return Err(DiskError::CorruptImage("vhd footer truncated"));
        }
        Err(e) => return Err(e),
    }
    Ok((VhdFooter::parse(&raw_footer)?, len))
}

fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn be_u64(bytes: &[u8]) -> u64 {
    u64::from_be_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ])
}

fn vhd_footer_checksum(raw: &[u8; SECTOR_SIZE]) -> u32 {
    ones_complement_sum(raw, 64..68)
}

fn vhd_sparse_header_checksum(raw: &[u8; 1024]) -> u32 {
    ones_complement_sum(raw, 36..40)
}

fn ones_complement_sum(raw: &[u8], checksum_field: std::ops::Range<usize>) -> u32 {
    let mut sum: u32 = 0;
    for (i, b) in raw.iter().enumerate() {
        if checksum_field.contains(&i) {
            continue;
        }
        sum = sum.wrapping_add(*b as u32);
    }
    !sum
}
