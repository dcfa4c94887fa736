//! Chunked images: a flat, sorted run-length allocation table in front of
//! verbatim or compressed payload data.
//!
//! The table partitions the logical address space into variable-length runs
//! ("chunks"), each carrying one allocation decision: read as zero, copy
//! verbatim bytes, or decode a compressed payload through a pluggable
//! [`Decompressor`]. All multi-byte fields are big-endian.
//!
//! Locating the table inside its container (trailers, property lists,
//! partition maps) is the caller's business; [`ChunkedDisk::open`] takes the
//! raw table bytes.

use std::sync::Arc;

use crate::cache::{BlockCache, CacheStats, ChunkCache, ChunkKey, DEFAULT_CHUNK_CACHE_BYTES};
use crate::codec::{CodecId, Decompressor};
use crate::util::checked_range;
use crate::{DiskError, ExtentReader, Result, VirtualDisk, SECTOR_SIZE};

const TABLE_MAGIC: u32 = 0x6D69_7368; // "mish"
const TABLE_VERSION: u32 = 1;
// magic, version, first_sector, sector_count, data_offset, buffers_needed,
// block_descriptors, 24 reserved bytes, 136-byte integrity descriptor
// (reporting only, not used for addressing), entry count.
const TABLE_HEADER_SIZE: usize = 204;
const ENTRY_SIZE: usize = 40;

const ENTRY_ZERO: u32 = 0x0000_0000;
const ENTRY_COPY: u32 = 0x0000_0001;
const ENTRY_UNALLOCATED: u32 = 0x0000_0002;
const ENTRY_COMMENT: u32 = 0x7FFF_FFFE;
const ENTRY_END: u32 = 0xFFFF_FFFF;
const ENTRY_COMPRESSED_MIN: u32 = 0x8000_0001;
const ENTRY_COMPRESSED_MAX: u32 = 0x8000_0007;

// Hard caps to avoid absurd allocations from untrusted tables.
const MAX_TABLE_ENTRIES: u32 = 4 * 1024 * 1024;
const MAX_CHUNK_BYTES: u64 = 64 * 1024 * 1024;

/// How one run of sectors is materialized.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkKind {
    /// Written-as-zero run. Reads the same as `Unallocated`, but stays a
    /// distinct variant because producers treat the two differently.
    Zero,
    /// Verbatim bytes in the data area.
    Copy,
    /// Never-written run; reads as zero.
    Unallocated,
    /// Compressed payload decoded through a [`Decompressor`].
    Compressed(CodecId),
}

/// One allocation-table entry covering `sector_count` logical blocks starting
/// at `start_sector` (relative to the table).
#[derive(Clone, Copy, Debug)]
pub struct ChunkEntry {
    pub kind: ChunkKind,
    pub start_sector: u64,
    pub sector_count: u64,
    /// Payload position relative to the table's data base.
    pub data_offset: u64,
    /// Encoded payload length in bytes.
    pub data_length: u64,
}

impl ChunkEntry {
    /// Size of the decoded run in bytes.
    pub fn decoded_len(&self) -> u64 {
        self.sector_count * SECTOR_SIZE as u64
    }
}

/// Fully decoded allocation table: data-bearing entries sorted by
/// `start_sector`, partitioning `[0, total_sectors)` with no gaps or
/// overlaps. Built once at open time; immutable afterwards.
#[derive(Debug)]
pub struct ChunkTable {
    entries: Vec<ChunkEntry>,
    first_sector: u64,
    total_sectors: u64,
    data_base: u64,
    largest_chunk_bytes: usize,
}

impl ChunkTable {
    /// Parse a raw table.
    ///
    /// Rejects unknown entry types outright instead of letting them fall
    /// through as some near-miss variant, and rejects tables that do not
    /// partition their address space (the resolver's predecessor search
    /// depends on that invariant).
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() < TABLE_HEADER_SIZE {
            return Err(DiskError::CorruptImage("chunk table truncated"));
        }
        if be_u32(&raw[0..4]) != TABLE_MAGIC {
            return Err(DiskError::CorruptImage("chunk table magic mismatch"));
        }
        if be_u32(&raw[4..8]) != TABLE_VERSION {
            return Err(DiskError::Unsupported("chunk table version"));
        }

        let first_sector = be_u64(&raw[8..16]);
        let total_sectors = be_u64(&raw[16..24]);
        let data_base = be_u64(&raw[24..32]);
        let entry_count = be_u32(&raw[200..204]);

        if entry_count > MAX_TABLE_ENTRIES {
            return Err(DiskError::Unsupported("chunk table too large"));
        }
        let entries_len = (entry_count as usize)
            .checked_mul(ENTRY_SIZE)
            .ok_or(DiskError::OffsetOverflow)?;
        if raw.len() < TABLE_HEADER_SIZE + entries_len {
            return Err(DiskError::CorruptImage("chunk table truncated"));
        }

        let mut entries = Vec::new();
        let mut cursor = 0u64;
        let mut largest_chunk_bytes = 0u64;
        let mut saw_end = false;

        for i in 0..entry_count as usize {
            let at = TABLE_HEADER_SIZE + i * ENTRY_SIZE;
            let raw_type = be_u32(&raw[at..at + 4]);
            let start_sector = be_u64(&raw[at + 8..at + 16]);
            let sector_count = be_u64(&raw[at + 16..at + 24]);
            let data_offset = be_u64(&raw[at + 24..at + 32]);
            let data_length = be_u64(&raw[at + 32..at + 40]);

            let kind = match raw_type {
                ENTRY_COMMENT => continue,
                ENTRY_END => {
                    if i + 1 != entry_count as usize {
                        return Err(DiskError::CorruptImage("chunk entries after terminator"));
                    }
                    saw_end = true;
                    break;
                }
                ENTRY_ZERO => ChunkKind::Zero,
                ENTRY_COPY => ChunkKind::Copy,
                ENTRY_UNALLOCATED => ChunkKind::Unallocated,
                ENTRY_COMPRESSED_MIN..=ENTRY_COMPRESSED_MAX => {
                    let codec = CodecId::from_raw((raw_type & 0xFF) as u8)
                        .ok_or(DiskError::CorruptImage("chunk codec id out of range"))?;
                    ChunkKind::Compressed(codec)
                }
                _ => return Err(DiskError::CorruptImage("unknown chunk entry type")),
            };

            if sector_count == 0 {
                return Err(DiskError::CorruptImage("empty chunk entry"));
            }
            if start_sector != cursor {
                return Err(DiskError::CorruptImage("chunk table not contiguous"));
            }
            cursor = cursor
                .checked_add(sector_count)
                .ok_or(DiskError::OffsetOverflow)?;

            let decoded = sector_count
                .checked_mul(SECTOR_SIZE as u64)
                .ok_or(DiskError::OffsetOverflow)?;
            if decoded > MAX_CHUNK_BYTES {
                return Err(DiskError::Unsupported("chunk too large"));
            }
            largest_chunk_bytes = largest_chunk_bytes.max(decoded);

            if kind == ChunkKind::Copy && data_length != decoded {
                return Err(DiskError::CorruptImage("copy chunk length mismatch"));
            }

            entries.push(ChunkEntry {
                kind,
                start_sector,
                sector_count,
                data_offset,
                data_length,
            });
        }

        if !saw_end {
            return Err(DiskError::CorruptImage("chunk table missing terminator"));
        }
        if cursor != total_sectors {
            return Err(DiskError::CorruptImage(
                "chunk table does not cover the address space",
            ));
        }

        Ok(Self {
            entries,
            first_sector,
            total_sectors,
            data_base,
            largest_chunk_bytes: largest_chunk_bytes as usize,
        })
    }

    /// Locate the entry covering `sector`: predecessor search over the sorted
    /// entries, then a range check against the winner's window.
    pub fn resolve(&self, sector: u64) -> Result<(&ChunkEntry, u64)> {
        if sector >= self.total_sectors {
            return Err(DiskError::OutOfBounds {
                offset: sector.saturating_mul(SECTOR_SIZE as u64),
                len: SECTOR_SIZE,
                capacity: self.total_sectors * SECTOR_SIZE as u64,
            });
        }
        let after = self
            .entries
            .partition_point(|e| e.start_sector <= sector);
        // The table partitions [0, total_sectors), so an in-range sector always
        // has a predecessor.
        let entry = &self.entries[after - 1];
        debug_assert!(sector - entry.start_sector < entry.sector_count);
        Ok((entry, sector - entry.start_sector))
    }

    pub fn entries(&self) -> &[ChunkEntry] {
        &self.entries
    }

    /// Position of this table's span within the containing disk, in sectors.
    pub fn first_sector(&self) -> u64 {
        self.first_sector
    }

    pub fn total_sectors(&self) -> u64 {
        self.total_sectors
    }

    /// Byte offset all entry payload offsets are relative to.
    pub fn data_base(&self) -> u64 {
        self.data_base
    }

    /// Size of the biggest decoded chunk; callers decoding into a reused
    /// buffer size it with this.
    pub fn largest_chunk_bytes(&self) -> usize {
        self.largest_chunk_bytes
    }
}

/// Decoded view over a chunked image.
pub struct ChunkedDisk<B> {
    backend: B,
    table: ChunkTable,
    decompressor: Box<dyn Decompressor>,
    chunk_cache: ChunkCache,
    block_cache: BlockCache,
}

impl<B> std::fmt::Debug for ChunkedDisk<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkedDisk").finish_non_exhaustive()
    }
}

impl<B: ExtentReader> ChunkedDisk<B> {
    /// Open with the default cache budget.
    pub fn open(backend: B, table_bytes: &[u8], decompressor: Box<dyn Decompressor>) -> Result<Self> {
        Self::open_with_cache(backend, table_bytes, decompressor, DEFAULT_CHUNK_CACHE_BYTES)
    }

    /// Open with an explicit chunk-cache byte budget; the block cache gets the
    /// same byte budget, counted in blocks.
    pub fn open_with_cache(
        mut backend: B,
        table_bytes: &[u8],
        decompressor: Box<dyn Decompressor>,
        cache_bytes: u64,
    ) -> Result<Self> {
        let table = ChunkTable::parse(table_bytes)?;

        // Every payload must live inside the backing extent; catching a bogus
        // offset here keeps per-read errors down to genuine I/O failures.
        let extent_len = backend.len()?;
        for entry in table.entries() {
            if matches!(entry.kind, ChunkKind::Copy | ChunkKind::Compressed(_)) {
                let start = table
                    .data_base()
                    .checked_add(entry.data_offset)
                    .ok_or(DiskError::OffsetOverflow)?;
                let end = start
                    .checked_add(entry.data_length)
                    .ok_or(DiskError::OffsetOverflow)?;
                if end > extent_len {
                    return Err(DiskError::CorruptImage("chunk payload past end of extent"));
                }
            }
        }

        Ok(Self {
            backend,
            table,
            decompressor,
            chunk_cache: ChunkCache::new(cache_bytes),
            block_cache: BlockCache::with_byte_budget(cache_bytes),
        })
    }

    pub fn table(&self) -> &ChunkTable {
        &self.table
    }

    pub fn into_backend(self) -> B {
        self.backend
    }

    pub fn chunk_cache_stats(&self) -> CacheStats {
        self.chunk_cache.stats()
    }

    pub fn block_cache_stats(&self) -> CacheStats {
        self.block_cache.stats()
    }

    /// Decode one entry to its block-aligned buffer. The only place payload
    /// bytes are interpreted.
    fn materialize(&mut self, entry: ChunkEntry) -> Result<Arc<Vec<u8>>> {
        let decoded_len = entry.decoded_len() as usize;

        let key = ChunkKey {
            extent: 0,
            start_sector: entry.start_sector,
        };

        match entry.kind {
            // Zero runs cost no I/O; synthesizing them is cheaper than letting
            // them push decoded data out of the cache.
            ChunkKind::Zero | ChunkKind::Unallocated => Ok(Arc::new(vec![0u8; decoded_len])),
            ChunkKind::Copy => {
                if let Some(buf) = self.chunk_cache.get(&key) {
                    return Ok(buf);
                }
                let at = self
                    .table
                    .data_base()
                    .checked_add(entry.data_offset)
                    .ok_or(DiskError::OffsetOverflow)?;
                let mut buf = vec![0u8; decoded_len];
                self.backend.read_at(at, &mut buf)?;
                let buf = Arc::new(buf);
                self.chunk_cache.insert(key, buf.clone());
                Ok(buf)
            }
            ChunkKind::Compressed(codec) => {
                if let Some(buf) = self.chunk_cache.get(&key) {
                    return Ok(buf);
                }
                let at = self
                    .table
                    .data_base()
                    .checked_add(entry.data_offset)
                    .ok_or(DiskError::OffsetOverflow)?;
                let encoded_len: usize = entry
                    .data_length
                    .try_into()
                    .map_err(|_| DiskError::Unsupported("chunk payload too large"))?;
                let mut encoded = vec![0u8; encoded_len];
                self.backend.read_at(at, &mut encoded)?;

                let mut decoded = self.decompressor.decode(codec, &encoded, decoded_len)?;
                if decoded.len() > decoded_len {
                    return Err(DiskError::CorruptImage("decoder produced too many bytes"));
                }
                if decoded.len() < decoded_len {
                    // Short output is an end-of-stream condition; anywhere else
                    // it means the payload was cut off.
                    let ends_at = entry
                        .start_sector
                        .checked_add(entry.sector_count)
                        .ok_or(DiskError::OffsetOverflow)?;
                    if ends_at != self.table.total_sectors() {
                        return Err(DiskError::CorruptImage("short decode before end of stream"));
                    }
                    decoded.resize(decoded_len, 0);
                }

                let decoded = Arc::new(decoded);
                self.chunk_cache.insert(key, decoded.clone());
                Ok(decoded)
            }
        }
    }

    fn read_one_sector(&mut self, sector: u64, out: &mut [u8; SECTOR_SIZE]) -> Result<()> {
        if self.block_cache.get(sector, out) {
            return Ok(());
        }
        let (entry, within) = {
            let (entry, within) = self.table.resolve(sector)?;
            (*entry, within)
        };
        let chunk = self.materialize(entry)?;
        let start = within as usize * SECTOR_SIZE;
        out.copy_from_slice(&chunk[start..start + SECTOR_SIZE]);
        self.block_cache.insert(sector, out);
        Ok(())
    }
}

impl<B: ExtentReader> VirtualDisk for ChunkedDisk<B> {
    fn capacity_bytes(&self) -> u64 {
        self.table.total_sectors() * SECTOR_SIZE as u64
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        checked_range(offset, buf.len(), self.capacity_bytes())?;

        let mut pos = 0usize;
        let mut sector_buf = [0u8; SECTOR_SIZE];
        while pos < buf.len() {
            let abs = offset + pos as u64;
            let sector = abs / SECTOR_SIZE as u64;
            let within = (abs % SECTOR_SIZE as u64) as usize;
            let chunk_len = (SECTOR_SIZE - within).min(buf.len() - pos);

            self.read_one_sector(sector, &mut sector_buf)?;
            buf[pos..pos + chunk_len].copy_from_slice(&sector_buf[within..within + chunk_len]);

            pos += chunk_len;
        }

        Ok(())
    }
}

fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn be_u64(bytes: &[u8]) -> u64 {
    u64::from_be_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ])
}
