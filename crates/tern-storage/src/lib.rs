//! Disk image decoders: resolve logical block addresses to physical bytes
//! through per-format indirection tables, with bounded caching of decoded
//! chunks.
//!
//! Every decoder presents the same *read-only, sector-oriented* interface;
//! what differs is the indirection structure between a logical block address
//! and the bytes backing it:
//!
//! - [`RawDisk`]: no indirection — the backing extent is the address space
//! - [`VhdDisk`]: fixed/dynamic/differencing images addressed through a Block
//!   Allocation Table plus per-block dirty bitmaps (big-endian)
//! - [`VmdkDisk`]: sparse VM images addressed through a two-level grain
//!   directory / grain table structure (little-endian), optionally layered
//!   over a parent image
//! - [`ChunkedDisk`]: images addressed through a flat, sorted run-length
//!   table whose chunks may be zero-filled, verbatim, or compressed through a
//!   pluggable [`Decompressor`]
//!
//! Differencing/copy-on-write images defer unwritten blocks to a
//! caller-supplied parent; parent resolution (sibling paths, locators) is the
//! caller's business. Directories are decoded eagerly at open time and are
//! immutable afterwards; decoded chunks and returned blocks go through the
//! bounded caches in [`cache`].

mod backend;
mod cache;
mod chunked;
mod codec;
mod disk;
mod error;
mod formats;
mod util;
mod vhd;
mod vmdk;

pub use backend::{ExtentReader, FileBackend, MemBackend};
pub use cache::{BlockCache, CacheStats, ChunkCache, ChunkKey, DEFAULT_CHUNK_CACHE_BYTES};
pub use chunked::{ChunkEntry, ChunkKind, ChunkTable, ChunkedDisk};
pub use codec::{CodecId, Decompressor, NoCodecs};
pub use disk::{RawDisk, VirtualDisk, MAX_PARENT_CHAIN, SECTOR_SIZE};
pub use error::{DiskError, Result};
pub use formats::{detect_format, DiskFormat, DiskImage};
pub use vhd::VhdDisk;
pub use vmdk::VmdkDisk;

#[cfg(test)]
mod proptests;
