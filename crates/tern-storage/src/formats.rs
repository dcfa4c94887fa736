//! On-disk format detection and a format-erased image type.
//!
//! Chunked images are not auto-detectable here: their allocation table is
//! located by container metadata this crate does not parse, so they are
//! opened explicitly via [`crate::ChunkedDisk::open`].

use crate::{DiskError, ExtentReader, RawDisk, Result, VhdDisk, VirtualDisk, VmdkDisk};

const VMDK_SPARSE_MAGIC: [u8; 4] = *b"KDMV";
const VHD_COOKIE: [u8; 8] = *b"conectix";
const VHD_FOOTER_SIZE: usize = 512;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DiskFormat {
    Raw,
    Vhd,
    Vmdk,
}

/// Detect the on-disk image format from magic values.
///
/// Detection is conservative: unknown images fall back to [`DiskFormat::Raw`].
pub fn detect_format<B: ExtentReader>(backend: &mut B) -> Result<DiskFormat> {
    let len = backend.len()?;

    if len >= 4 {
        let mut magic = [0u8; 4];
        backend.read_at(0, &mut magic)?;
        if magic == VMDK_SPARSE_MAGIC {
            return Ok(DiskFormat::Vmdk);
        }
    }

    // VHD fixed disks carry only a footer at the end; sparse variants keep a
    // copy in the first sector as well. Check both.
    if len >= VHD_FOOTER_SIZE as u64 {
        let mut footer = [0u8; VHD_FOOTER_SIZE];

        backend.read_at(len - VHD_FOOTER_SIZE as u64, &mut footer)?;
        if looks_like_vhd_footer(&footer, len) {
            return Ok(DiskFormat::Vhd);
        }

        backend.read_at(0, &mut footer)?;
        if looks_like_vhd_footer(&footer, len) {
            return Ok(DiskFormat::Vhd);
        }
    }

    Ok(DiskFormat::Raw)
}

fn looks_like_vhd_footer(footer: &[u8; VHD_FOOTER_SIZE], file_len: u64) -> bool {
    if footer[..8] != VHD_COOKIE {
        return false;
    }

    // The footer is big-endian and has a fixed file format version.
    if be_u32(&footer[12..16]) != 0x0001_0000 {
        return false;
    }

    let current_size = be_u64(&footer[48..56]);
    if current_size == 0 || current_size % (VHD_FOOTER_SIZE as u64) != 0 {
        return false;
    }

    // Fixed: data_offset is all-ones. Sparse (dynamic/differencing):
    // data_offset points at the sparse header and must be sector-aligned.
    let disk_type = be_u32(&footer[60..64]);
    let data_offset = be_u64(&footer[16..24]);
    match disk_type {
        2 => {
            if data_offset != u64::MAX {
                return false;
            }

            // A fixed disk is the data region followed by one footer sector.
            let Some(required_len) = current_size.checked_add(VHD_FOOTER_SIZE as u64) else {
                return false;
            };
            if file_len < required_len {
                return false;
            }
        }
        3 | 4 => {
            if data_offset == u64::MAX {
                return false;
            }
            if data_offset % (VHD_FOOTER_SIZE as u64) != 0 {
                return false;
            }
            // The footer copy occupies the first sector of the file.
            if data_offset < VHD_FOOTER_SIZE as u64 {
                return false;
            }
            // The sparse header is 1024 bytes.
            let Some(end) = data_offset.checked_add(1024) else {
                return false;
            };
            if end > file_len {
                return false;
            }
        }
        _ => return false,
    }

    true
}

fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn be_u64(bytes: &[u8]) -> u64 {
    u64::from_be_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ])
}

/// A convenience wrapper that can open multiple disk image formats from a
/// single backend.
///
/// Differencing images cannot be opened this way: the caller must resolve and
/// open the parent, then use [`VhdDisk::open_with_parent`] or
/// [`VmdkDisk::open_with_parent`] directly. `open_auto` surfaces the
/// [`DiskError::BrokenChain`] those images produce without a parent.
pub enum DiskImage<B> {
    Raw(RawDisk<B>),
    Vhd(Box<VhdDisk<B>>),
    Vmdk(VmdkDisk<B>),
}

impl<B> std::fmt::Debug for DiskImage<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Raw(_) => "Raw",
            Self::Vhd(_) => "Vhd",
            Self::Vmdk(_) => "Vmdk",
        };
        f.debug_tuple(name).finish()
    }
}

impl<B: ExtentReader> DiskImage<B> {
    pub fn format(&self) -> DiskFormat {
        match self {
            Self::Raw(_) => DiskFormat::Raw,
            Self::Vhd(_) => DiskFormat::Vhd,
            Self::Vmdk(_) => DiskFormat::Vmdk,
        }
    }

    pub fn open_with_format(format: DiskFormat, backend: B) -> Result<Self> {
        match format {
            DiskFormat::Raw => Ok(Self::Raw(RawDisk::open(backend)?)),
            DiskFormat::Vhd => Ok(Self::Vhd(Box::new(VhdDisk::open(backend)?))),
            DiskFormat::Vmdk => Ok(Self::Vmdk(VmdkDisk::open(backend)?)),
        }
    }

    pub fn open_auto(mut backend: B) -> Result<Self> {
        let format = detect_format(&mut backend)?;
        Self::open_with_format(format, backend)
    }

    pub fn into_backend(self) -> B {
        match self {
            Self::Raw(d) => d.into_backend(),
            Self::Vhd(d) => d.into_backend(),
            Self::Vmdk(d) => d.into_backend(),
        }
    }
}

impl<B: ExtentReader> VirtualDisk for DiskImage<B> {
    fn capacity_bytes(&self) -> u64 {
        match self {
            Self::Raw(d) => d.capacity_bytes(),
            Self::Vhd(d) => d.capacity_bytes(),
            Self::Vmdk(d) => d.capacity_bytes(),
        }
    }

    fn parent_chain_len(&self) -> u32 {
        match self {
            Self::Raw(d) => d.parent_chain_len(),
            Self::Vhd(d) => d.parent_chain_len(),
            Self::Vmdk(d) => d.parent_chain_len(),
        }
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        match self {
            Self::Raw(d) => d.read_at(offset, buf),
            Self::Vhd(d) => d.read_at(offset, buf),
            Self::Vmdk(d) => d.read_at(offset, buf),
        }
    }
}
