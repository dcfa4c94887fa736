use thiserror::Error;

pub type Result<T> = std::result::Result<T, DiskError>;

/// Unified error type for disk image decoding.
///
/// Errors raised while a handle is being opened (`CorruptImage`, `BrokenChain`,
/// absurd-metadata `Unsupported`) mean no handle is returned at all; there is no
/// partially-usable open state. Errors raised by an individual read
/// (`OutOfBounds`, a per-read `Unsupported` codec, `Io`) affect only that call —
/// the handle remains usable afterwards.
#[derive(Debug, Error)]
pub enum DiskError {
    #[error("unaligned buffer length {len} (expected multiple of {alignment})")]
    UnalignedLength { len: usize, alignment: usize },

    #[error("out of bounds: offset={offset} len={len} capacity={capacity}")]
    OutOfBounds {
        offset: u64,
        len: usize,
        capacity: u64,
    },

    #[error("integer overflow while computing byte offsets")]
    OffsetOverflow,

    #[error("corrupt disk image: {0}")]
    CorruptImage(&'static str),

    #[error("unsupported disk image feature: {0}")]
    Unsupported(&'static str),

    /// A differencing image's parent is missing, has the wrong size, or the
    /// chain is too deep to be anything but a cycle.
    #[error("broken parent chain: {0}")]
    BrokenChain(&'static str),

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("backend not supported: {0}")]
    NotSupported(String),

    /// Generic I/O failure propagated from an extent reader, not interpreted.
    #[error("io error: {0}")]
    Io(String),
}
