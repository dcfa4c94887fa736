//! Pluggable decompression for compressed chunk payloads.

use crate::{DiskError, Result};

/// Identifies the compressor for a compressed chunk.
///
/// The value is the low byte of the on-disk entry type (`0x8000_0001` through
/// `0x8000_0007`). [`CodecId::from_raw`] rejects everything outside that
/// range, so an unknown id can never masquerade as a valid codec.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CodecId(u8);

impl CodecId {
    pub const ADC: CodecId = CodecId(4);
    pub const ZLIB: CodecId = CodecId(5);
    pub const BZIP2: CodecId = CodecId(6);
    pub const LZFSE: CodecId = CodecId(7);

    pub fn from_raw(raw: u8) -> Option<CodecId> {
        (1..=7).contains(&raw).then_some(CodecId(raw))
    }

    pub fn raw(self) -> u8 {
        self.0
    }
}

/// Decodes compressed chunk payloads.
///
/// The numeric codecs live outside this crate. A chunk whose codec the
/// supplied decompressor does not understand fails that read with
/// [`DiskError::Unsupported`]; the image handle stays usable.
pub trait Decompressor {
    /// Decode `input` into at most `max_len` bytes.
    ///
    /// Producing fewer than `max_len` bytes is only valid at end-of-stream;
    /// the caller zero-pads the final chunk and rejects short output anywhere
    /// else.
    fn decode(&mut self, codec: CodecId, input: &[u8], max_len: usize) -> Result<Vec<u8>>;
}

/// Decompressor that understands no codecs at all.
///
/// The default for images known to contain only zero/copy chunks.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoCodecs;

impl Decompressor for NoCodecs {
    fn decode(&mut self, _codec: CodecId, _input: &[u8], _max_len: usize) -> Result<Vec<u8>> {
        Err(DiskError::Unsupported("compression codec"))
    }
}
