//! Sorted-string table format.
//!
//! An SST file is a sequence of blocks followed by a fixed-size footer:
//!
//! ```text
//! +-------------------+
//! | Data Block 1      |
//! +-------------------+
//! | ...               |
//! +-------------------+
//! | Data Block N      |
//! +-------------------+
//! | Filter Block      |  (optional)
//! +-------------------+
//! | Metaindex Block   |
//! +-------------------+
//! | Index Block       |
//! +-------------------+
//! | Footer (48 bytes) |
//! +-------------------+
//! ```
//!
//! Every block is followed by a 5-byte trailer: one compression-type byte
//! and a masked CRC32C (little-endian) over the block contents and the
//! compression byte. Block handle lengths exclude the trailer.
//!
//! The footer carries the metaindex and index block handles as varints,
//! zero-padded to 40 bytes, then the 8-byte magic number little-endian.

pub mod block;
pub mod iterator;
pub mod reader;
pub mod writer;

pub use iterator::TableIter;
pub use reader::Reader;
pub use writer::Writer;

use integer_encoding::VarInt;

/// One compression-type byte plus a 4-byte masked CRC32C.
pub const BLOCK_TRAILER_LEN: usize = 5;

/// Two zero-padded block handles plus the magic number.
pub const FOOTER_LEN: usize = 48;

pub const MAGIC: u64 = 0xdb4775248b80fb57;

/// Compression-type byte values.
pub const COMPRESSION_NONE: u8 = 0;
pub const COMPRESSION_SNAPPY: u8 = 1;

/// Locates a block within a file. The length excludes the trailer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlockHandle {
    pub offset: u64,
    pub length: u64,
}

impl BlockHandle {
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    /// Appends the varint encoding onto `dst`.
    pub fn encode_to(&self, dst: &mut Vec<u8>) {
        let mut scratch = [0u8; 10];
        let n = self.offset.encode_var(&mut scratch);
        dst.extend_from_slice(&scratch[..n]);
        let n = self.length.encode_var(&mut scratch);
        dst.extend_from_slice(&scratch[..n]);
    }

    /// Decodes a handle from the front of `src`, returning it and the number
    /// of bytes consumed. Returns `None` on malformed varints.
    pub fn decode(src: &[u8]) -> Option<(BlockHandle, usize)> {
        let (offset, n0) = u64::decode_var(src)?;
        let (length, n1) = u64::decode_var(&src[n0..])?;
        Some((BlockHandle { offset, length }, n0 + n1))
    }
}
