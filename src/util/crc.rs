//! Masked CRC32C.
//!
//! Every checksum persisted to disk (journal record headers, SST block
//! trailers) is a CRC32C run through a fixed rotate-and-add mask. The mask
//! keeps a stored checksum from looking like a valid checksum of bytes that
//! happen to contain checksums, which matters when CRC-protected data nests.

use crc::{Crc, CRC_32_ISCSI};

/// CRC32C (Castagnoli).
pub const CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const MASK_DELTA: u32 = 0xa282_ead8;

/// Applies the storage mask to a raw CRC32C.
pub fn mask(crc: u32) -> u32 {
    ((crc >> 15) | (crc << 17)).wrapping_add(MASK_DELTA)
}

/// Inverts [`mask`].
pub fn unmask(masked: u32) -> u32 {
    let rot = masked.wrapping_sub(MASK_DELTA);
    (rot >> 17) | (rot << 15)
}

/// Masked CRC32C over a single buffer.
pub fn masked_checksum(data: &[u8]) -> u32 {
    mask(CRC32C.checksum(data))
}

/// Masked CRC32C over two buffers as if concatenated. The journal checksums
/// `type_byte || payload`; the table checksums `block || compression_byte`
/// without copying either into one allocation.
pub fn masked_checksum2(a: &[u8], b: &[u8]) -> u32 {
    let mut digest = CRC32C.digest();
    digest.update(a);
    digest.update(b);
    mask(digest.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32c_known_value() {
        // Castagnoli check value for "123456789".
        assert_eq!(CRC32C.checksum(b"123456789"), 0xe306_9283);
    }

    #[test]
    fn test_mask_roundtrip() {
        for crc in [0u32, 1, 0xe306_9283, u32::MAX, 0xdead_beef] {
            assert_eq!(unmask(mask(crc)), crc);
            // The mask must actually change the value.
            assert_ne!(mask(crc), crc);
        }
    }

    #[test]
    fn test_split_checksum_matches_contiguous() {
        let whole = masked_checksum(b"\x01hello journal");
        let split = masked_checksum2(b"\x01", b"hello journal");
        assert_eq!(whole, split);
    }
}
