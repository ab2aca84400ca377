//! Write-ahead journal record framing.
//!
//! The journal is a stream of fixed 32 KiB blocks. Each block holds zero or
//! more physical records; a logical record too large for the space left in
//! the current block is fragmented across blocks.
//!
//! # Block format
//!
//! ```text
//! +---------+---------+-----+---------+----------+
//! | record  | record  | ... | record  | zero pad |
//! +---------+---------+-----+---------+----------+
//! |<----------------- 32768 bytes --------------->|
//! ```
//!
//! When fewer than 7 bytes remain in a block the tail is zero-filled and
//! writing resumes at the next block boundary.
//!
//! # Record format
//!
//! ```text
//! +----------------+------------+--------+---------+
//! | checksum       | length     | type   | payload |
//! +----------------+------------+--------+---------+
//! | u32 LE, masked | u16 LE     | u8     | var len |
//! +----------------+------------+--------+---------+
//! ```
//!
//! The checksum is a masked CRC32C over the type byte and the payload. The
//! type is FULL for an unfragmented record, or FIRST/MIDDLE/LAST for the
//! fragments of one logical record in order. Type zero is reserved so that
//! a zero-filled tail never parses as a record.

pub mod reader;
pub mod writer;

pub use reader::Reader;
pub use writer::Writer;

/// Journal block size.
pub const BLOCK_SIZE: usize = 32 * 1024;

/// Checksum (4 bytes), length (2 bytes), type (1 byte).
pub const HEADER_SIZE: usize = 7;

/// Reserved for the zero-filled block tail.
pub(crate) const TYPE_ZERO: u8 = 0;
pub(crate) const TYPE_FULL: u8 = 1;
pub(crate) const TYPE_FIRST: u8 = 2;
pub(crate) const TYPE_MIDDLE: u8 = 3;
pub(crate) const TYPE_LAST: u8 = 4;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn roundtrip(records: &[Vec<u8>]) -> Vec<Vec<u8>> {
        let mut buf = Vec::new();
        let mut writer = Writer::new(&mut buf);
        for record in records {
            writer.append(record).expect("append");
        }
        writer.flush().expect("flush");

        Reader::new(Cursor::new(buf))
            .collect::<crate::Result<Vec<_>>>()
            .expect("read")
    }

    #[test]
    fn test_roundtrip_simple() {
        let records = vec![
            b"alpha".to_vec(),
            b"beta".to_vec(),
            Vec::new(),
            b"gamma".to_vec(),
        ];
        assert_eq!(roundtrip(&records), records);
    }

    #[test]
    fn test_roundtrip_spanning_blocks() {
        // Forces FULL, then FIRST+LAST straddling blocks 0..2, then FULL.
        let records = vec![
            vec![0xaa; 100],
            vec![0xbb; 32_761],
            vec![0xcc; 1],
        ];
        assert_eq!(roundtrip(&records), records);
    }

    #[test]
    fn test_roundtrip_many_sizes() {
        let records: Vec<Vec<u8>> = [0, 1, 6, 7, 8, 1000, BLOCK_SIZE - HEADER_SIZE,
            BLOCK_SIZE, 3 * BLOCK_SIZE + 17]
            .iter()
            .map(|&n| (0..n).map(|i| (i % 251) as u8).collect())
            .collect();
        assert_eq!(roundtrip(&records), records);
    }
}
