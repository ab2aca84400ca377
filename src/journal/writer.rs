use byteorder::{LittleEndian, WriteBytesExt};

use crate::error::Result;
use crate::util::crc;

use super::{BLOCK_SIZE, HEADER_SIZE, TYPE_FIRST, TYPE_FULL, TYPE_LAST, TYPE_MIDDLE};

/// Journal writer framing records into 32 KiB blocks.
pub struct Writer<W: std::io::Write> {
    w: W,
    /// Write offset within the current block.
    block_offset: usize,
}

impl<W: std::io::Write> Writer<W> {
    pub fn new(w: W) -> Self {
        Self { w, block_offset: 0 }
    }

    /// Appends one logical record, fragmenting it so every physical record
    /// fits in the space left in its block. A zero-length record still emits
    /// one FULL record with an empty payload.
    pub fn append(&mut self, record: &[u8]) -> Result<()> {
        let mut rest = record;
        let mut begin = true;
        loop {
            let leftover = BLOCK_SIZE - self.block_offset;
            if leftover < HEADER_SIZE {
                // Not even a header fits; pad and move to the next block.
                if leftover > 0 {
                    self.w.write_all(&[0u8; HEADER_SIZE - 1][..leftover])?;
                }
                self.block_offset = 0;
            }

            let avail = BLOCK_SIZE - self.block_offset - HEADER_SIZE;
            let frag_len = rest.len().min(avail);
            let end = frag_len == rest.len();

            let rtype = match (begin, end) {
                (true, true) => TYPE_FULL,
                (true, false) => TYPE_FIRST,
                (false, true) => TYPE_LAST,
                (false, false) => TYPE_MIDDLE,
            };

            self.write_physical(rtype, &rest[..frag_len])?;
            self.block_offset += HEADER_SIZE + frag_len;

            rest = &rest[frag_len..];
            begin = false;
            if rest.is_empty() && end {
                return Ok(());
            }
        }
    }

    pub fn flush(&mut self) -> Result<()> {
        self.w.flush()?;
        Ok(())
    }

    /// Offset within the current 32 KiB block, for size accounting.
    pub fn block_offset(&self) -> usize {
        self.block_offset
    }

    pub fn into_inner(self) -> W {
        self.w
    }

    fn write_physical(&mut self, rtype: u8, payload: &[u8]) -> Result<()> {
        let checksum = crc::masked_checksum2(&[rtype], payload);
        self.w.write_u32::<LittleEndian>(checksum)?;
        self.w.write_u16::<LittleEndian>(payload.len() as u16)?;
        self.w.write_u8(rtype)?;
        self.w.write_all(payload)?;
        Ok(())
    }
}
