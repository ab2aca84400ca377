//! Table writer.
//!
//! Builds the exact on-disk format the reader consumes: data blocks with
//! prefix-compressed entries and restart points, an optional filter block,
//! the metaindex naming that filter, an index block of separator keys, and
//! the footer. Keys must be appended in strictly increasing order under the
//! configured comparer.

use std::sync::Arc;

use byteorder::{LittleEndian, WriteBytesExt};
use integer_encoding::VarInt;

use crate::comparer::Comparer;
use crate::error::{Error, Result};
use crate::filter::{FilterGenerator, FilterPolicy};
use crate::options::{Compression, Options};
use crate::util::crc;

use super::{
    BlockHandle, BLOCK_TRAILER_LEN, COMPRESSION_NONE, COMPRESSION_SNAPPY, FOOTER_LEN, MAGIC,
};

/// Accumulates prefix-compressed entries for one block.
pub(crate) struct BlockBuilder {
    buf: Vec<u8>,
    restarts: Vec<u32>,
    restart_interval: usize,
    counter: usize,
    prev_key: Vec<u8>,
    scratch: [u8; 10],
}

impl BlockBuilder {
    pub(crate) fn new(restart_interval: usize) -> Self {
        Self {
            buf: Vec::new(),
            restarts: Vec::new(),
            restart_interval: restart_interval.max(1),
            counter: 0,
            prev_key: Vec::new(),
            scratch: [0; 10],
        }
    }

    pub(crate) fn append(&mut self, key: &[u8], value: &[u8]) {
        let shared = if self.counter % self.restart_interval == 0 {
            self.restarts.push(self.buf.len() as u32);
            0
        } else {
            self.prev_key
                .iter()
                .zip(key.iter())
                .take_while(|(a, b)| a == b)
                .count()
        };

        let n = (shared as u64).encode_var(&mut self.scratch);
        self.buf.extend_from_slice(&self.scratch[..n]);
        let n = ((key.len() - shared) as u64).encode_var(&mut self.scratch);
        self.buf.extend_from_slice(&self.scratch[..n]);
        let n = (value.len() as u64).encode_var(&mut self.scratch);
        self.buf.extend_from_slice(&self.scratch[..n]);
        self.buf.extend_from_slice(&key[shared..]);
        self.buf.extend_from_slice(value);

        self.prev_key.clear();
        self.prev_key.extend_from_slice(key);
        self.counter += 1;
    }

    /// Entry bytes plus the restart array the block would carry now.
    pub(crate) fn bytes_len(&self) -> usize {
        self.buf.len() + (self.restarts.len().max(1) + 1) * 4
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.counter == 0
    }

    /// Appends the restart array and returns the finished block contents.
    pub(crate) fn finish(&mut self) -> &[u8] {
        // An empty block still carries one restart point at offset zero.
        if self.restarts.is_empty() {
            self.restarts.push(0);
        }
        for &restart in &self.restarts {
            self.buf.write_u32::<LittleEndian>(restart).expect("vec write");
        }
        self.buf
            .write_u32::<LittleEndian>(self.restarts.len() as u32)
            .expect("vec write");
        &self.buf
    }

    pub(crate) fn reset(&mut self) {
        self.buf.clear();
        self.restarts.clear();
        self.counter = 0;
        self.prev_key.clear();
    }
}

/// Builds the filter block: one filter per `1 << base_lg` bytes of data
/// region, the filters concatenated and located by a trailing offsets array.
struct FilterWriter {
    generator: Box<dyn FilterGenerator>,
    data: Vec<u8>,
    offsets: Vec<u32>,
    n_keys: usize,
    base_lg: u8,
}

impl FilterWriter {
    fn add(&mut self, key: &[u8]) {
        self.generator.add(key);
        self.n_keys += 1;
    }

    /// Called when a data block starts at `offset`; emits filters until the
    /// filter index catches up with the block's span.
    fn flush(&mut self, offset: u64) {
        let target = (offset >> self.base_lg) as usize;
        while self.offsets.len() < target {
            self.generate();
        }
    }

    fn generate(&mut self) {
        self.offsets.push(self.data.len() as u32);
        if self.n_keys > 0 {
            self.generator.generate(&mut self.data);
            self.n_keys = 0;
        }
    }

    fn finish(&mut self) -> &[u8] {
        if self.n_keys > 0 {
            self.generate();
        }
        // Terminator offset, then the offsets array, the array's position,
        // and the base-Lg byte.
        self.offsets.push(self.data.len() as u32);
        let o_offset = self.data.len() as u32;
        for i in 0..self.offsets.len() {
            let offset = self.offsets[i];
            self.data.write_u32::<LittleEndian>(offset).expect("vec write");
        }
        self.data.write_u32::<LittleEndian>(o_offset).expect("vec write");
        self.data.push(self.base_lg);
        &self.data
    }
}

/// Table writer over any byte sink.
pub struct Writer<W: std::io::Write> {
    w: W,
    cmp: Arc<dyn Comparer>,
    filter_policy: Option<Arc<dyn FilterPolicy>>,
    filter: Option<FilterWriter>,
    compression: Compression,
    block_size: usize,

    data_block: BlockBuilder,
    index_block: BlockBuilder,
    /// Handle of the last finished data block, waiting for the next key to
    /// pick its index separator.
    pending_bh: Option<BlockHandle>,
    offset: u64,
    n_entries: usize,
    last_key: Vec<u8>,
    comp_buf: Vec<u8>,
    closed: bool,
}

impl<W: std::io::Write> Writer<W> {
    pub fn new(w: W, o: &Options) -> Self {
        let filter = o.filter.as_ref().map(|policy| FilterWriter {
            generator: policy.create_generator(),
            data: Vec::new(),
            offsets: Vec::new(),
            n_keys: 0,
            base_lg: o.filter_base_lg,
        });
        Self {
            w,
            cmp: o.comparer.clone(),
            filter_policy: o.filter.clone(),
            filter,
            compression: o.effective_compression(),
            block_size: o.block_size,
            data_block: BlockBuilder::new(o.block_restart_interval),
            // Index entries are large and few; restart every entry.
            index_block: BlockBuilder::new(1),
            pending_bh: None,
            offset: 0,
            n_entries: 0,
            last_key: Vec::new(),
            comp_buf: Vec::new(),
            closed: false,
        }
    }

    /// Appends one entry. Keys must arrive in strictly increasing order.
    pub fn append(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if self.closed {
            return Err(Error::InvalidInput("writer already finished".to_string()));
        }
        if self.n_entries > 0
            && self.cmp.compare(key, &self.last_key) != std::cmp::Ordering::Greater
        {
            return Err(Error::InvalidInput(
                "keys are not in increasing order".to_string(),
            ));
        }

        self.flush_pending_index(Some(key))?;
        self.data_block.append(key, value);
        if let Some(filter) = &mut self.filter {
            filter.add(key);
        }
        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.n_entries += 1;

        if self.data_block.bytes_len() >= self.block_size {
            self.finish_data_block()?;
        }
        Ok(())
    }

    /// Writes the filter, metaindex, index block and footer. The writer
    /// accepts no entries afterwards. Returns the final file size.
    pub fn finish(&mut self) -> Result<u64> {
        if self.closed {
            return Err(Error::InvalidInput("writer already finished".to_string()));
        }
        self.closed = true;

        if !self.data_block.is_empty() {
            self.finish_data_block()?;
        }
        self.flush_pending_index(None)?;

        // Filter block.
        let mut filter_bh = None;
        if let Some(mut filter) = self.filter.take() {
            let contents = filter.finish().to_vec();
            // The filter block is stored uncompressed.
            let bh = self.write_raw_block(&contents, COMPRESSION_NONE)?;
            filter_bh = Some(bh);
        }

        // Metaindex block.
        let mut meta_block = BlockBuilder::new(1);
        if let (Some(bh), Some(policy)) = (filter_bh, &self.filter_policy) {
            let key = format!("filter.{}", policy.name());
            let mut handle = Vec::new();
            bh.encode_to(&mut handle);
            meta_block.append(key.as_bytes(), &handle);
        }
        let meta_bh = self.write_block(meta_block.finish().to_vec())?;

        // Index block.
        let index_contents = self.index_block_contents();
        let index_bh = self.write_block(index_contents)?;

        // Footer.
        let mut footer = Vec::with_capacity(FOOTER_LEN);
        meta_bh.encode_to(&mut footer);
        index_bh.encode_to(&mut footer);
        footer.resize(FOOTER_LEN - 8, 0);
        footer.write_u64::<LittleEndian>(MAGIC).expect("vec write");
        self.w.write_all(&footer)?;
        self.offset += FOOTER_LEN as u64;

        self.w.flush()?;
        Ok(self.offset)
    }

    pub fn entries(&self) -> usize {
        self.n_entries
    }

    /// File bytes written so far.
    pub fn bytes_len(&self) -> u64 {
        self.offset
    }

    fn index_block_contents(&mut self) -> Vec<u8> {
        self.index_block.finish().to_vec()
    }

    /// Finishes the current data block and remembers its handle for the
    /// deferred index entry.
    fn finish_data_block(&mut self) -> Result<()> {
        let contents = self.data_block.finish().to_vec();
        self.data_block.reset();
        let bh = self.write_block(contents)?;
        self.pending_bh = Some(bh);
        if let Some(filter) = &mut self.filter {
            filter.flush(self.offset);
        }
        Ok(())
    }

    /// Emits the index entry for the last finished block. With the upcoming
    /// key at hand a short separator goes into the index; at end of table
    /// the last key's successor does.
    fn flush_pending_index(&mut self, upcoming: Option<&[u8]>) -> Result<()> {
        let Some(bh) = self.pending_bh.take() else {
            return Ok(());
        };
        let separator = match upcoming {
            Some(key) => self
                .cmp
                .separator(&self.last_key, key)
                .unwrap_or_else(|| self.last_key.clone()),
            None => self
                .cmp
                .successor(&self.last_key)
                .unwrap_or_else(|| self.last_key.clone()),
        };
        let mut handle = Vec::new();
        bh.encode_to(&mut handle);
        self.index_block.append(&separator, &handle);
        Ok(())
    }

    /// Compresses per options and writes block contents plus trailer.
    fn write_block(&mut self, contents: Vec<u8>) -> Result<BlockHandle> {
        match self.compression {
            Compression::Snappy => {
                self.comp_buf = snap::raw::Encoder::new()
                    .compress_vec(&contents)
                    .map_err(|e| Error::Io(e.to_string()))?;
                if self.comp_buf.len() < contents.len() {
                    let compressed = std::mem::take(&mut self.comp_buf);
                    let bh = self.write_raw_block(&compressed, COMPRESSION_SNAPPY)?;
                    self.comp_buf = compressed;
                    return Ok(bh);
                }
                self.write_raw_block(&contents, COMPRESSION_NONE)
            }
            Compression::None => self.write_raw_block(&contents, COMPRESSION_NONE),
        }
    }

    fn write_raw_block(&mut self, contents: &[u8], compression: u8) -> Result<BlockHandle> {
        self.w.write_all(contents)?;
        self.w.write_u8(compression)?;
        let checksum = crc::masked_checksum2(contents, &[compression]);
        self.w.write_u32::<LittleEndian>(checksum)?;
        let bh = BlockHandle::new(self.offset, contents.len() as u64);
        self.offset += contents.len() as u64 + BLOCK_TRAILER_LEN as u64;
        Ok(bh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::ByteOrder;

    fn options() -> Options {
        Options {
            compression: Compression::None,
            ..Options::default()
        }
    }

    #[test]
    fn test_rejects_out_of_order_keys() {
        let mut buf = Vec::new();
        let mut w = Writer::new(&mut buf, &options());
        w.append(b"b", b"1").expect("append");
        assert!(w.append(b"a", b"2").is_err());
        assert!(w.append(b"b", b"2").is_err());
        w.append(b"c", b"3").expect("append");
    }

    #[test]
    fn test_finish_writes_footer_magic() {
        let mut buf = Vec::new();
        let mut w = Writer::new(&mut buf, &options());
        w.append(b"key", b"value").expect("append");
        let size = w.finish().expect("finish");
        assert_eq!(size as usize, buf.len());
        assert!(buf.len() >= FOOTER_LEN);

        let magic = LittleEndian::read_u64(&buf[buf.len() - 8..]);
        assert_eq!(magic, MAGIC);
    }

    #[test]
    fn test_append_after_finish_fails() {
        let mut buf = Vec::new();
        let mut w = Writer::new(&mut buf, &options());
        w.append(b"key", b"value").expect("append");
        w.finish().expect("finish");
        assert!(w.append(b"later", b"x").is_err());
        assert!(w.finish().is_err());
    }

    #[test]
    fn test_block_trailer_checksum_covers_compression_byte() {
        let mut buf = Vec::new();
        let mut w = Writer::new(&mut buf, &options());
        w.append(b"key", b"value").expect("append");
        w.finish().expect("finish");

        // The first data block starts at offset 0; find its trailer by
        // parsing the index through the reader is overkill here, so rely on
        // the first block's contents ending where the restart count says.
        // Instead verify an independently framed block.
        let mut raw = Vec::new();
        let mut w2 = Writer::new(&mut raw, &options());
        let bh = w2.write_raw_block(b"block contents", COMPRESSION_NONE).expect("write");
        assert_eq!(bh, BlockHandle::new(0, 14));
        let stored = LittleEndian::read_u32(&raw[15..19]);
        assert_eq!(stored, crc::masked_checksum2(b"block contents", &[0]));
    }

    #[test]
    fn test_block_builder_prefix_compression() {
        let mut b = BlockBuilder::new(16);
        b.append(b"apple", b"1");
        b.append(b"applet", b"2");
        let data = b.finish();
        // Second entry shares the full 5-byte "apple" prefix: varints
        // (5, 1, 1), one unshared byte, one value byte.
        let second = &data[3 + 5 + 1..];
        assert_eq!(&second[..5], &[5, 1, 1, b't', b'2']);
    }

    #[test]
    fn test_empty_table_still_valid() {
        let mut buf = Vec::new();
        let mut w = Writer::new(&mut buf, &options());
        let size = w.finish().expect("finish");
        assert!(size >= FOOTER_LEN as u64);
    }
}
