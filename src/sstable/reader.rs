//! Table reader.
//!
//! Opening a table parses the footer, walks the metaindex for a filter
//! block matching a configured policy, and (without a block cache) retains
//! the index and filter blocks locally. After construction the reader is
//! immutable and safe for any number of concurrent readers; `release` is
//! the only writer and runs behind the write side of the handle lock.
//!
//! Any corruption outside the filter block latches the reader: the first
//! error is stored and every later operation returns it without touching
//! the file. Filter-block corruption only disables the filter, which is a
//! pure optimization.

use std::cmp::Ordering;
use std::sync::{Arc, Mutex, RwLock};

use byteorder::{ByteOrder, LittleEndian};

use crate::cache::Namespace;
use crate::comparer::Comparer;
use crate::error::{BlockKind, Error, Result};
use crate::filter::FilterPolicy;
use crate::options::{Options, ReadOptions};
use crate::storage::{FileDesc, RandomAccessFile};
use crate::util::{crc, BufferPool, Range};

use super::block::{Block, BlockIter, Releaser};
use super::iterator::TableIter;
use super::{
    BlockHandle, BLOCK_TRAILER_LEN, COMPRESSION_NONE, COMPRESSION_SNAPPY, FOOTER_LEN, MAGIC,
};

/// The decoded filter block: concatenated filter strings located by a
/// trailing offsets array.
pub(crate) struct FilterBlock {
    data: Vec<u8>,
    o_offset: usize,
    base_lg: u8,
    filters_num: usize,
    pool: Option<Arc<BufferPool>>,
}

impl FilterBlock {
    /// Whether `key` may exist in the data block starting at `offset`.
    ///
    /// A span with no filter bytes is a definitive negative; an index past
    /// the filter count or a malformed offset pair degrades to "possibly
    /// present". The filter only ever saves work.
    pub(crate) fn contains(&self, policy: &dyn FilterPolicy, offset: u64, key: &[u8]) -> bool {
        let i = (offset >> self.base_lg) as usize;
        if i < self.filters_num {
            let o = self.o_offset + i * 4;
            let n = LittleEndian::read_u32(&self.data[o..]) as usize;
            let m = LittleEndian::read_u32(&self.data[o + 4..]) as usize;
            if n < m && m <= self.o_offset {
                return policy.contains(&self.data[n..m], key);
            } else if n == m {
                return false;
            }
        }
        true
    }

    fn charge(&self) -> usize {
        self.data.capacity()
    }
}

impl Drop for FilterBlock {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.put(std::mem::take(&mut self.data));
        }
    }
}

/// State torn down by `release`.
struct Handles {
    file: Option<Box<dyn RandomAccessFile>>,
    index_block: Option<Arc<Block>>,
    filter_block: Option<Arc<FilterBlock>>,
}

/// A table reader. Safe for concurrent use once constructed.
pub struct Reader {
    fd: FileDesc,
    cmp: Arc<dyn Comparer>,
    filter: Option<Arc<dyn FilterPolicy>>,
    verify_checksum: bool,

    data_end: u64,
    meta_bh: BlockHandle,
    index_bh: BlockHandle,
    filter_bh: BlockHandle,

    cache: Option<Namespace>,
    pool: Option<Arc<BufferPool>>,

    handles: RwLock<Handles>,
    /// First error latched; release overrides it with `ReaderReleased`.
    err: Mutex<Option<Error>>,
}

impl Reader {
    /// Opens a table of `size` bytes. The cache namespace and buffer pool
    /// are optional. Corruption yields a usable reader with the error
    /// latched; only I/O failures are returned as `Err`.
    pub fn new(
        file: Box<dyn RandomAccessFile>,
        size: u64,
        fd: FileDesc,
        cache: Option<Namespace>,
        pool: Option<Arc<BufferPool>>,
        o: &Options,
    ) -> Result<Reader> {
        let mut r = Reader {
            fd,
            cmp: o.comparer.clone(),
            filter: None,
            verify_checksum: o.strict_block_checksum,
            data_end: 0,
            meta_bh: BlockHandle::default(),
            index_bh: BlockHandle::default(),
            filter_bh: BlockHandle::default(),
            cache,
            pool,
            handles: RwLock::new(Handles {
                file: None,
                index_block: None,
                filter_block: None,
            }),
            err: Mutex::new(None),
        };

        if size < FOOTER_LEN as u64 {
            r.latch(Error::corrupted(fd, 0, size, BlockKind::Table, "too small"));
            r.store_file(file);
            return Ok(r);
        }

        let footer_pos = size - FOOTER_LEN as u64;
        let mut footer = [0u8; FOOTER_LEN];
        let n = file.read_at(&mut footer, footer_pos)?;
        if n < FOOTER_LEN
            || LittleEndian::read_u64(&footer[FOOTER_LEN - 8..]) != MAGIC
        {
            r.latch(Error::corrupted(
                fd,
                footer_pos,
                FOOTER_LEN as u64,
                BlockKind::TableFooter,
                "bad magic number",
            ));
            r.store_file(file);
            return Ok(r);
        }

        let Some((meta_bh, n)) = BlockHandle::decode(&footer) else {
            r.latch(Error::corrupted(
                fd,
                footer_pos,
                FOOTER_LEN as u64,
                BlockKind::TableFooter,
                "bad metaindex block handle",
            ));
            r.store_file(file);
            return Ok(r);
        };
        r.meta_bh = meta_bh;
        let Some((index_bh, _)) = BlockHandle::decode(&footer[n..]) else {
            r.latch(Error::corrupted(
                fd,
                footer_pos,
                FOOTER_LEN as u64,
                BlockKind::TableFooter,
                "bad index block handle",
            ));
            r.store_file(file);
            return Ok(r);
        };
        r.index_bh = index_bh;
        r.data_end = r.meta_bh.offset;

        // Select a filter from the metaindex.
        let meta_block = match r.read_block(file.as_ref(), r.meta_bh, true) {
            Ok(block) => block,
            Err(e) if e.is_corrupted() => {
                r.latch(e);
                r.store_file(file);
                return Ok(r);
            }
            Err(e) => return Err(e),
        };
        let mut meta_iter = r.new_block_iter(meta_block, None, None, true);
        while meta_iter.next() {
            let Some(name) = meta_iter.key().strip_prefix(b"filter.") else {
                continue;
            };
            let selected = o
                .filter
                .iter()
                .chain(o.alt_filters.iter())
                .find(|f| f.name().as_bytes() == name)
                .cloned();
            if let Some(policy) = selected {
                if let Some((filter_bh, _)) = BlockHandle::decode(meta_iter.value()) {
                    r.filter = Some(policy);
                    r.filter_bh = filter_bh;
                    r.data_end = filter_bh.offset;
                    break;
                }
            }
        }
        drop(meta_iter);

        // Without a shared cache, hold the index and filter blocks locally.
        if r.cache.is_none() {
            let index_block = match r.read_block(file.as_ref(), r.index_bh, true) {
                Ok(block) => Some(block),
                Err(e) if e.is_corrupted() => {
                    r.latch(e);
                    r.store_file(file);
                    return Ok(r);
                }
                Err(e) => return Err(e),
            };
            let mut filter_block = None;
            if r.filter.is_some() {
                match r.read_filter_block(file.as_ref(), r.filter_bh) {
                    Ok(block) => filter_block = Some(block),
                    Err(e) if e.is_corrupted() => {
                        // The table stays readable without its filter.
                        tracing::warn!(fd = %fd, error = %e, "dropping corrupted filter block");
                        r.filter = None;
                    }
                    Err(e) => return Err(e),
                }
            }
            let mut handles = r.handles.write()?;
            handles.index_block = index_block;
            handles.filter_block = filter_block;
            drop(handles);
        }

        r.store_file(file);
        Ok(r)
    }

    /// Gets the value for `key`. The found key must equal `key` by user-key
    /// comparison, else `NotFound`.
    pub fn get(&self, key: &[u8], ro: &ReadOptions) -> Result<Vec<u8>> {
        let (rkey, value) = self.find_inner(key, false, ro, false)?;
        if self.cmp.user_compare(&rkey, key) != Ordering::Equal {
            return Err(Error::NotFound);
        }
        Ok(value)
    }

    /// Finds the first entry with key `>= key`, returning `(key, value)`.
    /// With `filtered`, the target data block's filter is consulted first
    /// and a definitive negative short-circuits to `NotFound`.
    pub fn find(&self, key: &[u8], filtered: bool, ro: &ReadOptions) -> Result<(Vec<u8>, Vec<u8>)> {
        self.find_inner(key, filtered, ro, false)
    }

    /// Like [`Reader::find`] but skips materializing the value.
    pub fn find_key(&self, key: &[u8], filtered: bool, ro: &ReadOptions) -> Result<Vec<u8>> {
        let (rkey, _) = self.find_inner(key, filtered, ro, true)?;
        Ok(rkey)
    }

    /// A two-level iterator over the table, optionally restricted to
    /// `slice`. The slice is handed to inner block iterators only at the
    /// first and last index positions; interior blocks are fully in range.
    pub fn new_iterator(&self, slice: Option<Range>, ro: &ReadOptions) -> TableIter<'_> {
        let index = (|| -> Result<BlockIter> {
            let handles = self.handles.read()?;
            self.check()?;
            let file = file_of(&handles)?;
            let (block, releaser) = self.get_index_block(&handles, file, !ro.dont_fill_cache)?;
            Ok(self.new_block_iter(block, releaser, slice.as_ref(), true))
        })();
        match index {
            Ok(index) => TableIter::new(self, index, slice, ro),
            Err(e) => TableIter::with_error(self, e),
        }
    }

    /// Approximate file offset of `key`: the start of the data block that
    /// would hold it, or the end of the data region when past all keys.
    pub fn offset_of(&self, key: &[u8]) -> Result<u64> {
        let handles = self.handles.read()?;
        self.check()?;
        let file = file_of(&handles)?;

        let (index_block, releaser) = self.get_index_block(&handles, file, true)?;
        let mut index = self.new_block_iter(index_block, releaser, None, true);
        if index.seek(key) {
            let Some((data_bh, _)) = BlockHandle::decode(index.value()) else {
                return Err(self.latch(self.corrupted_bh(self.index_bh, "bad data block handle")));
            };
            return Ok(data_bh.offset);
        }
        match index.take_err() {
            Some(e) => Err(e),
            None => Ok(self.data_end),
        }
    }

    /// Closes the file and drops locally-held blocks. Every subsequent
    /// operation returns `ReaderReleased`. Safe to call more than once.
    pub fn release(&self) {
        let mut handles = match self.handles.write() {
            Ok(handles) => handles,
            Err(poisoned) => poisoned.into_inner(),
        };
        handles.file = None;
        handles.index_block = None;
        handles.filter_block = None;
        let mut err = match self.err.lock() {
            Ok(err) => err,
            Err(poisoned) => poisoned.into_inner(),
        };
        *err = Some(Error::ReaderReleased);
    }

    pub fn fd(&self) -> FileDesc {
        self.fd
    }

    pub(crate) fn comparer(&self) -> &Arc<dyn Comparer> {
        &self.cmp
    }

    fn find_inner(
        &self,
        key: &[u8],
        filtered: bool,
        ro: &ReadOptions,
        no_value: bool,
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        let handles = self.handles.read()?;
        self.check()?;
        let file = file_of(&handles)?;
        let fill_cache = !ro.dont_fill_cache;
        let verify = self.verify_checksum || ro.strict;

        let (index_block, releaser) = self.get_index_block(&handles, file, true)?;
        let mut index = self.new_block_iter(index_block, releaser, None, true);
        if !index.seek(key) {
            return Err(index.take_err().unwrap_or(Error::NotFound));
        }
        let Some((data_bh, _)) = BlockHandle::decode(index.value()) else {
            return Err(self.latch(self.corrupted_bh(self.index_bh, "bad data block handle")));
        };

        // The filter is only an exact-lookup optimization; corruption here
        // falls back to reading the block.
        if filtered {
            if let Some(policy) = self.filter.as_deref() {
                match self.get_filter_block(&handles, file, true) {
                    Ok((filter_block, releaser)) => {
                        let possible = filter_block.contains(policy, data_bh.offset, key);
                        if let Some(releaser) = releaser {
                            releaser();
                        }
                        if !possible {
                            return Err(Error::NotFound);
                        }
                    }
                    Err(e) if !e.is_corrupted() => return Err(e),
                    Err(_) => {}
                }
            }
        }

        let mut data = self.get_data_iter(file, data_bh, None, verify, fill_cache);
        if !data.seek(key) {
            if let Some(e) = data.take_err() {
                return Err(e);
            }
            // The nearest greater key may open the next data block, since
            // index separators can fall between blocks.
            if !index.next() {
                return Err(index.take_err().unwrap_or(Error::NotFound));
            }
            let Some((data_bh, _)) = BlockHandle::decode(index.value()) else {
                return Err(self.latch(self.corrupted_bh(self.index_bh, "bad data block handle")));
            };
            data = self.get_data_iter(file, data_bh, None, verify, fill_cache);
            if !data.next() {
                return Err(data.take_err().unwrap_or(Error::NotFound));
            }
        }

        let rkey = data.key().to_vec();
        let value = if no_value {
            Vec::new()
        } else {
            data.value().to_vec()
        };
        Ok((rkey, value))
    }

    /// Data-block iterator for a handle found in the index. Any failure
    /// comes back as an iterator with the error latched.
    pub(crate) fn get_data_iter_guarded(
        &self,
        data_bh: BlockHandle,
        slice: Option<&Range>,
        verify: bool,
        fill_cache: bool,
    ) -> BlockIter {
        let result = (|| -> Result<(Arc<Block>, Option<Releaser>)> {
            let handles = self.handles.read()?;
            self.check()?;
            let file = file_of(&handles)?;
            self.read_block_cached(file, data_bh, verify, fill_cache)
        })();
        match result {
            Ok((block, releaser)) => self.new_block_iter(block, releaser, slice, false),
            Err(e) => BlockIter::with_error(self.cmp.clone(), self.fd, e),
        }
    }

    fn get_data_iter(
        &self,
        file: &dyn RandomAccessFile,
        data_bh: BlockHandle,
        slice: Option<&Range>,
        verify: bool,
        fill_cache: bool,
    ) -> BlockIter {
        match self.read_block_cached(file, data_bh, verify, fill_cache) {
            Ok((block, releaser)) => self.new_block_iter(block, releaser, slice, false),
            Err(e) => BlockIter::with_error(self.cmp.clone(), self.fd, e),
        }
    }

    fn new_block_iter(
        &self,
        block: Arc<Block>,
        block_releaser: Option<Releaser>,
        slice: Option<&Range>,
        incl_limit: bool,
    ) -> BlockIter {
        let kind = self.block_kind(block.handle());
        BlockIter::new(
            block,
            self.cmp.clone(),
            self.fd,
            kind,
            block_releaser,
            slice,
            incl_limit,
        )
    }

    fn get_index_block(
        &self,
        handles: &Handles,
        file: &dyn RandomAccessFile,
        fill_cache: bool,
    ) -> Result<(Arc<Block>, Option<Releaser>)> {
        if let Some(block) = &handles.index_block {
            return Ok((block.clone(), None));
        }
        self.read_block_cached(file, self.index_bh, true, fill_cache)
    }

    fn get_filter_block(
        &self,
        handles: &Handles,
        file: &dyn RandomAccessFile,
        fill_cache: bool,
    ) -> Result<(Arc<FilterBlock>, Option<Releaser>)> {
        if let Some(block) = &handles.filter_block {
            return Ok((block.clone(), None));
        }
        self.read_filter_block_cached(file, self.filter_bh, fill_cache)
    }

    fn read_block_cached(
        &self,
        file: &dyn RandomAccessFile,
        bh: BlockHandle,
        verify: bool,
        fill_cache: bool,
    ) -> Result<(Arc<Block>, Option<Releaser>)> {
        if let Some(cache) = &self.cache {
            let mut fill_err = None;
            let handle = if fill_cache {
                let mut fill = || match self.read_block(file, bh, verify) {
                    Ok(block) => {
                        let charge = block.charge();
                        let value: crate::cache::Value = block;
                        Some((charge, value))
                    }
                    Err(e) => {
                        fill_err = Some(e);
                        None
                    }
                };
                cache.get(bh.offset, Some(&mut fill))
            } else {
                cache.get(bh.offset, None)
            };
            if let Some(handle) = handle {
                let block = handle
                    .value()
                    .clone()
                    .downcast::<Block>()
                    .map_err(|_| self.corrupted_bh(bh, "inconsistent block type"))?;
                let releaser: Releaser = Box::new(move || handle.release());
                return Ok((block, Some(releaser)));
            }
            if let Some(e) = fill_err {
                return Err(e);
            }
            // Probe miss with fill disabled falls through to a direct read.
        }
        let block = self.read_block(file, bh, verify)?;
        Ok((block, None))
    }

    fn read_filter_block_cached(
        &self,
        file: &dyn RandomAccessFile,
        bh: BlockHandle,
        fill_cache: bool,
    ) -> Result<(Arc<FilterBlock>, Option<Releaser>)> {
        if let Some(cache) = &self.cache {
            let mut fill_err = None;
            let handle = if fill_cache {
                let mut fill = || match self.read_filter_block(file, bh) {
                    Ok(block) => {
                        let charge = block.charge();
                        let value: crate::cache::Value = block;
                        Some((charge, value))
                    }
                    Err(e) => {
                        fill_err = Some(e);
                        None
                    }
                };
                cache.get(bh.offset, Some(&mut fill))
            } else {
                cache.get(bh.offset, None)
            };
            if let Some(handle) = handle {
                let block = handle
                    .value()
                    .clone()
                    .downcast::<FilterBlock>()
                    .map_err(|_| self.corrupted_bh(bh, "inconsistent block type"))?;
                let releaser: Releaser = Box::new(move || handle.release());
                return Ok((block, Some(releaser)));
            }
            if let Some(e) = fill_err {
                return Err(e);
            }
        }
        let block = self.read_filter_block(file, bh)?;
        Ok((block, None))
    }

    fn read_block(
        &self,
        file: &dyn RandomAccessFile,
        bh: BlockHandle,
        verify: bool,
    ) -> Result<Arc<Block>> {
        let data = self.read_raw_block(file, bh, verify)?;
        match Block::new(data, bh, self.pool.clone()) {
            Ok(block) => Ok(Arc::new(block)),
            Err(reason) => Err(self.corrupted_bh(bh, reason)),
        }
    }

    fn read_filter_block(
        &self,
        file: &dyn RandomAccessFile,
        bh: BlockHandle,
    ) -> Result<Arc<FilterBlock>> {
        let data = self.read_raw_block(file, bh, true)?;
        let n = data.len();
        if n < 5 {
            self.release_buf(data);
            return Err(self.corrupted_bh(bh, "too short"));
        }
        let m = n - 5;
        let o_offset = LittleEndian::read_u32(&data[m..]) as usize;
        if o_offset > m {
            self.release_buf(data);
            return Err(self.corrupted_bh(bh, "invalid data-offsets offset"));
        }
        Ok(Arc::new(FilterBlock {
            base_lg: data[n - 1],
            filters_num: (m - o_offset) / 4,
            o_offset,
            data,
            pool: self.pool.clone(),
        }))
    }

    /// Reads block bytes plus trailer, verifies the masked CRC when asked,
    /// and undoes block compression.
    fn read_raw_block(
        &self,
        file: &dyn RandomAccessFile,
        bh: BlockHandle,
        verify: bool,
    ) -> Result<Vec<u8>> {
        let len = bh.length as usize;
        let mut data = self.buf_get(len + BLOCK_TRAILER_LEN);
        let n = file.read_at(&mut data, bh.offset)?;
        if n < data.len() {
            self.release_buf(data);
            return Err(self.corrupted_bh(bh, "truncated block read"));
        }

        if verify {
            let stored = LittleEndian::read_u32(&data[len + 1..]);
            let computed = crc::masked_checksum(&data[..len + 1]);
            if stored != computed {
                self.release_buf(data);
                return Err(self.corrupted_bh(
                    bh,
                    format!("checksum mismatch, want={stored:#x} got={computed:#x}"),
                ));
            }
        }

        match data[len] {
            COMPRESSION_NONE => {
                data.truncate(len);
                Ok(data)
            }
            COMPRESSION_SNAPPY => {
                let decoded_len = match snap::raw::decompress_len(&data[..len]) {
                    Ok(decoded_len) => decoded_len,
                    Err(e) => {
                        self.release_buf(data);
                        return Err(self.corrupted_bh(bh, e.to_string()));
                    }
                };
                let mut decoded = self.buf_get(decoded_len);
                match snap::raw::Decoder::new().decompress(&data[..len], &mut decoded) {
                    Ok(n) => {
                        decoded.truncate(n);
                        self.release_buf(data);
                        Ok(decoded)
                    }
                    Err(e) => {
                        self.release_buf(decoded);
                        self.release_buf(data);
                        Err(self.corrupted_bh(bh, e.to_string()))
                    }
                }
            }
            unknown => {
                let reason = format!("unknown compression type {unknown:#x}");
                self.release_buf(data);
                Err(self.corrupted_bh(bh, reason))
            }
        }
    }

    fn block_kind(&self, bh: BlockHandle) -> BlockKind {
        if bh.offset == self.meta_bh.offset {
            BlockKind::MetaBlock
        } else if bh.offset == self.index_bh.offset {
            BlockKind::IndexBlock
        } else if bh.offset == self.filter_bh.offset && self.filter_bh.length > 0 {
            BlockKind::FilterBlock
        } else {
            BlockKind::DataBlock
        }
    }

    fn corrupted_bh(&self, bh: BlockHandle, reason: impl Into<String>) -> Error {
        Error::corrupted(self.fd, bh.offset, bh.length, self.block_kind(bh), reason)
    }

    /// Returns the latched error, if any.
    fn check(&self) -> Result<()> {
        match &*self.err.lock()? {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    /// Latches `e` if nothing is latched yet; returns the effective error.
    fn latch(&self, e: Error) -> Error {
        let mut err = match self.err.lock() {
            Ok(err) => err,
            Err(poisoned) => poisoned.into_inner(),
        };
        err.get_or_insert(e).clone()
    }

    fn store_file(&self, file: Box<dyn RandomAccessFile>) {
        if let Ok(mut handles) = self.handles.write() {
            handles.file = Some(file);
        }
    }

    fn buf_get(&self, n: usize) -> Vec<u8> {
        match &self.pool {
            Some(pool) => pool.get(n),
            None => vec![0; n],
        }
    }

    fn release_buf(&self, buf: Vec<u8>) {
        if let Some(pool) = &self.pool {
            pool.put(buf);
        }
    }
}

fn file_of(handles: &Handles) -> Result<&dyn RandomAccessFile> {
    handles
        .file
        .as_deref()
        .ok_or(Error::ReaderReleased)
}
