//! Decoded blocks and the block iterator.
//!
//! A block is a run of prefix-compressed entries followed by a restart-point
//! array and its length:
//!
//! ```text
//! +---------+---------+-----+----------------------+------------------+
//! | entry 0 | entry 1 | ... | restarts: u32 LE ... | restart count LE |
//! +---------+---------+-----+----------------------+------------------+
//! ```
//!
//! Each entry is `varint shared / varint unshared / varint value_len`
//! followed by the unshared key bytes and the value. An entry at a restart
//! point stores its key in full (`shared == 0`); between restarts a key is
//! reconstructed by keeping the first `shared` bytes of the previous key.
//!
//! [`BlockIter`] is a single-threaded cursor over one decoded block. It is a
//! five-state machine (released, before-first, past-last, forward,
//! backward). Forward movement decodes entries in place; backward movement
//! rebuilds entries by scanning forward from the nearest earlier restart
//! into a cache of key bytes and entry positions that subsequent `prev`
//! calls pop.

use std::cmp::Ordering;
use std::mem;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use integer_encoding::VarInt;

use crate::comparer::Comparer;
use crate::error::{BlockKind, Error};
use crate::storage::FileDesc;
use crate::util::{BufferPool, Range};

use super::BlockHandle;

/// A decoded (uncompressed, checksum-verified) block. Immutable; shared
/// between the cache and any number of iterators. The backing buffer
/// returns to the pool when the last reference drops.
pub struct Block {
    data: Vec<u8>,
    bh: BlockHandle,
    restarts_len: usize,
    restarts_offset: usize,
    pool: Option<Arc<BufferPool>>,
}

impl Block {
    /// Wraps decoded block contents. Fails when the restart array does not
    /// fit the data.
    pub fn new(
        data: Vec<u8>,
        bh: BlockHandle,
        pool: Option<Arc<BufferPool>>,
    ) -> std::result::Result<Self, &'static str> {
        if data.len() < 4 {
            release_buf(data, &pool);
            return Err("block too short");
        }
        let restarts_len = LittleEndian::read_u32(&data[data.len() - 4..]) as usize;
        let tail = restarts_len
            .checked_add(1)
            .and_then(|n| n.checked_mul(4))
            .filter(|&n| n <= data.len());
        let Some(tail) = tail else {
            release_buf(data, &pool);
            return Err("bad restarts length");
        };
        Ok(Self {
            restarts_offset: data.len() - tail,
            data,
            bh,
            restarts_len,
            pool,
        })
    }

    pub fn handle(&self) -> BlockHandle {
        self.bh
    }

    pub fn restarts_len(&self) -> usize {
        self.restarts_len
    }

    /// Charge accounted to the block cache.
    pub fn charge(&self) -> usize {
        self.data.capacity()
    }

    fn restart_offset(&self, index: usize) -> usize {
        LittleEndian::read_u32(&self.data[self.restarts_offset + 4 * index..]) as usize
    }

    /// Index of the last restart in `[rstart, rlimit)` whose offset is at
    /// most `offset`.
    fn restart_index(&self, rstart: usize, rlimit: usize, offset: usize) -> usize {
        let mut lo = 0;
        let mut hi = rlimit - rstart;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.restart_offset(rstart + mid) > offset {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        if lo == 0 {
            rstart
        } else {
            rstart + lo - 1
        }
    }

    /// Index and offset of the last restart in `[rstart, rlimit)` whose
    /// first key is at most `key`; clamps to `rstart` when every restart key
    /// is greater.
    fn seek_restart(
        &self,
        cmp: &dyn Comparer,
        rstart: usize,
        rlimit: usize,
        key: &[u8],
    ) -> std::result::Result<(usize, usize), &'static str> {
        let mut lo = 0;
        let mut hi = rlimit - rstart;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            // A restart entry never shares a prefix, so its shared-length
            // varint is the single byte 0.
            let off = self.restart_offset(rstart + mid) + 1;
            let data = &self.data[..self.restarts_offset];
            let (klen, n1) =
                u64::decode_var(data.get(off..).unwrap_or(&[])).ok_or("restarts corrupted")?;
            let (_, n2) =
                u64::decode_var(&data[off + n1..]).ok_or("restarts corrupted")?;
            let kstart = off + n1 + n2;
            let kend = kstart + klen as usize;
            if kend > self.restarts_offset {
                return Err("restarts corrupted");
            }
            if cmp.compare(&self.data[kstart..kend], key) == Ordering::Greater {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        let index = if lo == 0 { rstart } else { rstart + lo - 1 };
        Ok((index, self.restart_offset(index)))
    }

    /// Decodes the entry at `offset`. `Ok(None)` is the clean end of the
    /// entry region.
    fn entry(&self, offset: usize) -> std::result::Result<Option<RawEntry>, &'static str> {
        if offset >= self.restarts_offset {
            if offset != self.restarts_offset {
                return Err("entries offset not aligned");
            }
            return Ok(None);
        }
        let data = &self.data[..self.restarts_offset];
        let (shared, n0) = u64::decode_var(&data[offset..]).ok_or("entries corrupted")?;
        let (unshared, n1) =
            u64::decode_var(&data[offset + n0..]).ok_or("entries corrupted")?;
        let (value_len, n2) =
            u64::decode_var(&data[offset + n0 + n1..]).ok_or("entries corrupted")?;
        let m = n0 + n1 + n2;
        let size = m + unshared as usize + value_len as usize;
        if offset + size > self.restarts_offset {
            return Err("entries corrupted");
        }
        Ok(Some(RawEntry {
            shared: shared as usize,
            key_off: offset + m,
            key_len: unshared as usize,
            value_off: offset + m + unshared as usize,
            value_len: value_len as usize,
            size,
        }))
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.put(mem::take(&mut self.data));
        }
    }
}

fn release_buf(data: Vec<u8>, pool: &Option<Arc<BufferPool>>) {
    if let Some(pool) = pool {
        pool.put(data);
    }
}

struct RawEntry {
    shared: usize,
    key_off: usize,
    key_len: usize,
    value_off: usize,
    value_len: usize,
    size: usize,
}

/// Iterator direction and lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Dir {
    Released,
    /// Before the first entry.
    Soi,
    /// Past the last entry.
    Eoi,
    Backward,
    Forward,
}

/// Cleanup hook composed onto an iterator, run once on release.
pub type Releaser = Box<dyn FnOnce() + Send>;

/// Cursor over one decoded block. Not thread-safe; create one per reader
/// thread.
pub struct BlockIter {
    block: Option<Arc<Block>>,
    cmp: Arc<dyn Comparer>,
    fd: FileDesc,
    kind: BlockKind,
    releaser: Option<Releaser>,
    block_releaser: Option<Releaser>,

    key: Vec<u8>,
    /// `(offset, len)` of the current value within the block data.
    value: Option<(usize, usize)>,
    offset: usize,
    /// Offset of the current entry; only maintained by forward movement.
    prev_offset: usize,
    /// Backward cache: `(key_offset, value_offset, value_len)` triples, with
    /// a leading scan-start offset sentinel.
    prev_node: Vec<usize>,
    /// Backward cache byte arena holding re-decoded keys.
    prev_keys: Vec<u8>,
    restart_index: usize,
    dir: Dir,

    // Restart-index and offset bounds of the iterated range.
    ri_start: usize,
    ri_limit: usize,
    offset_start: usize,
    /// Exact position of the first in-range entry; `offset_start` is snapped
    /// back to its restart so restart arithmetic stays valid.
    offset_real_start: usize,
    offset_limit: usize,

    err: Option<Error>,
}

impl BlockIter {
    pub(crate) fn new(
        block: Arc<Block>,
        cmp: Arc<dyn Comparer>,
        fd: FileDesc,
        kind: BlockKind,
        block_releaser: Option<Releaser>,
        slice: Option<&Range>,
        incl_limit: bool,
    ) -> BlockIter {
        let mut it = BlockIter {
            cmp,
            fd,
            kind,
            releaser: None,
            block_releaser,
            key: Vec::new(),
            value: None,
            offset: 0,
            prev_offset: 0,
            prev_node: Vec::new(),
            prev_keys: Vec::new(),
            restart_index: 0,
            dir: Dir::Soi,
            ri_start: 0,
            ri_limit: block.restarts_len,
            offset_start: 0,
            offset_real_start: 0,
            offset_limit: block.restarts_offset,
            err: None,
            block: Some(block),
        };
        if let Some(slice) = slice {
            it.apply_slice(slice, incl_limit);
        }
        it
    }

    /// An iterator that yields nothing and reports `err`.
    pub(crate) fn with_error(cmp: Arc<dyn Comparer>, fd: FileDesc, err: Error) -> BlockIter {
        BlockIter {
            block: None,
            cmp,
            fd,
            kind: BlockKind::DataBlock,
            releaser: None,
            block_releaser: None,
            key: Vec::new(),
            value: None,
            offset: 0,
            prev_offset: 0,
            prev_node: Vec::new(),
            prev_keys: Vec::new(),
            restart_index: 0,
            dir: Dir::Eoi,
            ri_start: 0,
            ri_limit: 0,
            offset_start: 0,
            offset_real_start: 0,
            offset_limit: 0,
            err: Some(err),
        }
    }

    fn apply_slice(&mut self, slice: &Range, incl_limit: bool) {
        let block = self.block.clone().expect("sliced iterator has a block");
        if let Some(start) = &slice.start {
            if self.seek(start) {
                self.ri_start =
                    block.restart_index(self.restart_index, block.restarts_len, self.prev_offset);
                self.offset_start = block.restart_offset(self.ri_start);
                self.offset_real_start = self.prev_offset;
            } else {
                // The whole block precedes the range.
                self.ri_start = block.restarts_len;
                self.offset_start = block.restarts_offset;
                self.offset_real_start = block.restarts_offset;
            }
        }
        if let Some(limit) = &slice.limit {
            if self.seek(limit) && (!incl_limit || self.next()) {
                self.offset_limit = self.prev_offset;
                self.ri_limit = self.restart_index + 1;
            }
        }
        self.reset();
        if self.offset_start > self.offset_limit {
            self.set_err(Error::InvalidInput("invalid slice range".to_string()));
        }
    }

    fn set_err(&mut self, err: Error) {
        self.err = Some(err);
        self.key.clear();
        self.value = None;
        self.prev_node.clear();
        self.prev_keys.clear();
    }

    fn corrupted(&self, reason: &'static str) -> Error {
        let (pos, size) = match &self.block {
            Some(b) => (b.bh.offset, b.bh.length),
            None => (0, 0),
        };
        Error::corrupted(self.fd, pos, size, self.kind, reason)
    }

    fn reset(&mut self) {
        if self.dir == Dir::Backward {
            self.prev_node.clear();
            self.prev_keys.clear();
        }
        self.restart_index = self.ri_start;
        self.offset = self.offset_start;
        self.dir = Dir::Soi;
        self.key.clear();
        self.value = None;
    }

    /// Defined only while directed (after a positioning call returned true).
    pub fn is_first(&self) -> bool {
        match self.dir {
            Dir::Forward => self.prev_offset == self.offset_real_start,
            Dir::Backward => self.prev_node.len() == 1 && self.restart_index == self.ri_start,
            _ => false,
        }
    }

    /// Defined only while directed.
    pub fn is_last(&self) -> bool {
        matches!(self.dir, Dir::Forward | Dir::Backward) && self.offset == self.offset_limit
    }

    pub fn first(&mut self) -> bool {
        if self.err.is_some() {
            return false;
        }
        if self.dir == Dir::Released {
            self.err = Some(Error::IterReleased);
            return false;
        }
        if self.dir == Dir::Backward {
            self.prev_node.clear();
            self.prev_keys.clear();
        }
        self.dir = Dir::Soi;
        self.next()
    }

    pub fn last(&mut self) -> bool {
        if self.err.is_some() {
            return false;
        }
        if self.dir == Dir::Released {
            self.err = Some(Error::IterReleased);
            return false;
        }
        if self.dir == Dir::Backward {
            self.prev_node.clear();
            self.prev_keys.clear();
        }
        self.dir = Dir::Eoi;
        self.prev()
    }

    /// Positions on the first entry with key `>= target`.
    pub fn seek(&mut self, target: &[u8]) -> bool {
        if self.err.is_some() {
            return false;
        }
        if self.dir == Dir::Released {
            self.err = Some(Error::IterReleased);
            return false;
        }
        let Some(block) = self.block.clone() else {
            return false;
        };

        let (ri, offset) =
            match block.seek_restart(self.cmp.as_ref(), self.ri_start, self.ri_limit, target) {
                Ok(found) => found,
                Err(reason) => {
                    let err = self.corrupted(reason);
                    self.set_err(err);
                    return false;
                }
            };
        self.restart_index = ri;
        self.offset = self.offset_start.max(offset);
        if self.dir == Dir::Soi || self.dir == Dir::Eoi {
            self.dir = Dir::Forward;
        }
        while self.next() {
            if self.cmp.compare(&self.key, target) != Ordering::Less {
                return true;
            }
        }
        false
    }

    pub fn next(&mut self) -> bool {
        if self.dir == Dir::Eoi || self.err.is_some() {
            return false;
        }
        if self.dir == Dir::Released {
            self.err = Some(Error::IterReleased);
            return false;
        }
        let Some(block) = self.block.clone() else {
            return false;
        };

        if self.dir == Dir::Soi {
            self.restart_index = self.ri_start;
            self.offset = self.offset_start;
        } else if self.dir == Dir::Backward {
            self.prev_node.clear();
            self.prev_keys.clear();
        }

        // A slice start snapped to its restart leaves entries before the
        // real start; decode through them to rebuild key prefixes.
        while self.offset < self.offset_real_start {
            if !self.decode_at_offset(&block) {
                return false;
            }
        }

        if self.offset >= self.offset_limit {
            self.dir = Dir::Eoi;
            if self.offset != self.offset_limit {
                let err = self.corrupted("entries offset not aligned");
                self.set_err(err);
            }
            return false;
        }

        let entry = match block.entry(self.offset) {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                self.dir = Dir::Eoi;
                return false;
            }
            Err(reason) => {
                let err = self.corrupted(reason);
                self.set_err(err);
                return false;
            }
        };
        if !self.load_entry(&block, &entry) {
            return false;
        }
        self.value = Some((entry.value_off, entry.value_len));
        self.prev_offset = self.offset;
        self.offset += entry.size;
        self.dir = Dir::Forward;
        true
    }

    pub fn prev(&mut self) -> bool {
        if self.dir == Dir::Soi || self.err.is_some() {
            return false;
        }
        if self.dir == Dir::Released {
            self.err = Some(Error::IterReleased);
            return false;
        }
        let Some(block) = self.block.clone() else {
            return false;
        };

        let mut ri;
        match self.dir {
            Dir::Forward => {
                // Change direction: the current entry becomes the scan
                // target and its restart range gets rebuilt below.
                self.offset = self.prev_offset;
                if self.offset == self.offset_real_start {
                    self.dir = Dir::Soi;
                    return false;
                }
                ri = block.restart_index(self.restart_index, self.ri_limit, self.offset);
                self.dir = Dir::Backward;
            }
            Dir::Eoi => {
                self.restart_index = self.ri_limit;
                self.offset = self.offset_limit;
                if self.offset == self.offset_real_start {
                    self.dir = Dir::Soi;
                    return false;
                }
                if self.ri_limit == 0 {
                    self.dir = Dir::Soi;
                    return false;
                }
                ri = self.ri_limit - 1;
                self.dir = Dir::Backward;
            }
            Dir::Backward if self.prev_node.len() == 1 => {
                // Cache exhausted for this restart range; move to the
                // previous restart.
                self.offset = self.prev_node[0];
                self.prev_node.clear();
                if self.restart_index == self.ri_start {
                    self.dir = Dir::Soi;
                    return false;
                }
                self.restart_index -= 1;
                ri = self.restart_index;
            }
            Dir::Backward => {
                // Serve from the cache.
                let n = self.prev_node.len() - 3;
                let key_off = self.prev_node[n];
                let value_off = self.prev_node[n + 1];
                let value_len = self.prev_node[n + 2];
                self.prev_node.truncate(n);
                self.key.clear();
                self.key.extend_from_slice(&self.prev_keys[key_off..]);
                self.prev_keys.truncate(key_off);
                self.value = Some((value_off, value_len));
                self.offset = value_off + value_len;
                return true;
            }
            _ => unreachable!(),
        }

        // Rebuild the cache by scanning forward from restart `ri` up to the
        // entry we are stepping back from.
        self.key.clear();
        self.value = None;
        let mut offset = block.restart_offset(ri);
        if offset == self.offset {
            // Stepping back from a restart entry itself.
            if ri == 0 {
                self.dir = Dir::Soi;
                return false;
            }
            ri -= 1;
            offset = block.restart_offset(ri);
        }
        self.prev_node.push(offset);
        loop {
            let entry = match block.entry(offset) {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    let err = self.corrupted("entries offset not aligned");
                    self.set_err(err);
                    return false;
                }
                Err(reason) => {
                    let err = self.corrupted(reason);
                    self.set_err(err);
                    return false;
                }
            };
            if offset >= self.offset_real_start {
                if let Some((value_off, value_len)) = self.value {
                    // Record the previous entry before overwriting it.
                    self.prev_node.push(self.prev_keys.len());
                    self.prev_node.push(value_off);
                    self.prev_node.push(value_len);
                    self.prev_keys.extend_from_slice(&self.key);
                }
                self.value = Some((entry.value_off, entry.value_len));
            }
            if !self.load_entry(&block, &entry) {
                return false;
            }
            offset += entry.size;
            if offset >= self.offset {
                if offset != self.offset {
                    let err = self.corrupted("entries offset not aligned");
                    self.set_err(err);
                    return false;
                }
                break;
            }
        }
        self.restart_index = ri;
        self.offset = offset;
        true
    }

    /// Current key. Valid only while directed.
    pub fn key(&self) -> &[u8] {
        match self.dir {
            Dir::Forward | Dir::Backward => &self.key,
            _ => &[],
        }
    }

    /// Current value. Valid only while directed; borrows the block buffer.
    pub fn value(&self) -> &[u8] {
        match (self.dir, self.value, &self.block) {
            (Dir::Forward | Dir::Backward, Some((off, len)), Some(block)) => {
                &block.data[off..off + len]
            }
            _ => &[],
        }
    }

    pub fn valid(&self) -> bool {
        self.err.is_none() && matches!(self.dir, Dir::Forward | Dir::Backward)
    }

    pub fn error(&self) -> Option<&Error> {
        self.err.as_ref()
    }

    pub(crate) fn take_err(&mut self) -> Option<Error> {
        self.err.take()
    }

    /// Releases the block reference and runs composed releasers in LIFO
    /// order. Releasing twice is a programmer error and panics.
    pub fn release(&mut self) {
        if self.dir == Dir::Released {
            panic!("block iterator: double release");
        }
        self.release_inner();
    }

    /// Composes a cleanup hook onto this iterator. Panics when the iterator
    /// is released or a releaser is already set.
    pub fn set_releaser(&mut self, releaser: Releaser) {
        if self.dir == Dir::Released {
            panic!("block iterator: set_releaser on released iterator");
        }
        if self.releaser.is_some() {
            panic!("block iterator: releaser already set");
        }
        self.releaser = Some(releaser);
    }

    fn release_inner(&mut self) {
        self.dir = Dir::Released;
        self.block = None;
        self.key = Vec::new();
        self.value = None;
        self.prev_node = Vec::new();
        self.prev_keys = Vec::new();
        if let Some(releaser) = self.block_releaser.take() {
            releaser();
        }
        if let Some(releaser) = self.releaser.take() {
            releaser();
        }
    }

    /// Reconstructs the key at the current entry and advances nothing.
    fn load_entry(&mut self, block: &Block, entry: &RawEntry) -> bool {
        if entry.shared > self.key.len() {
            let err = self.corrupted("entries corrupted");
            self.set_err(err);
            return false;
        }
        self.key.truncate(entry.shared);
        self.key
            .extend_from_slice(&block.data[entry.key_off..entry.key_off + entry.key_len]);
        true
    }

    /// Forward decode of one entry during the pre-start skip.
    fn decode_at_offset(&mut self, block: &Block) -> bool {
        match block.entry(self.offset) {
            Ok(Some(entry)) => {
                if !self.load_entry(block, &entry) {
                    return false;
                }
                self.value = Some((entry.value_off, entry.value_len));
                self.offset += entry.size;
                true
            }
            Ok(None) => {
                self.dir = Dir::Eoi;
                false
            }
            Err(reason) => {
                let err = self.corrupted(reason);
                self.set_err(err);
                false
            }
        }
    }
}

impl Drop for BlockIter {
    fn drop(&mut self) {
        // Backstop for iterators dropped without an explicit release.
        if self.dir != Dir::Released {
            self.release_inner();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparer::BytewiseComparer;
    use crate::sstable::writer::BlockBuilder;

    fn fd() -> FileDesc {
        FileDesc::new(crate::storage::FileType::Table, 1)
    }

    fn build_block(entries: &[(&[u8], &[u8])], restart_interval: usize) -> Arc<Block> {
        let mut builder = BlockBuilder::new(restart_interval);
        for (key, value) in entries {
            builder.append(key, value);
        }
        let data = builder.finish().to_vec();
        let bh = BlockHandle::new(0, data.len() as u64);
        Arc::new(Block::new(data, bh, None).expect("block"))
    }

    fn iter(block: &Arc<Block>) -> BlockIter {
        BlockIter::new(
            block.clone(),
            Arc::new(BytewiseComparer),
            fd(),
            BlockKind::DataBlock,
            None,
            None,
            false,
        )
    }

    fn sliced(block: &Arc<Block>, start: &[u8], limit: &[u8]) -> BlockIter {
        let range = Range::new(start, limit);
        BlockIter::new(
            block.clone(),
            Arc::new(BytewiseComparer),
            fd(),
            BlockKind::DataBlock,
            None,
            Some(&range),
            false,
        )
    }

    fn keys(n: usize) -> Vec<(Vec<u8>, Vec<u8>)> {
        (0..n)
            .map(|i| {
                (
                    format!("k{i:02}").into_bytes(),
                    format!("v{i:02}").into_bytes(),
                )
            })
            .collect()
    }

    fn to_refs(entries: &[(Vec<u8>, Vec<u8>)]) -> Vec<(&[u8], &[u8])> {
        entries
            .iter()
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
            .collect()
    }

    #[test]
    fn test_forward_iteration_matches_input() {
        let entries = keys(10);
        let block = build_block(&to_refs(&entries), 4);
        let mut it = iter(&block);

        let mut seen = Vec::new();
        while it.next() {
            seen.push((it.key().to_vec(), it.value().to_vec()));
        }
        assert_eq!(seen, entries);
        assert!(it.error().is_none());
    }

    #[test]
    fn test_empty_block_is_immediately_eoi() {
        let block = build_block(&[], 4);
        let mut it = iter(&block);
        assert!(!it.next());
        assert!(!it.first());
        assert!(!it.last());
        assert!(it.error().is_none());
    }

    #[test]
    fn test_single_entry_first_equals_last() {
        let block = build_block(&[(b"only", b"value")], 4);
        let mut it = iter(&block);
        assert!(it.first());
        assert_eq!(it.key(), b"only");
        assert!(it.is_first());
        assert!(it.is_last());

        let mut it = iter(&block);
        assert!(it.last());
        assert_eq!(it.key(), b"only");
        assert!(it.is_first());
        assert!(it.is_last());
    }

    #[test]
    fn test_seek_lands_on_first_geq() {
        let entries = keys(10);
        let block = build_block(&to_refs(&entries), 4);
        let mut it = iter(&block);

        assert!(it.seek(b"k05"));
        assert_eq!(it.key(), b"k05");
        // Between stored keys.
        assert!(it.seek(b"k051"));
        assert_eq!(it.key(), b"k06");
        // Before everything.
        assert!(it.seek(b"a"));
        assert_eq!(it.key(), b"k00");
        // Past everything.
        assert!(!it.seek(b"z"));
        assert!(it.error().is_none());
    }

    #[test]
    fn test_seek_at_restart_key_exact() {
        // Restart interval 4 puts k04 and k08 exactly at restart points.
        let entries = keys(10);
        let block = build_block(&to_refs(&entries), 4);
        let mut it = iter(&block);
        assert!(it.seek(b"k04"));
        assert_eq!(it.key(), b"k04");
        assert!(it.seek(b"k08"));
        assert_eq!(it.key(), b"k08");
    }

    #[test]
    fn test_backward_across_restart_boundary() {
        let entries = keys(10);
        let block = build_block(&to_refs(&entries), 4);
        let mut it = iter(&block);

        assert!(it.seek(b"k07"));
        let mut reversed = Vec::new();
        for _ in 0..6 {
            assert!(it.prev());
            reversed.push(it.key().to_vec());
        }
        assert_eq!(
            reversed,
            vec![
                b"k06".to_vec(),
                b"k05".to_vec(),
                b"k04".to_vec(),
                b"k03".to_vec(),
                b"k02".to_vec(),
                b"k01".to_vec()
            ]
        );
        assert!(it.prev());
        assert_eq!(it.key(), b"k00");
        assert!(!it.prev());
        // Back at the start of iteration; next() walks forward again.
        assert!(it.next());
        assert_eq!(it.key(), b"k00");
    }

    #[test]
    fn test_last_then_prev_walks_backward() {
        let entries = keys(5);
        let block = build_block(&to_refs(&entries), 2);
        let mut it = iter(&block);

        assert!(it.last());
        assert_eq!(it.key(), b"k04");
        let mut seen = vec![it.key().to_vec()];
        while it.prev() {
            seen.push(it.key().to_vec());
        }
        seen.reverse();
        let expected: Vec<Vec<u8>> = entries.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_values_survive_direction_changes() {
        let entries = keys(8);
        let block = build_block(&to_refs(&entries), 3);
        let mut it = iter(&block);

        assert!(it.seek(b"k05"));
        assert_eq!(it.value(), b"v05");
        assert!(it.prev());
        assert_eq!(it.value(), b"v04");
        assert!(it.prev());
        assert_eq!(it.value(), b"v03");
        assert!(it.next());
        assert_eq!(it.value(), b"v04");
    }

    #[test]
    fn test_slice_restricts_both_ends() {
        let entries = keys(10);
        let block = build_block(&to_refs(&entries), 4);
        let mut it = sliced(&block, b"k03", b"k07");

        let mut seen = Vec::new();
        while it.next() {
            seen.push(it.key().to_vec());
        }
        assert_eq!(
            seen,
            vec![b"k03".to_vec(), b"k04".to_vec(), b"k05".to_vec(), b"k06".to_vec()]
        );

        // Backward over the same slice.
        let mut it = sliced(&block, b"k03", b"k07");
        assert!(it.last());
        assert_eq!(it.key(), b"k06");
        assert!(it.is_last());
        let mut back = vec![it.key().to_vec()];
        while it.prev() {
            back.push(it.key().to_vec());
        }
        back.reverse();
        assert_eq!(
            back,
            vec![b"k03".to_vec(), b"k04".to_vec(), b"k05".to_vec(), b"k06".to_vec()]
        );
    }

    #[test]
    fn test_slice_excluding_block_is_empty() {
        let entries = keys(10);
        let block = build_block(&to_refs(&entries), 4);
        let mut it = sliced(&block, b"x", b"y");
        assert!(!it.next());
        assert!(!it.last());
        assert!(it.error().is_none());
    }

    #[test]
    fn test_slice_equals_manual_scan() {
        let entries = keys(10);
        let block = build_block(&to_refs(&entries), 3);
        for i in 0..entries.len() {
            for j in i..entries.len() {
                let start = &entries[i].0;
                let limit = &entries[j].0;
                let mut manual = Vec::new();
                let mut it = iter(&block);
                if it.seek(start) {
                    loop {
                        if it.key() >= limit.as_slice() {
                            break;
                        }
                        manual.push(it.key().to_vec());
                        if !it.next() {
                            break;
                        }
                    }
                }
                let mut it = sliced(&block, start, limit);
                let mut via_slice = Vec::new();
                while it.next() {
                    via_slice.push(it.key().to_vec());
                }
                assert_eq!(via_slice, manual, "slice [{i}, {j})");
            }
        }
    }

    #[test]
    fn test_corrupt_varint_latches_error() {
        let entries = keys(4);
        let block = build_block(&to_refs(&entries), 4);
        // Rebuild the raw bytes with a wrecked entry header.
        let mut data = block.data.clone();
        data[0] = 0xff; // continuation bit with nothing valid after
        data[1] = 0xff;
        let bad = Arc::new(Block::new(data, BlockHandle::new(0, 0), None).expect("block"));
        let mut it = iter(&bad);
        assert!(!it.next());
        let err = it.error().expect("latched").clone();
        assert!(err.is_corrupted(), "{err}");
        // Latched: everything keeps failing.
        assert!(!it.first());
        assert_eq!(it.error(), Some(&err));
    }

    #[test]
    fn test_invalid_slice_range_latches() {
        let entries = keys(10);
        let block = build_block(&to_refs(&entries), 4);
        let mut it = sliced(&block, b"k07", b"k02");
        assert!(!it.next());
        assert!(it.error().is_some());
    }

    #[test]
    #[should_panic(expected = "double release")]
    fn test_double_release_panics() {
        let block = build_block(&[(b"a", b"1")], 4);
        let mut it = iter(&block);
        it.release();
        it.release();
    }

    #[test]
    #[should_panic(expected = "releaser already set")]
    fn test_second_releaser_panics() {
        let block = build_block(&[(b"a", b"1")], 4);
        let mut it = iter(&block);
        it.set_releaser(Box::new(|| {}));
        it.set_releaser(Box::new(|| {}));
    }

    #[test]
    fn test_releasers_run_in_lifo_order() {
        use std::sync::Mutex;
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

        let block = build_block(&[(b"a", b"1")], 4);
        let block_order = order.clone();
        let mut it = BlockIter::new(
            block,
            Arc::new(BytewiseComparer),
            fd(),
            BlockKind::DataBlock,
            Some(Box::new(move || block_order.lock().unwrap().push("block"))),
            None,
            false,
        );
        let set_order = order.clone();
        it.set_releaser(Box::new(move || set_order.lock().unwrap().push("composed")));
        it.release();
        assert_eq!(*order.lock().unwrap(), vec!["block", "composed"]);
    }

    #[test]
    fn test_ops_after_release_report_released() {
        let block = build_block(&[(b"a", b"1")], 4);
        let mut it = iter(&block);
        it.release();
        assert!(!it.next());
        assert_eq!(it.error(), Some(&Error::IterReleased));
    }
}
