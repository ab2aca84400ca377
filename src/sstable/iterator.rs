//! Two-level table iteration.
//!
//! The outer cursor walks the index block; the inner cursor is instantiated
//! lazily from the data-block handle under the current index entry. A range
//! slice restricts the outer cursor directly, and is passed down to inner
//! iterators only at the first and last index positions, because interior
//! blocks are fully inside the range by construction.

use crate::error::{BlockKind, Error};
use crate::options::ReadOptions;
use crate::util::Range;

use super::block::{BlockIter, Releaser};
use super::reader::Reader;
use super::BlockHandle;

/// Iterator over a whole table. Single-threaded; borrow of the reader keeps
/// the reader alive, while release of the reader surfaces as an error on
/// the next operation.
pub struct TableIter<'a> {
    r: &'a Reader,
    index: BlockIter,
    data: Option<BlockIter>,
    slice: Option<Range>,
    fill_cache: bool,
    verify: bool,
    err: Option<Error>,
    err_reported: bool,
    releaser: Option<Releaser>,
    released: bool,
}

impl<'a> TableIter<'a> {
    pub(crate) fn new(
        r: &'a Reader,
        index: BlockIter,
        slice: Option<Range>,
        ro: &ReadOptions,
    ) -> TableIter<'a> {
        TableIter {
            r,
            index,
            data: None,
            slice,
            fill_cache: !ro.dont_fill_cache,
            verify: ro.strict,
            err: None,
            err_reported: false,
            releaser: None,
            released: false,
        }
    }

    pub(crate) fn with_error(r: &'a Reader, err: Error) -> TableIter<'a> {
        TableIter {
            index: BlockIter::with_error(r.comparer().clone(), r.fd(), err.clone()),
            r,
            data: None,
            slice: None,
            fill_cache: false,
            verify: false,
            err: Some(err),
            err_reported: false,
            releaser: None,
            released: false,
        }
    }

    pub fn first(&mut self) -> bool {
        if self.err.is_some() {
            return false;
        }
        if !self.index.first() {
            self.index_err();
            self.data = None;
            return false;
        }
        self.set_data();
        loop {
            if self.err.is_some() {
                return false;
            }
            if let Some(data) = &mut self.data {
                if data.first() {
                    return true;
                }
                if let Some(e) = data.take_err() {
                    self.err = Some(e);
                    return false;
                }
            }
            self.data = None;
            if !self.index.next() {
                self.index_err();
                return false;
            }
            self.set_data();
        }
    }

    pub fn last(&mut self) -> bool {
        if self.err.is_some() {
            return false;
        }
        if !self.index.last() {
            self.index_err();
            self.data = None;
            return false;
        }
        self.set_data();
        loop {
            if self.err.is_some() {
                return false;
            }
            if let Some(data) = &mut self.data {
                if data.last() {
                    return true;
                }
                if let Some(e) = data.take_err() {
                    self.err = Some(e);
                    return false;
                }
            }
            self.data = None;
            if !self.index.prev() {
                self.index_err();
                return false;
            }
            self.set_data();
        }
    }

    /// Positions on the first entry with key `>= target`.
    pub fn seek(&mut self, target: &[u8]) -> bool {
        if self.err.is_some() {
            return false;
        }
        if !self.index.seek(target) {
            self.index_err();
            self.data = None;
            return false;
        }
        self.set_data();
        if self.err.is_some() {
            return false;
        }
        if let Some(data) = &mut self.data {
            if data.seek(target) {
                return true;
            }
            if let Some(e) = data.take_err() {
                self.err = Some(e);
                return false;
            }
        }
        // The target falls between this block's last key and its index
        // separator; the answer is the first entry of a following block.
        self.data = None;
        self.step_forward()
    }

    pub fn next(&mut self) -> bool {
        if self.err.is_some() {
            return false;
        }
        if let Some(data) = &mut self.data {
            if data.next() {
                return true;
            }
            if let Some(e) = data.take_err() {
                self.err = Some(e);
                return false;
            }
        }
        self.data = None;
        self.step_forward()
    }

    pub fn prev(&mut self) -> bool {
        if self.err.is_some() {
            return false;
        }
        if let Some(data) = &mut self.data {
            if data.prev() {
                return true;
            }
            if let Some(e) = data.take_err() {
                self.err = Some(e);
                return false;
            }
        }
        self.data = None;
        loop {
            if !self.index.prev() {
                self.index_err();
                return false;
            }
            self.set_data();
            if self.err.is_some() {
                return false;
            }
            if let Some(data) = &mut self.data {
                if data.last() {
                    return true;
                }
                if let Some(e) = data.take_err() {
                    self.err = Some(e);
                    return false;
                }
            }
            self.data = None;
        }
    }

    /// Current key; valid only after a positioning call returned true.
    pub fn key(&self) -> &[u8] {
        match &self.data {
            Some(data) => data.key(),
            None => &[],
        }
    }

    /// Current value; borrows the block buffer.
    pub fn value(&self) -> &[u8] {
        match &self.data {
            Some(data) => data.value(),
            None => &[],
        }
    }

    pub fn valid(&self) -> bool {
        self.err.is_none() && self.data.as_ref().is_some_and(|d| d.valid())
    }

    pub fn error(&self) -> Option<&Error> {
        self.err.as_ref()
    }

    /// Releases the inner and outer cursors and runs composed releasers.
    /// Releasing twice is a programmer error and panics.
    pub fn release(&mut self) {
        if self.released {
            panic!("table iterator: double release");
        }
        self.released = true;
        self.data = None;
        self.index.release();
        if let Some(releaser) = self.releaser.take() {
            releaser();
        }
    }

    /// Composes a cleanup hook. Panics when already released or when a
    /// releaser is already set.
    pub fn set_releaser(&mut self, releaser: Releaser) {
        if self.released {
            panic!("table iterator: set_releaser on released iterator");
        }
        if self.releaser.is_some() {
            panic!("table iterator: releaser already set");
        }
        self.releaser = Some(releaser);
    }

    /// Advances the outer cursor until an inner entry turns up.
    fn step_forward(&mut self) -> bool {
        loop {
            if !self.index.next() {
                self.index_err();
                return false;
            }
            self.set_data();
            if self.err.is_some() {
                return false;
            }
            if let Some(data) = &mut self.data {
                if data.next() {
                    return true;
                }
                if let Some(e) = data.take_err() {
                    self.err = Some(e);
                    return false;
                }
            }
            self.data = None;
        }
    }

    /// Instantiates the inner cursor for the current index entry.
    fn set_data(&mut self) {
        self.data = None;
        if !self.index.valid() {
            return;
        }
        let Some((data_bh, _)) = BlockHandle::decode(self.index.value()) else {
            self.err = Some(Error::corrupted(
                self.r.fd(),
                0,
                0,
                BlockKind::IndexBlock,
                "bad data block handle",
            ));
            return;
        };
        let slice = if self.slice.is_some() && (self.index.is_first() || self.index.is_last()) {
            self.slice.clone()
        } else {
            None
        };
        self.data = Some(self.r.get_data_iter_guarded(
            data_bh,
            slice.as_ref(),
            self.verify,
            self.fill_cache,
        ));
    }

    fn index_err(&mut self) {
        if let Some(e) = self.index.take_err() {
            self.err = Some(e);
        }
    }
}

impl Drop for TableIter<'_> {
    fn drop(&mut self) {
        if let Some(releaser) = self.releaser.take() {
            releaser();
        }
    }
}

impl Iterator for TableIter<'_> {
    type Item = crate::error::Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if TableIter::next(self) {
            return Some(Ok((self.key().to_vec(), self.value().to_vec())));
        }
        match &self.err {
            Some(e) if !self.err_reported => {
                self.err_reported = true;
                Some(Err(e.clone()))
            }
            _ => None,
        }
    }
}
