//! cinderdb is the read-path core of an on-disk, ordered key/value storage
//! engine in the log-structured merge-tree family.
//!
//! The crate covers the three subsystems that define the on-disk contract:
//!
//! - [`sstable`]: the immutable sorted-string table format (footer,
//!   metaindex, filter block, index block and prefix-compressed data blocks)
//!   with a bidirectional block iterator and a two-level table iterator.
//! - [`journal`]: the append-only write-ahead log framing, 32 KiB blocks of
//!   CRC-protected records fragmented as FULL/FIRST/MIDDLE/LAST.
//! - [`snapshot`]: sequence-number pinning for point-in-time reads, with
//!   reference-counted registry entries and an oldest-live-sequence query.
//!
//! Everything else the subsystems touch is consumed through the narrow
//! interfaces in the remaining modules: the comparer, the filter policy,
//! random-access storage, the block cache and the buffer pool. Write-batch
//! commit, memtables, compaction scheduling and the version set are external
//! collaborators and live outside this crate.

pub mod cache;
pub mod comparer;
pub mod error;
pub mod filter;
pub mod journal;
pub mod key;
pub mod options;
pub mod snapshot;
pub mod sstable;
pub mod storage;
pub mod util;

pub use error::{Error, Result};
