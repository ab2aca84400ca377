//! Engine options and the environment-variable loader.
//!
//! Options carry the knobs the read path consults (block layout, checksum
//! strictness, cache and pool toggles, the comparer and filter policies)
//! plus the compaction sizing fields the env loader can override for the
//! compaction collaborator. `LDB_*` environment variables override the
//! defaults at open time; an unparseable value logs a warning and leaves
//! the default in place.

use std::sync::Arc;

use tracing::warn;

use crate::comparer::{BytewiseComparer, Comparer};
use crate::filter::FilterPolicy;

/// Per-block compression applied by the table writer and recognized by the
/// reader. The wire value is the trailer's compression-type byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compression {
    None,
    Snappy,
}

pub const DEFAULT_BLOCK_SIZE: usize = 4096;
pub const DEFAULT_BLOCK_RESTART_INTERVAL: usize = 16;
pub const DEFAULT_BLOCK_CACHE_CAPACITY: usize = 8 * 1024 * 1024;
pub const DEFAULT_FILTER_BASE_LG: u8 = 11;
pub const DEFAULT_COMPACTION_TABLE_SIZE: usize = 2 * 1024 * 1024;
pub const DEFAULT_COMPACTION_TOTAL_SIZE: usize = 10 * 1024 * 1024;

/// Database-wide options. Construct with [`Options::default`] and adjust.
#[derive(Clone)]
pub struct Options {
    /// Key order for every table read or written with these options. Tables
    /// holding internal keys take an [`crate::key::InternalComparer`].
    pub comparer: Arc<dyn Comparer>,

    /// Primary filter policy consulted on reads and used by the writer.
    pub filter: Option<Arc<dyn FilterPolicy>>,

    /// Additional policies a reader will recognize in existing files, for
    /// reading tables written under an older or alternative policy.
    pub alt_filters: Vec<Arc<dyn FilterPolicy>>,

    /// Target uncompressed size of a data block.
    pub block_size: usize,

    /// Entries between restart points in data blocks.
    pub block_restart_interval: usize,

    pub compression: Compression,

    /// One filter is generated per `1 << filter_base_lg` bytes of data.
    pub filter_base_lg: u8,

    pub block_cache_capacity: usize,

    /// Verify data-block checksums on every read, not only index and meta
    /// blocks.
    pub strict_block_checksum: bool,

    pub disable_block_cache: bool,
    pub disable_buffer_pool: bool,
    pub disable_compression: bool,

    // Sizing consumed by the compaction collaborator; carried here because
    // the env loader couples table size and total size.
    pub compaction_table_size: usize,
    pub compaction_table_size_multiplier: f64,
    pub compaction_total_size: usize,
    pub compaction_total_size_multiplier: f64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            comparer: Arc::new(BytewiseComparer),
            filter: None,
            alt_filters: Vec::new(),
            block_size: DEFAULT_BLOCK_SIZE,
            block_restart_interval: DEFAULT_BLOCK_RESTART_INTERVAL,
            compression: Compression::Snappy,
            filter_base_lg: DEFAULT_FILTER_BASE_LG,
            block_cache_capacity: DEFAULT_BLOCK_CACHE_CAPACITY,
            strict_block_checksum: false,
            disable_block_cache: false,
            disable_buffer_pool: false,
            disable_compression: false,
            compaction_table_size: DEFAULT_COMPACTION_TABLE_SIZE,
            compaction_table_size_multiplier: 1.0,
            compaction_total_size: DEFAULT_COMPACTION_TOTAL_SIZE,
            compaction_total_size_multiplier: 10.0,
        }
    }
}

impl Options {
    /// The compression the writer should actually apply.
    pub fn effective_compression(&self) -> Compression {
        if self.disable_compression {
            Compression::None
        } else {
            self.compression
        }
    }

    /// Overrides fields from `LDB_*` environment variables.
    pub fn load_from_env(&mut self) {
        self.load_env_with(|key| std::env::var(key).ok());
    }

    /// Same as [`Options::load_from_env`] with an injectable lookup, so the
    /// parsing rules are testable without mutating process state.
    pub fn load_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        set_usize(&lookup, "LDB_BLOCK_SIZE", &mut self.block_size);
        set_usize(
            &lookup,
            "LDB_BLOCK_RESTART_INTERVAL",
            &mut self.block_restart_interval,
        );
        set_usize(
            &lookup,
            "LDB_BLOCK_CACHE_CAPACITY",
            &mut self.block_cache_capacity,
        );
        set_u8(&lookup, "LDB_FILTER_BASE_LG", &mut self.filter_base_lg);

        let table_size_set = set_usize(
            &lookup,
            "LDB_COMPACTION_TABLE_SIZE",
            &mut self.compaction_table_size,
        );
        set_f64(
            &lookup,
            "LDB_COMPACTION_TABLE_SIZE_MULTIPLIER",
            &mut self.compaction_table_size_multiplier,
        );
        let total_size_set = set_usize(
            &lookup,
            "LDB_COMPACTION_TOTAL_SIZE",
            &mut self.compaction_total_size,
        );
        set_f64(
            &lookup,
            "LDB_COMPACTION_TOTAL_SIZE_MULTIPLIER",
            &mut self.compaction_total_size_multiplier,
        );
        // Table size changed without an explicit total keeps the default
        // 5x ratio between the two.
        if table_size_set && !total_size_set {
            self.compaction_total_size = self.compaction_table_size * 5;
        }

        if lookup("LDB_DISABLE_COMPRESSION").as_deref() == Some("1") {
            self.disable_compression = true;
        }
        set_bool(
            &lookup,
            "LDB_STRICT_BLOCK_CHECKSUM",
            &mut self.strict_block_checksum,
        );
        set_bool(
            &lookup,
            "LDB_DISABLE_BLOCK_CACHE",
            &mut self.disable_block_cache,
        );
        set_bool(
            &lookup,
            "LDB_DISABLE_BUFFER_POOL",
            &mut self.disable_buffer_pool,
        );
    }
}

/// Per-read options.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReadOptions {
    /// Serve from the cache but do not populate it on a miss.
    pub dont_fill_cache: bool,

    /// Iterators may return slices into the block buffer. The caller must
    /// not retain them past iterator release.
    pub dont_copy_buffer: bool,

    /// Verify data-block checksums for this read even when the open-time
    /// option is off.
    pub strict: bool,
}

fn set_usize(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    dest: &mut usize,
) -> bool {
    let Some(raw) = lookup(key) else {
        return false;
    };
    match raw.parse::<usize>() {
        Ok(val) => {
            let changed = *dest != val;
            *dest = val;
            changed
        }
        Err(err) => {
            warn!(key, value = %raw, %err, "unparseable env var, keeping default");
            false
        }
    }
}

fn set_u8(lookup: &impl Fn(&str) -> Option<String>, key: &str, dest: &mut u8) -> bool {
    let Some(raw) = lookup(key) else {
        return false;
    };
    match raw.parse::<u8>() {
        Ok(val) => {
            let changed = *dest != val;
            *dest = val;
            changed
        }
        Err(err) => {
            warn!(key, value = %raw, %err, "unparseable env var, keeping default");
            false
        }
    }
}

fn set_f64(lookup: &impl Fn(&str) -> Option<String>, key: &str, dest: &mut f64) -> bool {
    let Some(raw) = lookup(key) else {
        return false;
    };
    match raw.parse::<f64>() {
        Ok(val) => {
            let changed = *dest != val;
            *dest = val;
            changed
        }
        Err(err) => {
            warn!(key, value = %raw, %err, "unparseable env var, keeping default");
            false
        }
    }
}

fn set_bool(lookup: &impl Fn(&str) -> Option<String>, key: &str, dest: &mut bool) -> bool {
    let Some(raw) = lookup(key) else {
        return false;
    };
    match raw.parse::<bool>() {
        Ok(val) => {
            let changed = *dest != val;
            *dest = val;
            changed
        }
        Err(err) => {
            warn!(key, value = %raw, %err, "unparseable env var, keeping default");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let o = Options::default();
        assert_eq!(o.block_size, 4096);
        assert_eq!(o.block_restart_interval, 16);
        assert_eq!(o.filter_base_lg, 11);
        assert_eq!(o.compaction_total_size, 5 * o.compaction_table_size);
    }

    #[test]
    fn test_env_overrides() {
        let vars = env(&[
            ("LDB_BLOCK_SIZE", "8192"),
            ("LDB_BLOCK_RESTART_INTERVAL", "4"),
            ("LDB_STRICT_BLOCK_CHECKSUM", "true"),
            ("LDB_DISABLE_COMPRESSION", "1"),
        ]);
        let mut o = Options::default();
        o.load_env_with(|k| vars.get(k).cloned());
        assert_eq!(o.block_size, 8192);
        assert_eq!(o.block_restart_interval, 4);
        assert!(o.strict_block_checksum);
        assert_eq!(o.effective_compression(), Compression::None);
    }

    #[test]
    fn test_unparseable_value_keeps_default() {
        let vars = env(&[("LDB_BLOCK_SIZE", "not-a-number")]);
        let mut o = Options::default();
        o.load_env_with(|k| vars.get(k).cloned());
        assert_eq!(o.block_size, DEFAULT_BLOCK_SIZE);
    }

    #[test]
    fn test_table_size_sets_total_ratio() {
        let vars = env(&[("LDB_COMPACTION_TABLE_SIZE", "4194304")]);
        let mut o = Options::default();
        o.load_env_with(|k| vars.get(k).cloned());
        assert_eq!(o.compaction_table_size, 4 * 1024 * 1024);
        assert_eq!(o.compaction_total_size, 20 * 1024 * 1024);

        // An explicit total size wins over the 5x rule.
        let vars = env(&[
            ("LDB_COMPACTION_TABLE_SIZE", "4194304"),
            ("LDB_COMPACTION_TOTAL_SIZE", "41943040"),
        ]);
        let mut o = Options::default();
        o.load_env_with(|k| vars.get(k).cloned());
        assert_eq!(o.compaction_total_size, 40 * 1024 * 1024);
    }
}
