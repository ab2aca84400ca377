//! Size-classed byte-buffer recycler.
//!
//! Block reads and decompression churn through short-lived buffers of a few
//! recurring sizes. The pool keeps a bounded free list per power-of-two size
//! class so those allocations are recycled instead of hitting the allocator
//! on every read. The pool is optional everywhere it is consumed; callers
//! must behave identically when handed a fresh allocation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

const MIN_CLASS_SHIFT: u32 = 9; // 512 B
const MAX_CLASS_SHIFT: u32 = 22; // 4 MiB
const NUM_CLASSES: usize = (MAX_CLASS_SHIFT - MIN_CLASS_SHIFT + 1) as usize;
const MAX_FREE_PER_CLASS: usize = 32;

/// Thread-safe buffer recycler sharded by size class.
pub struct BufferPool {
    shards: Vec<Mutex<Vec<Vec<u8>>>>,
    gets: AtomicUsize,
    hits: AtomicUsize,
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            shards: (0..NUM_CLASSES).map(|_| Mutex::new(Vec::new())).collect(),
            gets: AtomicUsize::new(0),
            hits: AtomicUsize::new(0),
        }
    }

    /// Returns a zeroed buffer of length `n` with capacity at least `n`.
    pub fn get(&self, n: usize) -> Vec<u8> {
        self.gets.fetch_add(1, Ordering::Relaxed);
        if let Some(class) = class_for_len(n) {
            if let Ok(mut shard) = self.shards[class].lock() {
                if let Some(mut buf) = shard.pop() {
                    drop(shard);
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    buf.clear();
                    buf.resize(n, 0);
                    return buf;
                }
            }
        }
        vec![0; n]
    }

    /// Recycles a buffer. The buffer is filed under the largest class its
    /// capacity fully covers; a buffer larger than the top class rounds down
    /// into it and is kept. Only buffers below the smallest class are
    /// dropped.
    pub fn put(&self, buf: Vec<u8>) {
        let Some(class) = class_for_cap(buf.capacity()) else {
            return;
        };
        if let Ok(mut shard) = self.shards[class].lock() {
            if shard.len() < MAX_FREE_PER_CLASS {
                shard.push(buf);
            }
        }
    }

    /// `(gets, hits)` counters since creation.
    pub fn stats(&self) -> (usize, usize) {
        (
            self.gets.load(Ordering::Relaxed),
            self.hits.load(Ordering::Relaxed),
        )
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Smallest class whose buffers can hold `n` bytes.
fn class_for_len(n: usize) -> Option<usize> {
    if n == 0 {
        return None;
    }
    let shift = usize::BITS - (n - 1).leading_zeros();
    let shift = shift.max(MIN_CLASS_SHIFT);
    if shift > MAX_CLASS_SHIFT {
        return None;
    }
    Some((shift - MIN_CLASS_SHIFT) as usize)
}

/// Largest class fully covered by a buffer of capacity `cap`.
fn class_for_cap(cap: usize) -> Option<usize> {
    if cap < (1 << MIN_CLASS_SHIFT) {
        return None;
    }
    let shift = (usize::BITS - 1 - cap.leading_zeros()).min(MAX_CLASS_SHIFT);
    Some((shift - MIN_CLASS_SHIFT) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_get_returns_zeroed_len() {
        let pool = BufferPool::new();
        let buf = pool.get(1000);
        assert_eq!(buf.len(), 1000);
        assert!(buf.iter().all(|&b| b == 0));
        assert!(buf.capacity() >= 1000);
    }

    #[test]
    fn test_recycles_within_class() {
        let pool = BufferPool::new();
        let mut buf = pool.get(4096);
        buf[0] = 0xaa;
        let cap = buf.capacity();
        pool.put(buf);

        let buf = pool.get(4096);
        assert_eq!(buf.capacity(), cap);
        // Recycled contents are re-zeroed to the requested length.
        assert_eq!(buf[0], 0);
        let (gets, hits) = pool.stats();
        assert_eq!(gets, 2);
        assert_eq!(hits, 1);
    }

    #[test]
    fn test_oversized_put_rounds_down() {
        let pool = BufferPool::new();
        // Capacity 3000 rounds down to the 2048 class; a 2048-byte get can
        // then reuse it, while a 4096-byte get cannot.
        pool.put(Vec::with_capacity(3000));
        let buf = pool.get(2048);
        assert!(buf.capacity() >= 2048);
        let (_, hits) = pool.stats();
        assert_eq!(hits, 1);
    }

    #[test]
    fn test_tiny_buffers_dropped() {
        let pool = BufferPool::new();
        pool.put(Vec::with_capacity(16));
        let _ = pool.get(16);
        let (_, hits) = pool.stats();
        assert_eq!(hits, 0);
    }

    #[test]
    fn test_huge_buffer_rounds_into_top_class() {
        let pool = BufferPool::new();
        // Twice the top class size; kept, filed under the top class.
        pool.put(Vec::with_capacity(1 << 23));
        let buf = pool.get(1 << 22);
        assert_eq!(buf.len(), 1 << 22);
        assert!(buf.capacity() >= 1 << 23);
        let (_, hits) = pool.stats();
        assert_eq!(hits, 1);
    }

    #[test]
    fn test_concurrent_get_put() {
        let pool = Arc::new(BufferPool::new());
        let mut handles = vec![];
        for _ in 0..8 {
            let pool = pool.clone();
            handles.push(thread::spawn(move || {
                for i in 1..200usize {
                    let buf = pool.get(i * 17);
                    assert_eq!(buf.len(), i * 17);
                    pool.put(buf);
                }
            }));
        }
        for h in handles {
            h.join().expect("thread panicked");
        }
    }
}
