//! Reusable byte buffers for hot encode paths
//!
//! Buffers are only ever lent to a closure: [`BufferPool::with_buffer`]
//! hands out a cleared `Vec<u8>` and takes it back when the closure
//! returns, so a pooled buffer cannot outlive the call that borrowed it.
//!
//! Buffers are grouped into power-of-two size classes. Each class keeps a
//! bounded free list; anything beyond that bound is simply dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Smallest size class handed out (bytes).
const MIN_CLASS_BYTES: usize = 64;

/// Number of size classes: 64B .. 64B << (CLASSES - 1) = 2MB.
const CLASSES: usize = 16;

/// Maximum idle buffers retained per size class.
const MAX_PER_CLASS: usize = 32;

/// Pool of reusable byte buffers, cheap to clone and share between shards.
#[derive(Clone, Default)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

#[derive(Default)]
struct PoolInner {
    classes: [Mutex<Vec<Vec<u8>>>; CLASSES],
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPoolStats {
    /// Borrows satisfied by a pooled buffer
    pub hits: u64,
    /// Borrows that had to allocate
    pub misses: u64,
    /// Buffers currently idle in the pool
    pub pooled: usize,
}

impl BufferPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Lend a cleared buffer with at least `min_capacity` bytes of capacity
    /// to `f`, then return it to the pool.
    pub fn with_buffer<R>(&self, min_capacity: usize, f: impl FnOnce(&mut Vec<u8>) -> R) -> R {
        let class = size_class(min_capacity);
        let mut buf = match class {
            Some(idx) => self.take(idx, min_capacity),
            None => {
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                Vec::with_capacity(min_capacity)
            }
        };

        let result = f(&mut buf);

        // Filed under the largest class its capacity covers, so every
        // pooled buffer holds at least its class size.
        if let Some(idx) = floor_class(buf.capacity()).filter(|_| class.is_some()) {
            buf.clear();
            let mut free = self.inner.classes[idx].lock();
            if free.len() < MAX_PER_CLASS {
                free.push(buf);
            }
        }
        result
    }

    /// Copy `bytes` into a pooled buffer and lend it to `f`.
    pub fn with_copy<R>(&self, bytes: &[u8], f: impl FnOnce(&mut Vec<u8>) -> R) -> R {
        self.with_buffer(bytes.len(), |buf| {
            buf.extend_from_slice(bytes);
            f(buf)
        })
    }

    /// Current counters.
    pub fn stats(&self) -> BufferPoolStats {
        BufferPoolStats {
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            pooled: self.inner.classes.iter().map(|c| c.lock().len()).sum(),
        }
    }

    fn take(&self, idx: usize, min_capacity: usize) -> Vec<u8> {
        let pooled = self.inner.classes[idx].lock().pop();
        match pooled {
            Some(buf) => {
                self.inner.hits.fetch_add(1, Ordering::Relaxed);
                buf
            }
            None => {
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                Vec::with_capacity(class_bytes(idx).max(min_capacity))
            }
        }
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool").field("stats", &self.stats()).finish()
    }
}

fn class_bytes(idx: usize) -> usize {
    MIN_CLASS_BYTES << idx
}

/// Size class whose buffers are at least `capacity` bytes, if pooled at all.
fn size_class(capacity: usize) -> Option<usize> {
    let rounded = capacity.max(MIN_CLASS_BYTES).checked_next_power_of_two()?;
    let idx = (rounded / MIN_CLASS_BYTES).trailing_zeros() as usize;
    (idx < CLASSES).then_some(idx)
}

/// Largest size class whose size `capacity` covers.
fn floor_class(capacity: usize) -> Option<usize> {
    if capacity < MIN_CLASS_BYTES {
        return None;
    }
    let idx = (capacity / MIN_CLASS_BYTES).ilog2() as usize;
    Some(idx.min(CLASSES - 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_classes() {
        assert_eq!(size_class(0), Some(0));
        assert_eq!(size_class(64), Some(0));
        assert_eq!(size_class(65), Some(1));
        assert_eq!(size_class(511), Some(3));
        assert_eq!(size_class(2 * 1024 * 1024), Some(15));
        assert_eq!(size_class(2 * 1024 * 1024 + 1), None);
    }

    #[test]
    fn test_floor_classes() {
        assert_eq!(floor_class(63), None);
        assert_eq!(floor_class(64), Some(0));
        assert_eq!(floor_class(127), Some(0));
        assert_eq!(floor_class(128), Some(1));
        assert_eq!(floor_class(64 * 1024 * 1024), Some(CLASSES - 1));
    }

    #[test]
    fn test_grown_buffer_never_undersized() {
        let pool = BufferPool::new();
        pool.with_buffer(64, |buf| buf.reserve_exact(100));
        assert_eq!(pool.stats().pooled, 1);

        pool.with_buffer(128, |buf| assert!(buf.capacity() >= 128));
        pool.with_buffer(64, |buf| assert!(buf.capacity() >= 100));
        assert_eq!(pool.stats().hits, 1);
    }

    #[test]
    fn test_buffer_is_reused() {
        let pool = BufferPool::new();
        let first = pool.with_buffer(100, |buf| {
            buf.extend_from_slice(b"hello");
            buf.capacity()
        });
        let stats = pool.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.pooled, 1);

        let second = pool.with_buffer(100, |buf| {
            assert!(buf.is_empty(), "buffer must be cleared before reuse");
            buf.capacity()
        });
        assert_eq!(first, second);
        assert_eq!(pool.stats().hits, 1);
    }

    #[test]
    fn test_oversized_requests_are_not_pooled() {
        let pool = BufferPool::new();
        pool.with_buffer(4 * 1024 * 1024, |buf| assert!(buf.capacity() >= 4 * 1024 * 1024));
        assert_eq!(pool.stats().pooled, 0);
    }

    #[test]
    fn test_with_copy() {
        let pool = BufferPool::new();
        let len = pool.with_copy(b"abc", |buf| {
            buf.push(b'd');
            buf.len()
        });
        assert_eq!(len, 4);
    }
}
