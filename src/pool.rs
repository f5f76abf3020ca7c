//! Buffer pool
//!
//! Connections borrow read buffers from a shared pool instead of allocating
//! one per read. Buffers are bucketed by capacity; a bucket holds at most
//! `max_per_bucket` idle buffers and extra releases are simply dropped.

use bytes::BytesMut;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::trace;

/// Idle buffers kept per size when no limit is given
pub const DEFAULT_MAX_PER_BUCKET: usize = 32;

/// Counters exposed for diagnostics and tests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub acquired: usize,
    pub released: usize,
    /// Acquisitions that had to allocate because the bucket was empty
    pub allocated: usize,
}

/// Shared pool of reusable byte buffers
#[derive(Debug)]
pub struct BufferPool {
    buckets: Mutex<HashMap<usize, Vec<BytesMut>>>,
    max_per_bucket: usize,
    acquired: AtomicUsize,
    released: AtomicUsize,
    allocated: AtomicUsize,
}

impl BufferPool {
    pub fn new(max_per_bucket: usize) -> Self {
        BufferPool {
            buckets: Mutex::new(HashMap::new()),
            max_per_bucket,
            acquired: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
            allocated: AtomicUsize::new(0),
        }
    }

    /// An empty buffer with capacity of at least `size`
    pub fn acquire(&self, size: usize) -> BytesMut {
        self.acquired.fetch_add(1, Ordering::Relaxed);
        let reused = self.buckets().get_mut(&size).and_then(Vec::pop);

        match reused {
            Some(buf) => buf,
            None => {
                self.allocated.fetch_add(1, Ordering::Relaxed);
                trace!(size, "pool allocating buffer");
                BytesMut::with_capacity(size)
            }
        }
    }

    /// Return a buffer; its contents are discarded
    pub fn release(&self, mut buf: BytesMut) {
        self.released.fetch_add(1, Ordering::Relaxed);
        buf.clear();
        let capacity = buf.capacity();
        if capacity == 0 {
            return;
        }
        let mut buckets = self.buckets();
        let bucket = buckets.entry(capacity).or_default();
        if bucket.len() < self.max_per_bucket {
            bucket.push(buf);
        }
    }

    /// Idle buffers currently held for `size`
    pub fn idle(&self, size: usize) -> usize {
        self.buckets().get(&size).map(Vec::len).unwrap_or(0)
    }

    // Buckets are never left mid-update, so a poisoned lock is still usable
    fn buckets(&self) -> MutexGuard<'_, HashMap<usize, Vec<BytesMut>>> {
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            acquired: self.acquired.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            allocated: self.allocated.load(Ordering::Relaxed),
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        BufferPool::new(DEFAULT_MAX_PER_BUCKET)
    }
}
