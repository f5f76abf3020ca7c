//! Pending-write accumulator
//!
//! Frames produced while another write is in flight are parked here as
//! encoded chunks and drained in one go by whoever holds the writer next.

use bytes::Bytes;

/// Default number of chunk slots added when the queue grows
pub const DEFAULT_MIN_GROWTH: usize = 16;

/// Ordered queue of encoded frame chunks awaiting a transport write
#[derive(Debug)]
pub struct WriteQueue {
    chunks: Vec<Bytes>,
    min_growth: usize,
    total_bytes: usize,
}

impl WriteQueue {
    pub fn new() -> Self {
        Self::with_min_growth(DEFAULT_MIN_GROWTH)
    }

    /// Create a queue that grows by at least `min_growth` slots at a time
    pub fn with_min_growth(min_growth: usize) -> Self {
        let min_growth = min_growth.max(1);
        WriteQueue {
            chunks: Vec::with_capacity(min_growth),
            min_growth,
            total_bytes: 0,
        }
    }

    /// Append the chunks of one frame; they stay contiguous and in order
    pub fn enqueue(&mut self, chunks: Vec<Bytes>) {
        let free = self.chunks.capacity() - self.chunks.len();
        if chunks.len() > free {
            // reserve_exact keeps growth linear instead of doubling
            self.chunks
                .reserve_exact((chunks.len() - free).max(self.min_growth));
        }
        self.total_bytes += chunks.iter().map(Bytes::len).sum::<usize>();
        self.chunks.extend(chunks);
    }

    /// Move out everything queued since the last drain
    pub fn drain(&mut self) -> Vec<Bytes> {
        self.total_bytes = 0;
        let capacity = self.chunks.capacity().max(self.min_growth);
        std::mem::replace(&mut self.chunks, Vec::with_capacity(capacity))
    }

    /// Number of queued chunks
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Bytes across all queued chunks
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn capacity(&self) -> usize {
        self.chunks.capacity()
    }

    pub fn min_growth(&self) -> usize {
        self.min_growth
    }
}

impl Default for WriteQueue {
    fn default() -> Self {
        Self::new()
    }
}
