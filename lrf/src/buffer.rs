//! Reusable byte buffers bucketed by power-of-two capacity, so the hot read
//! and write paths do not hammer the allocator with megabyte-sized vectors.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Smallest bucket, 1 KiB.
const MIN_CLASS: u32 = 10;
/// Largest bucket, 16 MiB. Requests above this are served unpooled.
const MAX_CLASS: u32 = 24;
/// Number of size classes.
const CLASS_COUNT: usize = (MAX_CLASS - MIN_CLASS + 1) as usize;
/// Buffers kept per bucket; releases beyond this are dropped.
const BUCKET_CAP: usize = 32;

/// A sharded pool of byte buffers. Acquired buffers have a logical length of
/// zero and a capacity of at least the requested size; callers must not
/// assume anything about reused backing memory.
pub struct BufferPool {
    buckets: [Mutex<Vec<Vec<u8>>>; CLASS_COUNT],
    acquired: AtomicU64,
    reused: AtomicU64,
}

impl BufferPool {

    pub fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| Mutex::new(Vec::new())),
            acquired: AtomicU64::new(0),
            reused: AtomicU64::new(0),
        }
    }

    /// Size class of a request, or none if it is too large to pool.
    fn class_of(size: usize) -> Option<usize> {
        let bits = usize::BITS - size.saturating_sub(1).leading_zeros();
        let class = bits.max(MIN_CLASS);
        (class <= MAX_CLASS).then(|| (class - MIN_CLASS) as usize)
    }

    /// Acquire a buffer with capacity for at least `size` bytes.
    pub fn acquire(&self, size: usize) -> Vec<u8> {
        self.acquired.fetch_add(1, Ordering::Relaxed);
        if let Some(class) = Self::class_of(size) {
            if let Some(mut buf) = self.buckets[class].lock().pop() {
                self.reused.fetch_add(1, Ordering::Relaxed);
                buf.clear();
                return buf;
            }
            Vec::with_capacity(1usize << (class as u32 + MIN_CLASS))
        } else {
            Vec::with_capacity(size)
        }
    }

    /// Return a buffer to its bucket. Oversized or overflowing buffers are
    /// simply dropped.
    pub fn release(&self, buf: Vec<u8>) {
        if let Some(class) = Self::class_of(buf.capacity()) {
            // Only pool buffers that still match their class, a grown vector
            // would lie about its bucket.
            if buf.capacity() == 1usize << (class as u32 + MIN_CLASS) {
                let mut bucket = self.buckets[class].lock();
                if bucket.len() < BUCKET_CAP {
                    bucket.push(buf);
                }
            }
        }
    }

    /// Fraction of acquisitions served from the pool, for diagnostics.
    pub fn reuse_ratio(&self) -> f64 {
        let acquired = self.acquired.load(Ordering::Relaxed);
        if acquired == 0 {
            return 0.0;
        }
        self.reused.load(Ordering::Relaxed) as f64 / acquired as f64
    }

}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}
