use core::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;
pub const DEFAULT_MAX_IDLE: usize = 64;

/// A free list of fixed-size scratch buffers, shared between concurrent exports.
///
/// [`acquire`](Self::acquire) never fails: an empty pool allocates a fresh buffer.
/// Buffers go back to the pool when the returned [`PooledBuffer`] is dropped,
/// unless `max_idle` buffers are already waiting, in which case they are freed.
pub struct BufferPool {
    buffer_size: usize,
    max_idle: usize,
    free: Mutex<Vec<Box<[u8]>>>,

    acquired: AtomicU64,
    released: AtomicU64,
    allocated: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub acquired: u64,
    pub released: u64,
    pub allocated: u64,
    pub idle: usize,
}

impl PoolStats {
    /// Buffers currently handed out and not yet released.
    pub fn outstanding(&self) -> u64 {
        self.acquired.saturating_sub(self.released)
    }
}

impl BufferPool {
    pub fn new(buffer_size: usize, max_idle: usize) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
            max_idle,
            free: Mutex::new(Vec::with_capacity(max_idle)),

            acquired: AtomicU64::new(0),
            released: AtomicU64::new(0),
            allocated: AtomicU64::new(0),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn acquire(&self) -> PooledBuffer<'_> {
        self.acquired.fetch_add(1, Ordering::Release);

        let recycled = self.free_list().pop();
        let buf = recycled.unwrap_or_else(|| {
            self.allocated.fetch_add(1, Ordering::Relaxed);
            vec![0; self.buffer_size].into_boxed_slice()
        });

        PooledBuffer {
            pool: self,
            buf: Some(buf),
        }
    }

    fn release(&self, buf: Box<[u8]>) {
        self.released.fetch_add(1, Ordering::Release);

        let mut free = self.free_list();
        if free.len() < self.max_idle {
            free.push(buf);
        }
    }

    pub fn stats(&self) -> PoolStats {
        // `released` first, so a concurrent acquire/release pair cannot make it exceed `acquired`
        let released = self.released.load(Ordering::Acquire);
        PoolStats {
            acquired: self.acquired.load(Ordering::Acquire),
            released,
            allocated: self.allocated.load(Ordering::Relaxed),
            idle: self.free_list().len(),
        }
    }

    // release runs inside `Drop`, so a poisoned lock must not turn into a second panic
    fn free_list(&self) -> MutexGuard<'_, Vec<Box<[u8]>>> {
        self.free.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE, DEFAULT_MAX_IDLE)
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.buffer_size)
            .field("max_idle", &self.max_idle)
            .field("stats", &self.stats())
            .finish()
    }
}

/// A buffer on loan from a [`BufferPool`], returned to it on drop.
pub struct PooledBuffer<'pool> {
    pool: &'pool BufferPool,
    buf: Option<Box<[u8]>>,
}

impl Deref for PooledBuffer<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or_default()
    }
}

impl DerefMut for PooledBuffer<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or_default()
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}

impl fmt::Debug for PooledBuffer<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PooledBuffer({} bytes)", self.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuses_released_buffers() {
        let pool = BufferPool::new(16, 4);

        {
            let mut buf = pool.acquire();
            assert_eq!(buf.len(), 16);
            buf[0] = 42;
        }
        {
            let buf = pool.acquire();
            assert_eq!(buf.len(), 16);
        }

        let stats = pool.stats();
        assert_eq!(stats.acquired, 2);
        assert_eq!(stats.released, 2);
        assert_eq!(stats.allocated, 1);
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.outstanding(), 0);
    }

    #[test]
    fn allocates_when_empty_and_caps_idle_buffers() {
        let pool = BufferPool::new(8, 2);

        let held: Vec<_> = (0..5).map(|_| pool.acquire()).collect();
        assert_eq!(pool.stats().allocated, 5);
        assert_eq!(pool.stats().outstanding(), 5);
        drop(held);

        let stats = pool.stats();
        assert_eq!(stats.released, 5);
        assert_eq!(stats.idle, 2);
    }

    #[test]
    fn concurrent_acquire_and_release() {
        let pool = BufferPool::new(64, 8);

        std::thread::scope(|s| {
            for t in 0..8u8 {
                let pool = &pool;
                s.spawn(move || {
                    for _ in 0..100 {
                        let mut buf = pool.acquire();
                        buf.fill(t);
                        assert!(buf.iter().all(|b| *b == t));
                    }
                });
            }
        });

        let stats = pool.stats();
        assert_eq!(stats.acquired, 800);
        assert_eq!(stats.released, 800);
        assert!(stats.allocated <= 8);
    }

    #[test]
    fn stats_never_see_more_releases_than_acquires() {
        let pool = BufferPool::new(8, 2);
        let done = std::sync::atomic::AtomicBool::new(false);

        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..2000 {
                        drop(pool.acquire());
                    }
                });
            }
            s.spawn(|| {
                while !done.load(Ordering::Relaxed) {
                    let stats = pool.stats();
                    assert!(stats.released <= stats.acquired, "{stats:?}");
                }
            });
            s.spawn(|| {
                while pool.stats().acquired < 8000 {
                    std::thread::yield_now();
                }
                done.store(true, Ordering::Relaxed);
            });
        });

        assert_eq!(pool.stats().outstanding(), 0);
        let skewed = PoolStats {
            acquired: 1,
            released: 2,
            ..PoolStats::default()
        };
        assert_eq!(skewed.outstanding(), 0);
    }
}
