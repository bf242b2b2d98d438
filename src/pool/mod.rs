//! Support for pooling packet buffers.

use std::fmt::{self, Display, Formatter};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Represents a pool of fixed-size byte buffers. The pool grows without bound: acquiring
/// never blocks and allocates when no free buffer is available.
#[derive(Debug)]
pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
    size: usize,
    allocations: AtomicUsize,
    reuses: AtomicUsize,
}

impl BufferPool {
    /// Creates a new `BufferPool` whose buffers are `size` bytes long.
    pub fn new(size: usize) -> Arc<BufferPool> {
        Arc::new(BufferPool {
            free: Mutex::new(Vec::new()),
            size,
            allocations: AtomicUsize::new(0),
            reuses: AtomicUsize::new(0),
        })
    }

    /// Takes a zero-filled buffer of the full size from the pool. The buffer returns itself
    /// to the pool when it is dropped.
    pub fn acquire(self: &Arc<Self>) -> PooledBuffer {
        let buffer = self.free.lock().ok().and_then(|mut free| free.pop());
        let buffer = match buffer {
            Some(buffer) => {
                self.reuses.fetch_add(1, Ordering::Relaxed);
                buffer
            }
            None => {
                self.allocations.fetch_add(1, Ordering::Relaxed);
                vec![0u8; self.size]
            }
        };

        PooledBuffer {
            buffer,
            pool: Arc::clone(self),
        }
    }

    fn release(&self, mut buffer: Vec<u8>) {
        buffer.clear();
        buffer.resize(self.size, 0);
        if let Ok(mut free) = self.free.lock() {
            free.push(buffer);
        }
    }

    /// Releases all the pooled memory.
    pub fn drain(&self) {
        if let Ok(mut free) = self.free.lock() {
            free.clear();
            free.shrink_to_fit();
        }
    }

    /// Returns the size of the buffers in the pool.
    pub fn buffer_size(&self) -> usize {
        self.size
    }

    /// Returns the number of free buffers held by the pool.
    pub fn available(&self) -> usize {
        self.free.lock().map(|free| free.len()).unwrap_or(0)
    }

    /// Returns the number of buffers allocated because the pool was empty.
    pub fn allocations(&self) -> usize {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Returns the number of buffers served from the free-list.
    pub fn reuses(&self) -> usize {
        self.reuses.load(Ordering::Relaxed)
    }
}

impl Display for BufferPool {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "{} allocated, {} reused, {} free",
            self.allocations(),
            self.reuses(),
            self.available()
        )
    }
}

/// Represents a buffer taken from a `BufferPool`.
#[derive(Debug)]
pub struct PooledBuffer {
    buffer: Vec<u8>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.buffer
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buffer
    }
}

impl AsRef<[u8]> for PooledBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.buffer
    }
}

impl AsMut<[u8]> for PooledBuffer {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let buffer = std::mem::take(&mut self.buffer);
        self.pool.release(buffer);
    }
}

#[test]
fn pool_acquire_zeroed() {
    let pool = BufferPool::new(1500);
    let mut buffer = pool.acquire();
    assert_eq!(buffer.len(), 1500);
    buffer[0] = 0xff;
    buffer.truncate(10);
    drop(buffer);

    let buffer = pool.acquire();
    assert_eq!(buffer.len(), 1500);
    assert!(buffer.iter().all(|b| *b == 0));
}

#[test]
fn pool_reuse() {
    let pool = BufferPool::new(64);
    let a = pool.acquire();
    let b = pool.acquire();
    assert_eq!(pool.allocations(), 2);
    assert_eq!(pool.available(), 0);

    drop(a);
    drop(b);
    assert_eq!(pool.available(), 2);

    let _c = pool.acquire();
    assert_eq!(pool.allocations(), 2);
    assert_eq!(pool.reuses(), 1);
    assert_eq!(pool.available(), 1);
}

#[test]
fn pool_drain() {
    let pool = BufferPool::new(64);
    drop(pool.acquire());
    drop(pool.acquire());
    assert_eq!(pool.available(), 1);

    pool.drain();
    assert_eq!(pool.available(), 0);

    // Buffers still in flight return after a drain
    let buffer = pool.acquire();
    pool.drain();
    drop(buffer);
    assert_eq!(pool.available(), 1);
}
