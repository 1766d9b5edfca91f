//! Buffer pool for reusing fixed-size byte regions across connections.
//!
//! # Design
//!
//! The pool is a free list guarded by a `parking_lot::Mutex`:
//! - Shared by every connection (`Arc<BufferPool>`), so acquire and recycle
//!   may race from independent reader/writer tasks
//! - The lock is held only to push or pop one buffer
//! - Idle buffers beyond `max_idle` are released to the allocator
//!
//! Debug builds fill recycled buffers with [`POISON`] and lock them, so stale
//! data never leaks into the next lease and mutation of an idle buffer trips
//! an assertion. Release builds skip the fill.
//!
//! # Usage
//!
//! ```
//! use objwire::buffer::BufferPool;
//!
//! let pool = BufferPool::new(4096);
//! let mut buff = pool.acquire();
//! buff.put_slice(b"update");
//! buff.flip();
//! // hand to the send pipeline...
//! pool.recycle(buff);
//! assert_eq!(pool.stats().leased, 0);
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::Buff;

/// Default size of every pooled buffer (8 KiB).
pub const DEFAULT_BUFFER_CAPACITY: usize = 8 * 1024;

/// Default maximum number of idle buffers kept for reuse.
pub const DEFAULT_MAX_IDLE: usize = 1024;

/// Sentinel written over recycled buffers in debug builds.
pub const POISON: u8 = 0xDD;

/// Snapshot of pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Buffers ever allocated by the pool.
    pub allocated: usize,
    /// Buffers sitting in the free list.
    pub idle: usize,
    /// Buffers currently leased out.
    pub leased: usize,
    /// Total `acquire` calls.
    pub acquired: usize,
    /// Total `recycle` calls.
    pub recycled: usize,
}

/// Thread-safe pool of equally sized buffers.
pub struct BufferPool {
    /// Capacity of every buffer handed out.
    capacity: usize,
    /// Maximum idle buffers retained.
    max_idle: usize,
    /// Free list.
    idle: Mutex<Vec<Buff>>,
    allocated: AtomicUsize,
    leased: AtomicUsize,
    acquired: AtomicUsize,
    recycled: AtomicUsize,
}

impl BufferPool {
    /// Create a pool of `capacity`-byte buffers.
    pub fn new(capacity: usize) -> Self {
        Self::with_max_idle(capacity, DEFAULT_MAX_IDLE)
    }

    /// Create a pool that keeps at most `max_idle` buffers around.
    pub fn with_max_idle(capacity: usize, max_idle: usize) -> Self {
        Self {
            capacity,
            max_idle,
            idle: Mutex::new(Vec::new()),
            allocated: AtomicUsize::new(0),
            leased: AtomicUsize::new(0),
            acquired: AtomicUsize::new(0),
            recycled: AtomicUsize::new(0),
        }
    }

    /// Size of buffers produced by this pool.
    #[inline]
    pub fn buffer_capacity(&self) -> usize {
        self.capacity
    }

    /// Lease a buffer ready for writing (`position = 0`, `limit = capacity`).
    pub fn acquire(&self) -> Buff {
        let reused = self.idle.lock().pop();
        let buff = match reused {
            Some(mut buff) => {
                buff.unlock();
                buff
            }
            None => {
                self.allocated.fetch_add(1, Ordering::Relaxed);
                Buff::with_capacity(self.capacity)
            }
        };

        self.acquired.fetch_add(1, Ordering::Relaxed);
        self.leased.fetch_add(1, Ordering::AcqRel);
        buff
    }

    /// Lease a buffer for a receive, with the first `header_reserve` bytes
    /// left free in front of the cursor.
    pub fn acquire_for_receive(&self, header_reserve: usize) -> Buff {
        let mut buff = self.acquire();
        debug_assert!(header_reserve < buff.capacity());
        buff.set_position(header_reserve);
        buff
    }

    /// Return a buffer to the pool.
    ///
    /// The buffer is consumed: it cannot be used again until re-acquired.
    pub fn recycle(&self, mut buff: Buff) {
        let previous = self.leased.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "more buffers recycled than leased");
        if previous == 0 {
            // Keep the counter sane in release builds.
            self.leased.store(0, Ordering::Release);
        }
        self.recycled.fetch_add(1, Ordering::Relaxed);

        if buff.capacity() != self.capacity {
            tracing::debug!(
                capacity = buff.capacity(),
                expected = self.capacity,
                "Dropping foreign buffer on recycle"
            );
            return;
        }

        let poison = if cfg!(debug_assertions) { Some(POISON) } else { None };
        buff.lock(poison);

        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(buff);
        }
    }

    /// Current counters.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            allocated: self.allocated.load(Ordering::Relaxed),
            idle: self.idle.lock().len(),
            leased: self.leased.load(Ordering::Acquire),
            acquired: self.acquired.load(Ordering::Relaxed),
            recycled: self.recycled.load(Ordering::Relaxed),
        }
    }

    /// Run `f` over every idle buffer (for debugging).
    pub fn inspect_idle<F: FnMut(&Buff)>(&self, mut f: F) {
        for buff in self.idle.lock().iter() {
            f(buff);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAPACITY)
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("capacity", &self.capacity)
            .field("stats", &self.stats())
            .finish()
    }
}
