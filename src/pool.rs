//! Bounded object pools for hot-path reuse.
//!
//! The transport recycles four kinds of objects across messages: receive
//! buffers, per-connection decoder states, reply latches, and handoff
//! records. [`Pool`] is the shared free-list behind all four.
//!
//! # Design
//!
//! A pool is a soft cache, not a hard cap:
//! - `acquire` pops from the free list, or calls the factory when empty.
//!   It never blocks.
//! - `release` runs the reset hook, then retains the instance only while
//!   the free list is below capacity; past that the instance is dropped.
//!
//! # Example
//!
//! ```
//! use cachewire::pool::Pool;
//!
//! let pool: Pool<Vec<u8>> = Pool::new(4, || vec![0u8; 256]);
//! let buf = pool.acquire();
//! assert_eq!(buf.len(), 256);
//! pool.release(buf);
//! assert_eq!(pool.available(), 1);
//! ```

use std::sync::Mutex;

type Factory<T> = Box<dyn Fn() -> T + Send + Sync>;
type Reset<T> = Box<dyn Fn(&mut T) + Send + Sync>;

/// Fixed-capacity LIFO free list of reusable objects.
///
/// Thread-safe; the free list is guarded by its own mutex and operations
/// never suspend, so the pool can be shared across readers, the decode
/// worker, and caller tasks alike.
pub struct Pool<T> {
    slots: Mutex<Vec<T>>,
    capacity: usize,
    factory: Factory<T>,
    reset: Option<Reset<T>>,
}

impl<T> Pool<T> {
    /// Create an empty pool that retains at most `capacity` instances.
    pub fn new<F>(capacity: usize, factory: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self {
            slots: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
            factory: Box::new(factory),
            reset: None,
        }
    }

    /// Create a pool whose `reset` hook runs on every release, before the
    /// instance re-enters the free list.
    pub fn with_reset<F, R>(capacity: usize, factory: F, reset: R) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
        R: Fn(&mut T) + Send + Sync + 'static,
    {
        Self {
            slots: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
            factory: Box::new(factory),
            reset: Some(Box::new(reset)),
        }
    }

    /// Pre-populate the free list with `count` fresh instances.
    ///
    /// `count` is clamped to the pool capacity.
    pub fn prefill(self, count: usize) -> Self {
        {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            let n = count.min(self.capacity);
            while slots.len() < n {
                slots.push((self.factory)());
            }
        }
        self
    }

    /// Take an instance from the pool, constructing a new one if the free
    /// list is empty.
    pub fn acquire(&self) -> T {
        let pooled = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots.pop()
        };
        pooled.unwrap_or_else(|| (self.factory)())
    }

    /// Return an instance to the pool.
    ///
    /// The reset hook runs first; if the free list is already at capacity
    /// the instance is dropped instead of retained.
    pub fn release(&self, mut item: T) {
        if let Some(reset) = &self.reset {
            reset(&mut item);
        }
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        if slots.len() < self.capacity {
            slots.push(item);
        }
    }

    /// Number of instances currently sitting in the free list.
    pub fn available(&self) -> usize {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Maximum number of retained instances.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop every pooled instance. Used by permanent teardown.
    pub fn drain(&self) {
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

impl<T> std::fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("available", &self.available())
            .field("capacity", &self.capacity)
            .finish()
    }
}
