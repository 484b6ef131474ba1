//! Object pools for reset-and-reuse transient allocations.
//!
//! Three things recycle across request boundaries: job-result rendezvous
//! cells, serialization byte buffers, and message scratch vectors. Pools
//! are unbounded best-effort caches; an empty pool allocates on demand.
//! Every acquisition is wrapped in a [`PoolGuard`] so release happens on
//! every exit path, including error and cancellation.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::types::Message;

/// An object that can be wiped back to its zero state before reuse.
pub trait Reusable: Send {
    fn reset(&mut self);

    /// Whether the object may be cached for reuse after release.
    /// Objects still referenced elsewhere must report false so the pool
    /// drops them instead of handing them to a new holder.
    fn recyclable(&self) -> bool {
        true
    }
}

impl Reusable for Vec<u8> {
    fn reset(&mut self) {
        self.clear();
    }
}

impl Reusable for Vec<Message> {
    fn reset(&mut self) {
        self.clear();
    }
}

/// Unbounded cache of reusable objects.
///
/// `acquire` pops a cached object or allocates; `release` resets and
/// returns it. The outstanding counter backs a debug-only double-release
/// check and the acquired/released accounting that callers assert on.
pub struct ObjectPool<T: Reusable> {
    free: Mutex<Vec<T>>,
    factory: Box<dyn Fn() -> T + Send + Sync>,
    acquired: AtomicU64,
    released: AtomicU64,
    outstanding: AtomicI64,
}

impl<T: Reusable> ObjectPool<T> {
    pub fn new(factory: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            factory: Box::new(factory),
            acquired: AtomicU64::new(0),
            released: AtomicU64::new(0),
            outstanding: AtomicI64::new(0),
        }
    }

    pub fn acquire(self: &Arc<Self>) -> PoolGuard<T> {
        let obj = self
            .free
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop()
            .unwrap_or_else(|| (self.factory)());
        self.acquired.fetch_add(1, Ordering::Relaxed);
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        PoolGuard {
            obj: Some(obj),
            pool: Arc::clone(self),
        }
    }

    fn release(&self, mut obj: T) {
        let prev = self.outstanding.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "pool release without matching acquire");
        self.released.fetch_add(1, Ordering::Relaxed);
        if obj.recyclable() {
            obj.reset();
            self.free.lock().unwrap_or_else(|e| e.into_inner()).push(obj);
        }
    }

    /// Total acquisitions since construction.
    pub fn acquired(&self) -> u64 {
        self.acquired.load(Ordering::Relaxed)
    }

    /// Total releases since construction.
    pub fn released(&self) -> u64 {
        self.released.load(Ordering::Relaxed)
    }

    /// Cached objects currently available for reuse.
    pub fn idle(&self) -> usize {
        self.free.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Scoped holder that releases back to its pool on drop.
pub struct PoolGuard<T: Reusable> {
    obj: Option<T>,
    pool: Arc<ObjectPool<T>>,
}

impl<T: Reusable> Deref for PoolGuard<T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.obj.as_ref().expect("pool guard accessed after release")
    }
}

impl<T: Reusable> DerefMut for PoolGuard<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.obj.as_mut().expect("pool guard accessed after release")
    }
}

impl<T: Reusable> Drop for PoolGuard<T> {
    fn drop(&mut self) {
        if let Some(obj) = self.obj.take() {
            self.pool.release(obj);
        }
    }
}

/// Single-shot rendezvous cell: one value in, one value out, then reset.
///
/// Shared as `Arc<ResultCell<T>>` between a worker (sender) and the
/// orchestrator awaiting it. `send` accepts exactly one value per cycle;
/// a second send in the same cycle is refused.
#[derive(Debug)]
pub struct ResultCell<T> {
    slot: Mutex<Option<T>>,
    notify: Notify,
}

impl<T> ResultCell<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    /// Deliver the value. Returns false if the cell already holds one.
    pub fn send(&self, value: T) -> bool {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return false;
        }
        *slot = Some(value);
        drop(slot);
        self.notify.notify_one();
        true
    }

    /// Await and take the value.
    pub async fn recv(&self) -> T {
        loop {
            let notified = self.notify.notified();
            if let Some(v) = self
                .slot
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take()
            {
                return v;
            }
            notified.await;
        }
    }

    fn clear(&self) {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}

impl<T> Default for ResultCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> Reusable for Arc<ResultCell<T>> {
    fn reset(&mut self) {
        self.clear();
    }

    /// A cell is only safe to recycle once the worker side has dropped its
    /// clone; otherwise a stale send could land in the next holder's cycle.
    fn recyclable(&self) -> bool {
        Arc::strong_count(self) == 1
    }
}
