//! Versioned snapshot holders for live-editable state
//!
//! Every table an operator can edit at runtime (ACL, policy, pools, rules,
//! backends, dynamic blocks) is wrapped in a `Holder<T>`. Readers grab an
//! immutable snapshot once per request with a lock-free load; writers clone
//! the current value, mutate the clone and publish it atomically. A reader
//! that obtained snapshot S keeps observing S intact regardless of
//! concurrent publishes.
//!
//! ```text
//! Query path  -> Holder::load()  -> ArcSwap::load()   (lock-free)
//! Operator    -> Holder::modify() -> clone + mutate + ArcSwap::store()
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::{ArcSwap, Guard};
use parking_lot::Mutex;

/// A published, immutable snapshot holder.
///
/// # Example
///
/// ```
/// use dnslb::holder::Holder;
///
/// let holder = Holder::new(vec![1, 2, 3]);
/// let before = holder.load();
/// holder.modify(|v| v.push(4));
/// // the old snapshot is unaffected
/// assert_eq!(before.len(), 3);
/// assert_eq!(holder.load().len(), 4);
/// assert_eq!(holder.generation(), 1);
/// ```
#[derive(Debug)]
pub struct Holder<T> {
    current: ArcSwap<T>,
    // serializes writers; readers never touch it
    write_lock: Mutex<()>,
    generation: AtomicU64,
}

impl<T> Holder<T> {
    /// Wrap an initial value.
    pub fn new(value: T) -> Self {
        Self {
            current: ArcSwap::from_pointee(value),
            write_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
        }
    }

    /// Lock-free snapshot for the duration of the guard.
    pub fn load(&self) -> Guard<Arc<T>> {
        self.current.load()
    }

    /// Lock-free snapshot as an owned `Arc`.
    pub fn snapshot(&self) -> Arc<T> {
        self.current.load_full()
    }

    /// Replace the published value wholesale.
    pub fn publish(&self, value: T) {
        let _w = self.write_lock.lock();
        self.current.store(Arc::new(value));
        self.generation.fetch_add(1, Ordering::Release);
    }

    /// Number of publishes since creation.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}

impl<T: Clone> Holder<T> {
    /// Clone the current value, apply `mutate`, publish the result.
    ///
    /// Writers are serialized; concurrent readers keep their snapshots.
    pub fn modify<R>(&self, mutate: impl FnOnce(&mut T) -> R) -> R {
        let _w = self.write_lock.lock();
        let mut next = T::clone(&self.current.load());
        let result = mutate(&mut next);
        self.current.store(Arc::new(next));
        self.generation.fetch_add(1, Ordering::Release);
        result
    }
}

impl<T: Default> Default for Holder<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}
