//! Single-writer / many-reader snapshot publication.
//!
//! [`AtomicHandle`] publishes an immutable value by swapping a
//! reference-counted pointer. Readers on RT threads take a snapshot with
//! one atomic load and never block the writer; a snapshot stays valid for
//! as long as the reader holds it, regardless of later stores.
//!
//! The handle itself is pinned: it is neither `Clone` nor copyable. Only
//! the *contents* flow between threads.

use std::sync::Arc;

use arc_swap::ArcSwap;

/// Atomically swappable snapshot of an immutable `T`.
pub struct AtomicHandle<T> {
    inner: ArcSwap<T>,
}

impl<T: std::fmt::Debug> std::fmt::Debug for AtomicHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("AtomicHandle").field(&**self.inner.load()).finish()
    }
}

impl<T> AtomicHandle<T> {
    /// Create a handle holding `value` as the first snapshot.
    pub fn new(value: T) -> Self {
        Self {
            inner: ArcSwap::from_pointee(value),
        }
    }

    /// Publish a new snapshot, replacing the current one.
    ///
    /// Readers holding the previous snapshot keep it alive until they drop
    /// their `Arc`.
    pub fn store(&self, value: T) {
        self.inner.store(Arc::new(value));
    }

    /// Take the current snapshot.
    pub fn load(&self) -> Arc<T> {
        self.inner.load_full()
    }
}

impl<T: Clone> AtomicHandle<T> {
    /// Clone the current snapshot's contents.
    pub fn get(&self) -> T {
        T::clone(&self.inner.load())
    }
}

impl<T: Default> Default for AtomicHandle<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_replaces_snapshot() {
        let handle = AtomicHandle::new(String::from("empty_init"));
        assert_eq!(*handle.load(), "empty_init");
        handle.store(String::from("pdstand"));
        assert_eq!(handle.get(), "pdstand");
    }

    #[test]
    fn old_snapshot_outlives_store() {
        let handle = AtomicHandle::new(vec![1, 2, 3]);
        let before = handle.load();
        handle.store(vec![4, 5]);
        assert_eq!(*before, vec![1, 2, 3]);
        assert_eq!(*handle.load(), vec![4, 5]);
    }

    #[test]
    fn concurrent_readers_never_observe_torn_values() {
        let handle = Arc::new(AtomicHandle::new((0u64, 0u64)));
        let writer = {
            let handle = Arc::clone(&handle);
            std::thread::spawn(move || {
                for i in 1..=1000u64 {
                    handle.store((i, i));
                }
            })
        };
        let reader = {
            let handle = Arc::clone(&handle);
            std::thread::spawn(move || {
                for _ in 0..1000 {
                    let snap = handle.load();
                    assert_eq!(snap.0, snap.1);
                }
            })
        };
        writer.join().unwrap();
        reader.join().unwrap();
    }
}
