//! Dense ID registry mapping stable integer handles to objects (spec §4.B).

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::RwLock;

/// An opaque, never-zero handle into a [`Registry`]. Handle 0 is reserved
/// and never returned by `insert`, matching `alGenBuffers`/`alGenSources`:
/// an all-zero ID is always invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Id(NonZeroU32);

impl Id {
    pub fn get(self) -> u32 {
        self.0.get()
    }
}

/// Table of live objects, addressed by [`Id`]. Lookups in the mixer take the
/// read lock only (spec §5); inserts/removes (API threads only) take the
/// write lock.
pub struct Registry<T> {
    next: AtomicU32,
    table: RwLock<std::collections::HashMap<u32, T>>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Self {
            next: AtomicU32::new(1),
            table: RwLock::new(std::collections::HashMap::new()),
        }
    }

    /// Allocate a new handle and associate `object` with it.
    pub fn insert(&self, object: T) -> Id {
        let raw = self.next.fetch_add(1, Ordering::Relaxed);
        let mut table = self.table.write();
        table.insert(raw, object);
        // raw started at 1 and only increases, so this is always non-zero.
        Id(NonZeroU32::new(raw).expect("registry ids start at 1"))
    }

    /// Whether `id` currently names a live object (`isBuffer`/`isSource`).
    pub fn contains(&self, id: Id) -> bool {
        self.table.read().contains_key(&id.get())
    }

    /// Run `f` with a read-only view of the object, if it exists.
    pub fn with<R>(&self, id: Id, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.table.read().get(&id.get()).map(f)
    }

    /// Run `f` with a mutable view of the object, if it exists.
    pub fn with_mut<R>(&self, id: Id, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.table.write().get_mut(&id.get()).map(f)
    }

    /// Remove and return the object for `id`, if any. The registry entry is
    /// cleared before the caller's `T` is dropped — the registry is not
    /// responsible for any teardown beyond the mapping itself.
    pub fn remove(&self, id: Id) -> Option<T> {
        self.table.write().remove(&id.get())
    }

    /// A point-in-time snapshot of every live handle. Used by callers that
    /// need to scan the whole table (e.g. the mixer looking for sources
    /// that became Playing since the last period) without holding the
    /// read lock for the whole scan.
    pub fn ids(&self) -> Vec<Id> {
        self.table.read().keys().map(|&raw| Id(NonZeroU32::new(raw).expect("registry ids are never zero"))).collect()
    }

    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_start_at_one_and_never_repeat_while_live() {
        let reg: Registry<u32> = Registry::new();
        let a = reg.insert(10);
        let b = reg.insert(20);
        assert_ne!(a, b);
        assert!(reg.contains(a));
        assert!(reg.contains(b));
        assert_eq!(reg.with(a, |v| *v), Some(10));
    }

    #[test]
    fn removed_ids_are_no_longer_contained() {
        let reg: Registry<u32> = Registry::new();
        let a = reg.insert(1);
        assert!(reg.remove(a).is_some());
        assert!(!reg.contains(a));
        assert!(reg.remove(a).is_none());
    }

    #[test]
    fn ids_snapshots_only_currently_live_handles() {
        let reg: Registry<u32> = Registry::new();
        let a = reg.insert(1);
        let b = reg.insert(2);
        reg.remove(a);
        let ids = reg.ids();
        assert_eq!(ids.len(), 1);
        assert!(ids.contains(&b));
    }

    #[test]
    fn lookup_of_unknown_id_is_none() {
        let reg: Registry<u32> = Registry::new();
        let a = reg.insert(1);
        let b = reg.insert(2);
        reg.remove(a);
        assert_eq!(reg.with(a, |v| *v), None);
        assert_eq!(reg.with(b, |v| *v), Some(2));
    }
}
