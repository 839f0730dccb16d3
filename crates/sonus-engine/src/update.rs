//! RCU-style update protocol (component L, spec §4.L): application
//! threads stage changes into a pending-update record guarded by a
//! spinlock and raise a dirty flag; once per mixing period the Context
//! drains dirty flags and atomically republishes a snapshot the mixer
//! reads lock-free through a [`sonus_core::SeqLock`].

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, Ordering};

use sonus_core::{SeqLock, Spinlock};

/// One parameter block's update channel. `T` is the full parameter
/// snapshot (e.g. a source's spatial/gain attributes, or the listener
/// transform) copied wholesale on every publish — cheap because these
/// blocks are small fixed-size structs, never buffer data.
pub struct UpdateChannel<T: Copy + Default> {
    spinlock: Spinlock,
    staged: UnsafeCell<T>,
    dirty: AtomicBool,
    published: SeqLock<T>,
}

// SAFETY: `staged` is only ever touched while `spinlock` is held, so
// concurrent `stage` calls are serialized the same way `Spinlock` itself
// requires of its callers.
unsafe impl<T: Copy + Default + Send> Sync for UpdateChannel<T> {}

impl<T: Copy + Default> UpdateChannel<T> {
    pub fn new(initial: T) -> Self {
        Self {
            spinlock: Spinlock::new(),
            staged: UnsafeCell::new(initial),
            dirty: AtomicBool::new(false),
            published: SeqLock::new(initial),
        }
    }

    /// Called from an application thread: transcribe a change into the
    /// pending-update record and raise the dirty flag (spec §4.L step 1-2).
    pub fn stage(&self, edit: impl FnOnce(&mut T)) {
        let _guard = self.spinlock.lock();
        // SAFETY: the spinlock guard serializes all access to `staged`.
        edit(unsafe { &mut *self.staged.get() });
        self.dirty.store(true, Ordering::Release);
    }

    /// Called once per mixing period, before voices are processed (spec
    /// §4.H step 1 / §4.L): if dirty, atomically swap the live snapshot
    /// for the staged one. Returns whether a publish occurred.
    pub fn publish_if_dirty(&self) -> bool {
        if self.dirty.swap(false, Ordering::AcqRel) {
            let snapshot = {
                let _guard = self.spinlock.lock();
                // SAFETY: guarded by the spinlock, `T: Copy` so this is a
                // plain bitwise copy out of the cell.
                unsafe { *self.staged.get() }
            };
            self.published.store(snapshot);
            true
        } else {
            false
        }
    }

    /// Read the mixer-visible snapshot. Never blocks on an application
    /// thread's lock.
    pub fn snapshot(&self) -> T {
        self.published.load()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, Default, PartialEq)]
    struct Params {
        gain: u32,
    }

    #[test]
    fn staged_changes_are_invisible_until_published() {
        let chan = UpdateChannel::new(Params { gain: 1 });
        chan.stage(|p| p.gain = 5);
        assert_eq!(chan.snapshot().gain, 1);
        assert!(chan.publish_if_dirty());
        assert_eq!(chan.snapshot().gain, 5);
    }

    #[test]
    fn publish_is_a_no_op_when_not_dirty() {
        let chan = UpdateChannel::new(Params { gain: 1 });
        assert!(!chan.publish_if_dirty());
    }

    #[test]
    fn multiple_stages_between_publishes_coalesce_into_one_update() {
        let chan = UpdateChannel::new(Params { gain: 0 });
        chan.stage(|p| p.gain = 1);
        chan.stage(|p| p.gain = 2);
        chan.stage(|p| p.gain = 3);
        assert!(chan.publish_if_dirty());
        assert_eq!(chan.snapshot().gain, 3);
        assert!(!chan.publish_if_dirty());
    }
}
