//! Sequence-locked snapshot and a bounded-time spinlock (spec §4.A, §4.L).
//!
//! These are the two synchronization primitives the mixer thread is allowed
//! to touch (spec §5): the spinlock guards a source's pending-update record
//! while an API thread mutates it, and the seqlock publishes the live
//! parameter block pointer that the mixer reads every period without ever
//! blocking on an application thread.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// A single `T` published by one writer and read by many readers without
/// taking a lock on the read side. Readers retry if they observe a write in
/// progress (odd sequence number) or torn across their read.
pub struct SeqLock<T: Copy> {
    seq: AtomicU64,
    value: UnsafeCell<T>,
}

// SAFETY: reads and writes are only ever exposed through `load`/`store`,
// which enforce the seqlock protocol; `T: Copy` means no partial moves can
// be observed mid-torn-read beyond what the retry loop already handles.
unsafe impl<T: Copy + Send> Sync for SeqLock<T> {}

impl<T: Copy> SeqLock<T> {
    pub const fn new(initial: T) -> Self {
        Self {
            seq: AtomicU64::new(0),
            value: UnsafeCell::new(initial),
        }
    }

    /// Publish a new value. Callers (application threads) serialize calls
    /// to `store` themselves (e.g. under the source's spinlock) — this is
    /// not a multi-writer primitive.
    pub fn store(&self, new_value: T) {
        let seq = self.seq.load(Ordering::Relaxed);
        self.seq.store(seq.wrapping_add(1), Ordering::Release);
        // SAFETY: odd sequence number signals readers to retry; no reader
        // observes this write as a torn value because it re-checks seq.
        unsafe { *self.value.get() = new_value };
        self.seq.store(seq.wrapping_add(2), Ordering::Release);
    }

    /// Read the most recently published value. Bounded retry: the mixer
    /// thread never observes a half-written block.
    pub fn load(&self) -> T {
        loop {
            let s1 = self.seq.load(Ordering::Acquire);
            if s1 & 1 != 0 {
                std::hint::spin_loop();
                continue;
            }
            // SAFETY: seq was even before and we re-check it's unchanged
            // after, so this read is guaranteed not torn.
            let value = unsafe { *self.value.get() };
            let s2 = self.seq.load(Ordering::Acquire);
            if s1 == s2 {
                return value;
            }
        }
    }
}

/// A spinlock held only for bounded-time critical sections (spec §5): the
/// mixer thread may take this, but never a lock an application thread could
/// hold across an unbounded operation (allocation, syscall, page fault).
#[derive(Default)]
pub struct Spinlock {
    locked: AtomicBool,
}

impl Spinlock {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    pub fn lock(&self) -> SpinGuard<'_> {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
        SpinGuard { lock: self }
    }
}

pub struct SpinGuard<'a> {
    lock: &'a Spinlock,
}

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn seqlock_round_trips_single_threaded() {
        let lock = SeqLock::new(0u32);
        assert_eq!(lock.load(), 0);
        lock.store(42);
        assert_eq!(lock.load(), 42);
    }

    #[test]
    fn seqlock_survives_concurrent_writer() {
        let lock = Arc::new(SeqLock::new(0u64));
        let writer_lock = lock.clone();
        let writer = thread::spawn(move || {
            for i in 1..=10_000u64 {
                writer_lock.store(i);
            }
        });
        for _ in 0..10_000 {
            let v = lock.load();
            assert!(v <= 10_000);
        }
        writer.join().unwrap();
        assert_eq!(lock.load(), 10_000);
    }

    #[test]
    fn spinlock_mutual_exclusion() {
        let lock = Arc::new(Spinlock::new());
        let counter = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = lock.clone();
            let counter = counter.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    let _guard = lock.lock();
                    counter.fetch_add(1, Ordering::Relaxed);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 4000);
    }
}
