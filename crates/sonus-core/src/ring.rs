//! Single-producer single-consumer ring buffer (spec §4.A).
//!
//! Used for the event-delivery path (mixer thread → event thread, §6) and
//! for any byte-oriented streaming the device backend needs. Wait-free on
//! both ends: the producer only ever advances `write_pos`, the consumer only
//! ever advances `read_pos`, and each side only loads the other's position.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Wait-free SPSC ring buffer over `T: Copy`.
///
/// Capacity is rounded up to a power of two so the wrap-around index is a
/// mask rather than a modulo.
pub struct SpscRing<T> {
    buffer: Box<[std::cell::UnsafeCell<T>]>,
    mask: usize,
    write_pos: AtomicUsize,
    read_pos: AtomicUsize,
}

// SAFETY: `T: Copy + Send` values are moved between exactly one producer and
// one consumer thread; the atomics establish the happens-before edges that
// make that handoff race-free.
unsafe impl<T: Send> Sync for SpscRing<T> {}

impl<T: Copy + Default> SpscRing<T> {
    /// Create a new ring with at least `min_capacity` slots.
    pub fn new(min_capacity: usize) -> Self {
        let capacity = min_capacity.max(1).next_power_of_two();
        let buffer: Box<[std::cell::UnsafeCell<T>]> = (0..capacity)
            .map(|_| std::cell::UnsafeCell::new(T::default()))
            .collect();
        Self {
            buffer,
            mask: capacity - 1,
            write_pos: AtomicUsize::new(0),
            read_pos: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    #[inline]
    pub fn available_write(&self) -> usize {
        let write = self.write_pos.load(Ordering::Relaxed);
        let read = self.read_pos.load(Ordering::Acquire);
        self.capacity() - (write.wrapping_sub(read))
    }

    #[inline]
    pub fn available_read(&self) -> usize {
        let write = self.write_pos.load(Ordering::Acquire);
        let read = self.read_pos.load(Ordering::Relaxed);
        write.wrapping_sub(read)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.available_read() == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.available_write() == 0
    }

    /// Producer side: push as many items as fit, return the count written.
    /// Never blocks and never allocates — safe to call from the mixer thread.
    pub fn push(&self, items: &[T]) -> usize {
        let available = self.available_write();
        let to_write = items.len().min(available);
        if to_write == 0 {
            return 0;
        }
        let write = self.write_pos.load(Ordering::Relaxed);
        for (i, &item) in items[..to_write].iter().enumerate() {
            let idx = (write.wrapping_add(i)) & self.mask;
            // SAFETY: only the producer writes, and `idx` is always a slot
            // the consumer has already released (available_write bounds it).
            unsafe { *self.buffer[idx].get() = item };
        }
        self.write_pos
            .store(write.wrapping_add(to_write), Ordering::Release);
        to_write
    }

    /// Consumer side: pop as many items as fit into `out`, return the count.
    pub fn pop(&self, out: &mut [T]) -> usize {
        let available = self.available_read();
        let to_read = out.len().min(available);
        if to_read == 0 {
            return 0;
        }
        let read = self.read_pos.load(Ordering::Relaxed);
        for (i, slot) in out[..to_read].iter_mut().enumerate() {
            let idx = (read.wrapping_add(i)) & self.mask;
            // SAFETY: only the consumer reads, and `idx` is always a slot
            // the producer has already published (available_read bounds it).
            *slot = unsafe { *self.buffer[idx].get() };
        }
        self.read_pos
            .store(read.wrapping_add(to_read), Ordering::Release);
        to_read
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_within_capacity() {
        let ring: SpscRing<u32> = SpscRing::new(4);
        assert_eq!(ring.push(&[1, 2, 3]), 3);
        let mut out = [0u32; 3];
        assert_eq!(ring.pop(&mut out), 3);
        assert_eq!(out, [1, 2, 3]);
        assert!(ring.is_empty());
    }

    #[test]
    fn wraps_around_and_saturates_on_full() {
        let ring: SpscRing<u32> = SpscRing::new(4);
        assert_eq!(ring.push(&[1, 2, 3, 4]), 4);
        assert_eq!(ring.push(&[5]), 0);
        let mut out = [0u32; 2];
        assert_eq!(ring.pop(&mut out), 2);
        assert_eq!(out, [1, 2]);
        assert_eq!(ring.push(&[5, 6]), 2);
        let mut out = [0u32; 4];
        assert_eq!(ring.pop(&mut out), 4);
        assert_eq!(out, [3, 4, 5, 6]);
    }

    #[test]
    fn capacity_rounds_to_power_of_two() {
        let ring: SpscRing<u8> = SpscRing::new(5);
        assert_eq!(ring.capacity(), 8);
    }
}
