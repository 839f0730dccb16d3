//! Event-delivery thread (spec §5 "Event thread", §6 "Event callback").
//!
//! The mixer thread never invokes the application's callback directly — it
//! only pushes fixed-size [`Event`] records into a wait-free [`SpscRing`].
//! A dedicated, non-realtime thread drains that ring and calls the
//! callback, satisfying the re-entrancy rule ("callbacks are never invoked
//! from within an API call the callback itself could make re-entrantly").

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use sonus_core::{Id, SpscRing};

/// Mirrors the spec's `{BufferCompleted, SourceStateChanged, Disconnected}`
/// plus the underrun notification carried by the same path (§7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventKind {
    #[default]
    None,
    BufferCompleted,
    SourceStateChanged,
    Disconnected,
    Underrun,
}

/// One event record. Kept `Copy` and free of heap allocation so it can
/// cross the ring without the mixer thread allocating; `message` is a
/// static string rather than an owned one for the same reason.
#[derive(Debug, Clone, Copy, Default)]
pub struct Event {
    pub kind: EventKind,
    pub object_id: Option<Id>,
    pub param: i32,
    pub message: Option<&'static str>,
}

impl Event {
    pub fn source_state_changed(id: Id, new_state: i32) -> Self {
        Self { kind: EventKind::SourceStateChanged, object_id: Some(id), param: new_state, message: None }
    }

    pub fn buffer_completed(id: Id) -> Self {
        Self { kind: EventKind::BufferCompleted, object_id: Some(id), param: 0, message: None }
    }

    pub fn disconnected(message: &'static str) -> Self {
        Self { kind: EventKind::Disconnected, object_id: None, param: 0, message: Some(message) }
    }

    pub fn underrun(id: Id) -> Self {
        Self { kind: EventKind::Underrun, object_id: Some(id), param: 0, message: None }
    }
}

pub type EventCallback = Box<dyn FnMut(Event) + Send + 'static>;

/// Owns the consumer side of the event ring and the thread that drains it.
pub struct EventThread {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EventThread {
    /// Spawn the event thread and return it along with the producer-side
    /// ring the mixer thread pushes into.
    pub fn spawn(capacity: usize, mut callback: EventCallback) -> (Self, Arc<SpscRing<Event>>) {
        let ring = Arc::new(SpscRing::new(capacity));
        let running = Arc::new(AtomicBool::new(true));
        let thread_ring = Arc::clone(&ring);
        let thread_running = Arc::clone(&running);

        let handle = thread::Builder::new()
            .name("sonus-event".into())
            .spawn(move || {
                let mut batch = [Event::default(); 32];
                while thread_running.load(Ordering::Acquire) {
                    let n = thread_ring.pop(&mut batch);
                    if n == 0 {
                        thread::sleep(Duration::from_millis(1));
                        continue;
                    }
                    for &event in &batch[..n] {
                        callback(event);
                    }
                }
                // Drain whatever the mixer published before shutdown was
                // requested; events are not allowed to go silently missing.
                loop {
                    let n = thread_ring.pop(&mut batch);
                    if n == 0 {
                        break;
                    }
                    for &event in &batch[..n] {
                        callback(event);
                    }
                }
            })
            .expect("failed to spawn sonus event thread");

        (Self { running, handle: Some(handle) }, ring)
    }
}

impl Drop for EventThread {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn delivers_pushed_events_in_order() {
        let (tx, rx) = mpsc::channel();
        let (_thread, ring) = EventThread::spawn(16, Box::new(move |event| {
            let _ = tx.send(event.kind);
        }));

        ring.push(&[Event::buffer_completed(unsafe_test_id(1)), Event::disconnected("gone")]);

        let first = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        let second = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(first, EventKind::BufferCompleted);
        assert_eq!(second, EventKind::Disconnected);
    }

    fn unsafe_test_id(raw: u32) -> Id {
        let registry: sonus_core::Registry<()> = sonus_core::Registry::new();
        // Insert `raw` throwaway entries so the registry hands back an id
        // with the requested raw value; ids are never zero and are minted
        // in insertion order starting at 1.
        let mut last = registry.insert(());
        for _ in 1..raw {
            last = registry.insert(());
        }
        last
    }
}
