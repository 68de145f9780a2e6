//! Event Queue: bounded async event channel to user space.
//! `wait_event` is the only cancellable wait in the system.
//!
//! Grounded on `kernel/vfs/file/event_file.rs`'s `EventFile` (an
//! event-counter file user space blocks on) — generalized from a raw
//! counter into a bounded queue of typed `{time, code}` records,
//! rather than just a count.

use std::sync::mpsc::{self, Receiver, SyncSender, TryRecvError};
use std::time::{Duration, Instant};

/// Corruption/space events the engine reports, in addition to
/// reflecting them on subsequent command returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    LowFreeSpace,
    OutOfFreeSpace,
    Corrupted,
}

/// A dequeued event, timestamped at publish time.
#[derive(Debug, Clone, Copy)]
pub struct EventRecord {
    pub at: Instant,
    pub code: Event,
}

/// The publishing half, shared by every subsystem that can raise an
/// event for one snapshot (Diff Storage, Diff Area, CBT Map).
#[derive(Clone)]
pub struct EventQueue {
    sender: SyncSender<EventRecord>,
}

impl EventQueue {
    /// Creates a bounded channel of `capacity` pending events, returning
    /// the publishing half and the `wait_event`-capable handle.
    pub fn new(capacity: usize) -> (Self, EventQueueHandle) {
        let (sender, receiver) = mpsc::sync_channel(capacity.max(1));
        (Self { sender }, EventQueueHandle { receiver })
    }

    /// Publishes an event. A full queue drops the oldest-pending
    /// semantics in favor of never blocking the caller (publishers run
    /// on subsystem code paths, some of them hot); callers that need
    /// guaranteed delivery should keep the queue capacity generous.
    pub fn publish(&self, code: Event) {
        let record = EventRecord {
            at: Instant::now(),
            code,
        };
        let _ = self.sender.try_send(record);
    }
}

/// The consuming half, held by `Snapshot::wait_event`.
pub struct EventQueueHandle {
    receiver: Receiver<EventRecord>,
}

impl EventQueueHandle {
    /// Dequeues the next event or times out.
    pub fn wait(&self, timeout: Duration) -> Option<EventRecord> {
        self.receiver.recv_timeout(timeout).ok()
    }

    /// Non-blocking poll, used internally and by tests.
    pub fn try_recv(&self) -> Option<Event> {
        match self.receiver.try_recv() {
            Ok(record) => Some(record.code),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_times_out_when_nothing_published() {
        let (_queue, handle) = EventQueue::new(4);
        assert!(handle.wait(Duration::from_millis(20)).is_none());
    }

    #[test]
    fn wait_returns_published_event() {
        let (queue, handle) = EventQueue::new(4);
        queue.publish(Event::Corrupted);
        let record = handle.wait(Duration::from_secs(1)).unwrap();
        assert_eq!(record.code, Event::Corrupted);
    }

    #[test]
    fn events_are_delivered_in_publish_order() {
        let (queue, handle) = EventQueue::new(4);
        queue.publish(Event::LowFreeSpace);
        queue.publish(Event::OutOfFreeSpace);

        assert_eq!(handle.try_recv(), Some(Event::LowFreeSpace));
        assert_eq!(handle.try_recv(), Some(Event::OutOfFreeSpace));
        assert_eq!(handle.try_recv(), None);
    }
}
