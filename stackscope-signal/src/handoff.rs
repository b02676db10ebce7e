//! Lock-free one-slot hand-off from a signal handler to a logger thread.
//!
//! A crash handler cannot format or log. What it can do is publish a small
//! fixed-size record into a pre-allocated slot with two atomic stores and
//! wake nobody; a dedicated thread polls the slot and does the non-signal-
//! safe work. One slot is enough: only one crash report matters, and a
//! second publisher losing the race simply keeps the first record.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

const EMPTY: u32 = 0;
const WRITING: u32 = 1;
const READY: u32 = 2;

/// Maximum message bytes a record can carry.
pub const MESSAGE_CAPACITY: usize = 512;

/// A record published through the slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoffRecord {
    /// Signal number that triggered the publish.
    pub signal: i32,
    /// Publishing thread's native id, when known.
    pub thread: u64,
    /// Pre-formatted message bytes.
    pub message: Vec<u8>,
}

/// The one-slot ring. All state is atomics; publishing neither allocates
/// nor locks.
pub struct HandoffSlot {
    state: AtomicU32,
    signal: AtomicU32,
    thread: AtomicU64,
    len: AtomicUsize,
    message: [AtomicU64; MESSAGE_CAPACITY / 8],
}

impl HandoffSlot {
    /// Creates an empty slot.
    pub const fn new() -> Self {
        HandoffSlot {
            state: AtomicU32::new(EMPTY),
            signal: AtomicU32::new(0),
            thread: AtomicU64::new(0),
            len: AtomicUsize::new(0),
            message: [const { AtomicU64::new(0) }; MESSAGE_CAPACITY / 8],
        }
    }

    /// Publishes a record. Async-signal-safe; returns `false` when the slot
    /// already holds an unconsumed record (the first crash wins).
    pub fn publish(&self, signal: i32, thread: u64, message: &[u8]) -> bool {
        if self
            .state
            .compare_exchange(EMPTY, WRITING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let len = message.len().min(MESSAGE_CAPACITY);
        self.signal.store(signal as u32, Ordering::Relaxed);
        self.thread.store(thread, Ordering::Relaxed);
        self.len.store(len, Ordering::Relaxed);
        for (index, word) in self.message.iter().enumerate() {
            let start = index * 8;
            if start >= len {
                break;
            }
            let mut bytes = [0u8; 8];
            let end = (start + 8).min(len);
            bytes[..end - start].copy_from_slice(&message[start..end]);
            word.store(u64::from_le_bytes(bytes), Ordering::Relaxed);
        }
        self.state.store(READY, Ordering::Release);
        true
    }

    /// Takes the published record, if any, freeing the slot.
    ///
    /// Intended for the logger thread; never blocks.
    pub fn take(&self) -> Option<HandoffRecord> {
        if self.state.load(Ordering::Acquire) != READY {
            return None;
        }
        let signal = self.signal.load(Ordering::Relaxed) as i32;
        let thread = self.thread.load(Ordering::Relaxed);
        let len = self.len.load(Ordering::Relaxed).min(MESSAGE_CAPACITY);
        let mut message = Vec::with_capacity(len);
        for (index, word) in self.message.iter().enumerate() {
            let start = index * 8;
            if start >= len {
                break;
            }
            let bytes = word.load(Ordering::Relaxed).to_le_bytes();
            let end = (start + 8).min(len);
            message.extend_from_slice(&bytes[..end - start]);
        }
        self.state.store(EMPTY, Ordering::Release);
        Some(HandoffRecord {
            signal,
            thread,
            message,
        })
    }

    /// Whether the slot currently holds an unconsumed record.
    pub fn is_ready(&self) -> bool {
        self.state.load(Ordering::Acquire) == READY
    }
}

impl Default for HandoffSlot {
    fn default() -> Self {
        HandoffSlot::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_take_roundtrip() {
        let slot = HandoffSlot::new();
        assert!(!slot.is_ready());
        assert!(slot.publish(11, 42, b"segfault in worker"));
        assert!(slot.is_ready());

        let record = slot.take().unwrap();
        assert_eq!(record.signal, 11);
        assert_eq!(record.thread, 42);
        assert_eq!(record.message, b"segfault in worker");
        assert!(!slot.is_ready());
        assert!(slot.take().is_none());
    }

    #[test]
    fn first_publisher_wins() {
        let slot = HandoffSlot::new();
        assert!(slot.publish(6, 1, b"first"));
        assert!(!slot.publish(11, 2, b"second"));

        let record = slot.take().unwrap();
        assert_eq!(record.signal, 6);
        assert_eq!(record.message, b"first");

        // the slot is reusable once drained
        assert!(slot.publish(11, 2, b"second"));
        assert_eq!(slot.take().unwrap().message, b"second");
    }

    #[test]
    fn oversized_messages_are_clamped() {
        let slot = HandoffSlot::new();
        let big = vec![b'x'; MESSAGE_CAPACITY + 100];
        assert!(slot.publish(6, 0, &big));
        let record = slot.take().unwrap();
        assert_eq!(record.message.len(), MESSAGE_CAPACITY);
        assert!(record.message.iter().all(|&b| b == b'x'));
    }

    #[test]
    fn static_slot_is_constructible() {
        static SLOT: HandoffSlot = HandoffSlot::new();
        assert!(SLOT.publish(2, 0, b"interrupt"));
        assert_eq!(SLOT.take().unwrap().signal, 2);
    }
}
