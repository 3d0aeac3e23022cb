//! Pending flush queue
//!
//! Flushes for one scene wait here until the next frame boundary. They leave
//! the queue only from the front, so a scene is always updated in flush order.

use bytes::Bytes;
use std::collections::VecDeque;
use std::time::Instant;

/// One received flush, not yet applied
#[derive(Debug, Clone)]
pub struct PendingFlush {
    /// Flush index assigned by the producer
    pub flush_index: u64,
    /// Encoded scene delta
    pub payload: Bytes,
    /// When the flush arrived
    pub received_at: Instant,
    /// Expiration stamp set by the producer, ms since the Unix epoch
    pub expires_at: Option<u64>,
}

impl PendingFlush {
    pub fn new(flush_index: u64, payload: Bytes) -> Self {
        Self {
            flush_index,
            payload,
            received_at: Instant::now(),
            expires_at: None,
        }
    }

    pub fn expiring_at(mut self, expires_at: Option<u64>) -> Self {
        self.expires_at = expires_at;
        self
    }

    /// Payload size in bytes
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

/// Ordered flushes of a single scene
#[derive(Debug, Default)]
pub struct PendingFlushQueue {
    flushes: VecDeque<PendingFlush>,
    /// Total payload bytes held
    bytes: usize,
    /// Consecutive frame boundaries this queue stayed blocked
    blocked_frames: u32,
}

impl PendingFlushQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a flush, returns the new depth
    pub fn push(&mut self, flush: PendingFlush) -> usize {
        if let Some(last) = self.flushes.back() {
            if flush.flush_index <= last.flush_index {
                tracing::warn!(
                    last = last.flush_index,
                    received = flush.flush_index,
                    "Flush index went backwards"
                );
            }
        }
        self.bytes += flush.size();
        self.flushes.push_back(flush);
        self.flushes.len()
    }

    /// Oldest pending flush
    pub fn front(&self) -> Option<&PendingFlush> {
        self.flushes.front()
    }

    pub fn pop(&mut self) -> Option<PendingFlush> {
        let flush = self.flushes.pop_front()?;
        self.bytes -= flush.size();
        Some(flush)
    }

    /// Drop everything, returns the number of flushes discarded
    pub fn clear(&mut self) -> usize {
        let discarded = self.flushes.len();
        self.flushes.clear();
        self.bytes = 0;
        self.blocked_frames = 0;
        discarded
    }

    pub fn len(&self) -> usize {
        self.flushes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flushes.is_empty()
    }

    /// Total payload bytes held
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn blocked_frames(&self) -> u32 {
        self.blocked_frames
    }

    /// Earliest expiration stamp among queued flushes
    pub fn earliest_expiration(&self) -> Option<u64> {
        self.flushes.iter().filter_map(|f| f.expires_at).min()
    }

    pub(super) fn mark_blocked(&mut self) {
        self.blocked_frames = self.blocked_frames.saturating_add(1);
    }

    pub(super) fn mark_unblocked(&mut self) {
        self.blocked_frames = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_keeps_order_and_size() {
        let mut queue = PendingFlushQueue::new();
        assert_eq!(queue.push(PendingFlush::new(1, Bytes::from_static(b"ab"))), 1);
        assert_eq!(queue.push(PendingFlush::new(2, Bytes::from_static(b"cde"))), 2);
        assert_eq!(queue.bytes(), 5);

        assert_eq!(queue.pop().map(|f| f.flush_index), Some(1));
        assert_eq!(queue.bytes(), 3);
        assert_eq!(queue.front().map(|f| f.flush_index), Some(2));
    }

    #[test]
    fn test_clear_resets_counters() {
        let mut queue = PendingFlushQueue::new();
        queue.push(PendingFlush::new(1, Bytes::from_static(b"x")));
        queue.push(PendingFlush::new(2, Bytes::from_static(b"y")));
        queue.mark_blocked();

        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
        assert_eq!(queue.bytes(), 0);
        assert_eq!(queue.blocked_frames(), 0);
    }

    #[test]
    fn test_earliest_expiration_skips_unstamped() {
        let mut queue = PendingFlushQueue::new();
        assert_eq!(queue.earliest_expiration(), None);

        queue.push(PendingFlush::new(1, Bytes::new()).expiring_at(Some(500)));
        queue.push(PendingFlush::new(2, Bytes::new()));
        queue.push(PendingFlush::new(3, Bytes::new()).expiring_at(Some(200)));
        assert_eq!(queue.earliest_expiration(), Some(200));

        queue.pop();
        assert_eq!(queue.earliest_expiration(), Some(200));
    }
}
