//! Bounded ring of raw event records awaiting delivery.

use std::collections::VecDeque;
use thiserror::Error;

pub const QUEUE_SLOTS: usize = 0x4000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("Queue limit exceeded ({entries} entries, {bytes} of {limit} bytes)")]
    LimitExceeded {
        entries: usize,
        bytes: usize,
        limit: usize,
    },
}

/// Fixed slot count, independently capped by total payload bytes.
#[derive(Debug)]
pub struct RawEventQueue {
    slots: VecDeque<Box<[u8]>>,
    capacity: usize,
    bytes: usize,
    byte_limit: usize,
}

impl RawEventQueue {
    pub fn new(byte_limit: usize) -> Self {
        Self::with_slots(QUEUE_SLOTS, byte_limit)
    }

    pub fn with_slots(capacity: usize, byte_limit: usize) -> Self {
        Self {
            slots: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            bytes: 0,
            byte_limit,
        }
    }

    /// Copies `record` into the queue.
    pub fn push(&mut self, record: &[u8]) -> Result<(), QueueError> {
        if self.slots.len() >= self.capacity || self.bytes + record.len() > self.byte_limit {
            return Err(QueueError::LimitExceeded {
                entries: self.slots.len(),
                bytes: self.bytes,
                limit: self.byte_limit,
            });
        }
        self.bytes += record.len();
        self.slots.push_back(record.into());
        Ok(())
    }

    pub fn front(&self) -> Option<&[u8]> {
        self.slots.front().map(|r| &r[..])
    }

    pub fn pop(&mut self) -> Option<Box<[u8]>> {
        let record = self.slots.pop_front()?;
        self.bytes -= record.len();
        Some(record)
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.bytes = 0;
    }

    pub fn set_byte_limit(&mut self, byte_limit: usize) {
        self.byte_limit = byte_limit;
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }
}
