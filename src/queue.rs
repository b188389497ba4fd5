use std::collections::VecDeque;

use crate::errors::{Result, SomError};
use crate::APP_COAP_MAX_MSG_LEN;

/// Default number of encoded messages awaiting delivery
pub const DEFAULT_QUEUE_CAPACITY: usize = 5;

/// One encoded uplink waiting in the outbound queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedMessage {
    /// Sequence number assigned by the packer
    pub id: u32,
    pub bytes: Vec<u8>,
}

impl EncodedMessage {
    pub fn new(id: u32, bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() > APP_COAP_MAX_MSG_LEN {
            return Err(SomError::BufferTooSmall {
                required: bytes.len(),
                available: APP_COAP_MAX_MSG_LEN,
            });
        }
        Ok(Self { id, bytes })
    }
}

/// Bounded FIFO of encoded messages.
///
/// Pushing into a full queue evicts the oldest entry and hands it back to
/// the caller so the drop can be reported.
#[derive(Debug)]
pub struct OutboundQueue {
    q: VecDeque<EncodedMessage>,
    capacity: usize,
}

impl Default for OutboundQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl OutboundQueue {
    /// Capacity is clamped to at least one slot
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            q: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.q.len()
    }

    pub fn is_empty(&self) -> bool {
        self.q.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Push to back; returns the evicted oldest entry if the queue was full
    pub fn push(&mut self, msg: EncodedMessage) -> Option<EncodedMessage> {
        let dropped = if self.q.len() >= self.capacity {
            self.q.pop_front()
        } else {
            None
        };
        self.q.push_back(msg);
        dropped
    }

    pub fn pop(&mut self) -> Option<EncodedMessage> {
        self.q.pop_front()
    }

    pub fn clear(&mut self) {
        self.q.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &EncodedMessage> {
        self.q.iter()
    }
}
