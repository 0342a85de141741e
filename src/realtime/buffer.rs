//! Outbound message buffer.

use std::collections::VecDeque;

/// Bounded FIFO of messages waiting for a connected transport.
///
/// A message leaves the buffer only through `confirm_front`, after the
/// transport reported it sent.
#[derive(Debug)]
pub struct OutboundBuffer {
    messages: VecDeque<String>,
    capacity: usize,
}

impl OutboundBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            messages: VecDeque::new(),
            capacity,
        }
    }

    /// Append `message`. Returns it back if the buffer is full.
    pub fn push(&mut self, message: String) -> Result<(), String> {
        if self.messages.len() >= self.capacity {
            return Err(message);
        }
        self.messages.push_back(message);
        Ok(())
    }

    /// Oldest unsent message.
    pub fn front(&self) -> Option<&String> {
        self.messages.front()
    }

    /// Drop the oldest message once it has been sent.
    pub fn confirm_front(&mut self) -> Option<String> {
        self.messages.pop_front()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
    }

    pub fn clear(&mut self) -> usize {
        let dropped = self.messages.len();
        self.messages.clear();
        dropped
    }
}
