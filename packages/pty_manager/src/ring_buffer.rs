//! Fixed-capacity scrollback buffer.
//!
//! Keeps the most recent bytes of a process's output so a newly attached
//! viewer can be brought up to date. Appending past capacity evicts the
//! oldest bytes; the buffer holds recent scrollback, not a transcript.

use std::collections::VecDeque;

pub struct OutputRingBuffer {
    bytes: VecDeque<u8>,
    capacity: usize,
}

impl OutputRingBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a chunk, evicting from the front once full.
    pub fn append(&mut self, data: &[u8]) {
        if self.capacity == 0 {
            return;
        }

        // Only the tail of an oversized chunk can survive
        let data = if data.len() > self.capacity {
            &data[data.len() - self.capacity..]
        } else {
            data
        };

        let overflow = (self.bytes.len() + data.len()).saturating_sub(self.capacity);
        if overflow > 0 {
            self.bytes.drain(..overflow);
        }
        self.bytes.extend(data);
    }

    /// Current contents, oldest byte first.
    pub fn snapshot(&self) -> Vec<u8> {
        let (front, back) = self.bytes.as_slices();
        let mut out = Vec::with_capacity(self.bytes.len());
        out.extend_from_slice(front);
        out.extend_from_slice(back);
        out
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
