//! A fixed-capacity byte ring.
//!
//! Writes never fail: once the buffer is full, the oldest byte is
//! overwritten. Useful as a bounded scratch buffer between a packet source
//! and a slower consumer where dropping the oldest data is acceptable.

pub struct RingBuffer {
    buffer: Vec<u8>,
    capacity: usize,
    start: usize,
    end: usize,
    len: usize,
}

impl RingBuffer {
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be non-zero");

        Self {
            buffer: vec![0; capacity],
            capacity,
            start: 0,
            end: 0,
            len: 0,
        }
    }

    /// Appends a byte, overwriting the oldest one if the buffer is full.
    pub fn push_back(&mut self, value: u8) {
        self.buffer[self.end] = value;
        self.end = (self.end + 1) % self.capacity;

        if self.len == self.capacity {
            self.start = (self.start + 1) % self.capacity;
        } else {
            self.len += 1;
        }
    }

    /// Appends all bytes of `data`, overwriting the oldest ones on overflow.
    pub fn extend(&mut self, data: &[u8]) {
        for &byte in data {
            self.push_back(byte);
        }
    }

    pub fn pop_front(&mut self) -> Option<u8> {
        if self.len == 0 {
            return None;
        }

        let value = self.buffer[self.start];
        self.start = (self.start + 1) % self.capacity;
        self.len -= 1;

        Some(value)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
