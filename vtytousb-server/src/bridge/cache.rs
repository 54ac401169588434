//! Rolling device output cache
//!
//! Keeps the most recent bytes read from a device so that a client joining
//! later can see what scrolled past. Oldest bytes are evicted first.

use std::collections::VecDeque;

/// Bounded FIFO byte buffer
#[derive(Debug)]
pub struct SerialCache {
    /// Cached bytes, oldest first
    bytes: VecDeque<u8>,
    /// Maximum number of bytes kept
    limit: usize,
}

impl SerialCache {
    /// Create an empty cache holding at most `limit` bytes
    pub fn new(limit: usize) -> Self {
        Self {
            bytes: VecDeque::with_capacity(limit.min(64 * 1024)),
            limit,
        }
    }

    /// Append bytes, evicting from the front past the limit
    pub fn push(&mut self, data: &[u8]) {
        // Only the tail of an oversized chunk can survive
        let data = if data.len() > self.limit {
            &data[data.len() - self.limit..]
        } else {
            data
        };
        self.bytes.extend(data);
        self.trim();
    }

    /// Change the limit and trim immediately
    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit;
        self.trim();
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Drop the oldest bytes until within the limit
    pub fn trim(&mut self) {
        if self.bytes.len() > self.limit {
            let excess = self.bytes.len() - self.limit;
            self.bytes.drain(..excess);
        }
    }

    /// Copy of the cached bytes, oldest first
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}
