//! Receive ring buffer
//!
//! One slot is kept free to tell a full ring from an empty one, so a ring
//! of `size` bytes holds at most `size - 1`. When a write catches up with
//! the read index, the oldest byte is dropped and the push reports it.

use core::ptr::NonNull;

use crate::config::CFG_RINGBUFFER_WATERMARK_PERCENT;

/// Occupancy threshold for receive flow control, in percent of the ring size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Watermark {
    percent: u8,
}

impl Watermark {
    /// Create a watermark, clamped to 100%
    pub const fn new(percent: u8) -> Self {
        let percent = if percent > 100 { 100 } else { percent };
        Watermark { percent }
    }

    #[inline]
    pub const fn percent(&self) -> u8 {
        self.percent
    }

    /// Byte count at which a ring of `size` bytes counts as too full
    #[inline]
    pub const fn threshold(&self, size: usize) -> usize {
        size * self.percent as usize / 100
    }
}

impl Default for Watermark {
    fn default() -> Self {
        Watermark::new(CFG_RINGBUFFER_WATERMARK_PERCENT)
    }
}

/// Byte ring over caller-provided storage
#[derive(Debug)]
pub struct RingBuffer {
    buffer: Option<NonNull<u8>>,
    size: usize,
    head: usize,
    tail: usize,
}

impl RingBuffer {
    /// Create a ring with no storage attached
    pub const fn new() -> Self {
        RingBuffer {
            buffer: None,
            size: 0,
            head: 0,
            tail: 0,
        }
    }

    /// Attach storage and reset both indices
    pub fn attach(&mut self, storage: &'static mut [u8]) {
        self.size = storage.len();
        self.buffer = NonNull::new(storage.as_mut_ptr());
        self.head = 0;
        self.tail = 0;
    }

    /// Forget the storage
    pub fn detach(&mut self) {
        *self = RingBuffer::new();
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Write index
    #[inline]
    pub fn head(&self) -> usize {
        self.head
    }

    /// Read index
    #[inline]
    pub fn tail(&self) -> usize {
        self.tail
    }

    /// Bytes waiting to be read
    #[inline]
    pub fn len(&self) -> usize {
        if self.size == 0 {
            return 0;
        }
        (self.head + self.size - self.tail) % self.size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// Bytes that fit before the oldest data gets overwritten
    #[inline]
    pub fn free(&self) -> usize {
        self.size.saturating_sub(1) - self.len()
    }

    /// Check whether occupancy is strictly below the watermark
    #[inline]
    pub fn below(&self, watermark: Watermark) -> bool {
        self.len() < watermark.threshold(self.size)
    }

    /// Append received bytes
    ///
    /// Returns how many old bytes were dropped to make room.
    pub fn push(&mut self, data: &[u8]) -> usize {
        let Some(buffer) = self.buffer else {
            return 0;
        };
        let base = buffer.as_ptr();

        if self.head + data.len() < self.size && data.len() <= self.free() {
            // SAFETY: `head + len` stays inside the attached storage.
            unsafe {
                core::ptr::copy_nonoverlapping(data.as_ptr(), base.add(self.head), data.len());
            }
            self.head += data.len();
            return 0;
        }

        let mut dropped = 0;
        for &byte in data {
            // SAFETY: `head < size`.
            unsafe { base.add(self.head).write(byte) };
            self.head = (self.head + 1) % self.size;
            if self.head == self.tail {
                self.tail = (self.tail + 1) % self.size;
                dropped += 1;
            }
        }
        dropped
    }

    /// Take the oldest byte
    pub fn pop(&mut self) -> Option<u8> {
        let buffer = self.buffer?;
        if self.is_empty() {
            return None;
        }
        // SAFETY: `tail < size`.
        let byte = unsafe { buffer.as_ptr().add(self.tail).read() };
        self.tail = (self.tail + 1) % self.size;
        Some(byte)
    }

    /// Move up to `dst.len()` of the oldest bytes into `dst`
    ///
    /// Returns the number of bytes copied.
    pub fn drain_into(&mut self, dst: &mut [u8]) -> usize {
        let count = dst.len().min(self.len());
        for slot in &mut dst[..count] {
            match self.pop() {
                Some(byte) => *slot = byte,
                None => break,
            }
        }
        count
    }
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new()
    }
}
