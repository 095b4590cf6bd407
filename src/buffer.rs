//! A fixed-capacity byte window with separate head/tail cursors.
//!
//! This is the "byte buffer" component: a contiguous heap region addressed by
//! `[head, tail)`, used by backend outbound send queues where the exact byte
//! occupancy needs to be tracked and capped. Unlike `bytes::BytesMut`, growth
//! is bounded by an explicit cap and must be requested explicitly via
//! `expand`, so a caller can implement "reject once queue hits N bytes"
//! policies precisely.

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum BufferError {
    #[error("buffer capacity exceeded internal growth cap")]
    CapExceeded,
}

/// A growable, but explicitly bounded, byte queue.
///
/// Invariant: `0 <= head <= tail <= size` at all times, `datacount() ==
/// tail - head`, `spacecount() == size - tail`.
#[derive(Debug, Clone)]
pub struct ByteBuffer {
    data: Vec<u8>,
    head: usize,
    tail: usize,
    cap: usize,
}

impl ByteBuffer {
    /// Create a new buffer with the given initial capacity and an internal
    /// growth ceiling (`cap`, in bytes) that `expand` will refuse to exceed.
    pub fn new(initial_size: usize, cap: usize) -> Self {
        ByteBuffer {
            data: vec![0u8; initial_size],
            head: 0,
            tail: 0,
            cap,
        }
    }

    /// Number of bytes currently queued.
    pub fn datacount(&self) -> usize {
        self.tail - self.head
    }

    /// Number of free bytes at the tail end without realigning.
    pub fn spacecount(&self) -> usize {
        self.data.len() - self.tail
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// The occupied region as a byte slice.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.head..self.tail]
    }

    /// Move `[head, tail)` down to the start of the backing store, recovering
    /// space consumed from the front without changing `datacount`.
    pub fn realign(&mut self) {
        if self.head == 0 {
            return;
        }
        self.data.copy_within(self.head..self.tail, 0);
        self.tail -= self.head;
        self.head = 0;
    }

    /// Double the backing store, up to `cap`. Returns an error if the buffer
    /// is already at or would exceed `cap`.
    pub fn expand(&mut self) -> Result<(), BufferError> {
        let new_size = (self.data.len() * 2).max(64);
        if new_size > self.cap {
            if self.data.len() >= self.cap {
                return Err(BufferError::CapExceeded);
            }
            self.data.resize(self.cap, 0);
            return Ok(());
        }
        self.data.resize(new_size, 0);
        Ok(())
    }

    /// Append bytes to the tail, growing (realign then expand) as needed.
    /// Fails if the data cannot fit even after growing to `cap`.
    pub fn append(&mut self, bytes: &[u8]) -> Result<(), BufferError> {
        if bytes.len() > self.spacecount() {
            self.realign();
        }
        while bytes.len() > self.spacecount() {
            self.expand()?;
        }
        let start = self.tail;
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
        self.tail += bytes.len();
        Ok(())
    }

    /// Reserve `n` additional bytes of writable space at the tail (via a
    /// mutable slice) for an external writer (e.g. a socket `recv`), without
    /// copying. The caller must call `produce` with however many bytes it
    /// actually wrote.
    pub fn tail_space(&mut self, n: usize) -> Result<&mut [u8], BufferError> {
        if n > self.spacecount() {
            self.realign();
        }
        while n > self.spacecount() {
            self.expand()?;
        }
        let start = self.tail;
        Ok(&mut self.data[start..start + n])
    }

    /// Mark `n` bytes, already written into the slice returned by
    /// `tail_space`, as produced (part of the readable region).
    pub fn produce(&mut self, n: usize) {
        debug_assert!(self.tail + n <= self.data.len());
        self.tail += n;
    }

    /// Remove `n` bytes from the head of the readable region.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(self.head + n <= self.tail);
        self.head += n;
        if self.head == self.tail {
            self.head = 0;
            self.tail = 0;
        }
    }

    /// Scan the readable region for `needle`, returning the index relative to
    /// `head` of the first occurrence, if any. Does not consume.
    pub fn find(&self, needle: u8) -> Option<usize> {
        memchr::memchr(needle, self.as_slice())
    }

    /// Consume and return the bytes up to and including the first occurrence
    /// of `needle`, or `None` if `needle` is not present in the readable
    /// region. The returned slice excludes `needle` itself.
    pub fn consume_until(&mut self, needle: u8) -> Option<Vec<u8>> {
        let idx = self.find(needle)?;
        let out = self.as_slice()[..idx].to_vec();
        self.consume(idx + 1);
        Some(out)
    }
}
