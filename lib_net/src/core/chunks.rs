//! Indexed byte-chunk queue behind every broker's read and write buffers.
//!
//! Chunks are kept in arrival order in a ring; `head_index`/`tail_index` are
//! monotonic u64 counters, so `tail_index - head_index` is always the number
//! of chunks currently queued. The counters wrap modularly instead of being
//! reset by a size heuristic, which keeps very long-lived connections safe.

use std::collections::VecDeque;

use bytes::Bytes;

/// Ordered queue of byte chunks with bounded indices and an end flag.
#[derive(Debug, Default)]
pub struct Chunks {
    data: VecDeque<Bytes>,
    head_index: u64,
    tail_index: u64,
    end_flag: bool,
    bytes: usize,
}

impl Chunks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a chunk at `tail_index` and bump the counter.
    /// Empty chunks are dropped, they would produce spurious wakeups.
    pub fn add(&mut self, chunk: impl Into<Bytes>) {
        let chunk = chunk.into();
        if chunk.is_empty() {
            return;
        }
        self.bytes += chunk.len();
        self.data.push_back(chunk);
        self.tail_index = self.tail_index.wrapping_add(1);
    }

    /// Pop the head chunk, advancing `head_index`.
    ///
    /// Returns an empty chunk while the end flag is set or the queue is
    /// drained.
    pub fn get(&mut self) -> Bytes {
        if self.end_flag {
            return Bytes::new();
        }
        match self.data.pop_front() {
            Some(chunk) => {
                self.head_index = self.head_index.wrapping_add(1);
                self.bytes -= chunk.len();
                chunk
            }
            None => Bytes::new(),
        }
    }

    /// Look at the head chunk without consuming it.
    pub fn peek(&self) -> Option<&Bytes> {
        if self.end_flag {
            return None;
        }
        self.data.front()
    }

    /// Mark the stream as finished; `get` yields nothing until [`Self::reopen`].
    pub fn end(&mut self) {
        self.end_flag = true;
    }

    /// Clear the end flag set by [`Self::end`].
    pub fn reopen(&mut self) {
        self.end_flag = false;
    }

    pub fn is_ended(&self) -> bool {
        self.end_flag
    }

    /// Number of chunks currently queued (`tail_index - head_index`).
    pub fn count(&self) -> u64 {
        self.tail_index.wrapping_sub(self.head_index)
    }

    /// Total buffered payload size in bytes.
    pub fn len(&self) -> usize {
        self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Drop all queued chunks and reset the end flag. Indices keep running,
    /// consumers must not assume they restart at zero.
    pub fn clear(&mut self) {
        self.data.clear();
        self.bytes = 0;
        self.end_flag = false;
        self.head_index = self.tail_index;
    }

    /// Drain the whole queue into one contiguous buffer.
    pub fn drain_all(&mut self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.bytes);
        while let Some(chunk) = self.data.pop_front() {
            self.head_index = self.head_index.wrapping_add(1);
            out.extend_from_slice(&chunk);
        }
        self.bytes = 0;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_get_index_arithmetic() {
        let mut q = Chunks::new();
        for i in 0..10u8 {
            q.add(vec![i; 4]);
        }
        for _ in 0..4 {
            assert!(!q.get().is_empty());
        }
        // after N adds and K gets, tail - head == N - K
        assert_eq!(q.count(), 6);
        assert_eq!(q.len(), 6 * 4);
    }

    #[test]
    fn end_flag_gates_get() {
        let mut q = Chunks::new();
        q.add(&b"payload"[..]);
        q.end();
        assert!(q.get().is_empty());
        assert_eq!(q.count(), 1);
        q.reopen();
        assert_eq!(&q.get()[..], b"payload");
        assert_eq!(q.count(), 0);
    }

    #[test]
    fn empty_chunks_are_dropped() {
        let mut q = Chunks::new();
        q.add(Vec::new());
        assert_eq!(q.count(), 0);
        assert!(q.is_empty());
    }

    #[test]
    fn clear_keeps_counters_consistent() {
        let mut q = Chunks::new();
        q.add(&b"a"[..]);
        q.add(&b"b"[..]);
        q.clear();
        assert_eq!(q.count(), 0);
        q.add(&b"c"[..]);
        assert_eq!(q.count(), 1);
        assert_eq!(&q.get()[..], b"c");
    }

    #[test]
    fn drain_all_concatenates() {
        let mut q = Chunks::new();
        q.add(&b"ab"[..]);
        q.add(&b"cd"[..]);
        assert_eq!(q.drain_all(), b"abcd");
        assert_eq!(q.count(), 0);
        assert_eq!(q.len(), 0);
    }
}
