//! Per-device FIFO of pending write chunks.

use std::collections::VecDeque;
use std::time::Instant;

/// One queued write: an owned copy of the payload, a cursor over what has
/// been written so far, the user context surfaced back through `on_write`,
/// and an optional absolute deadline.
///
/// An empty payload is the shutdown-write sentinel; it carries no bytes and
/// closes the writing side once it reaches the head of the queue.
pub(crate) struct Chunk {
    data: Box<[u8]>,
    pos: usize,
    pub(crate) ctx: usize,
    pub(crate) deadline: Option<Instant>,
}

impl Chunk {
    pub(crate) fn new(data: &[u8], ctx: usize, deadline: Option<Instant>) -> Chunk {
        Chunk {
            data: data.into(),
            pos: 0,
            ctx,
            deadline,
        }
    }

    pub(crate) fn remaining(&self) -> &[u8] {
        &self.data[self.pos..]
    }

    pub(crate) fn advance(&mut self, n: usize) {
        debug_assert!(self.pos + n <= self.data.len());
        self.pos += n;
    }

    pub(crate) fn is_done(&self) -> bool {
        self.pos == self.data.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.data.len()
    }

    pub(crate) fn is_sentinel(&self) -> bool {
        self.data.is_empty()
    }
}

/// FIFO write queue. Partial writes leave the head chunk in place with its
/// cursor advanced; completion pops in enqueue order.
pub(crate) struct WriteQueue {
    chunks: VecDeque<Chunk>,
}

impl WriteQueue {
    pub(crate) fn new() -> WriteQueue {
        WriteQueue {
            chunks: VecDeque::new(),
        }
    }

    pub(crate) fn push(&mut self, chunk: Chunk) {
        self.chunks.push_back(chunk);
    }

    pub(crate) fn head_mut(&mut self) -> Option<&mut Chunk> {
        self.chunks.front_mut()
    }

    pub(crate) fn head(&self) -> Option<&Chunk> {
        self.chunks.front()
    }

    pub(crate) fn pop(&mut self) -> Option<Chunk> {
        self.chunks.pop_front()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Pending (not yet written) byte count across all chunks.
    pub(crate) fn pending_bytes(&self) -> usize {
        self.chunks.iter().map(|c| c.remaining().len()).sum()
    }

    pub(crate) fn len(&self) -> usize {
        self.chunks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_write_keeps_head() {
        let mut q = WriteQueue::new();
        q.push(Chunk::new(b"hello world", 7, None));
        q.push(Chunk::new(b"again", 8, None));

        let head = q.head_mut().unwrap();
        head.advance(6);
        assert_eq!(head.remaining(), b"world");
        assert!(!head.is_done());

        head.advance(5);
        assert!(head.is_done());
        let done = q.pop().unwrap();
        assert_eq!(done.ctx, 7);
        assert_eq!(done.len(), 11);

        assert_eq!(q.head().unwrap().remaining(), b"again");
        assert_eq!(q.pop().unwrap().ctx, 8);
        assert!(q.is_empty());
    }

    #[test]
    fn tracks_pending_bytes() {
        let mut q = WriteQueue::new();
        q.push(Chunk::new(b"abcd", 0, None));
        q.push(Chunk::new(b"ef", 0, None));
        assert_eq!(q.pending_bytes(), 6);

        q.head_mut().unwrap().advance(4);
        let _ = q.pop();
        assert_eq!(q.pending_bytes(), 2);
    }

    #[test]
    fn sentinel_is_empty_chunk() {
        let c = Chunk::new(b"", 3, None);
        assert!(c.is_sentinel());
        assert!(c.is_done());
    }
}
