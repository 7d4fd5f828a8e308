//! Reusable byte segments.
//!
//! Engines fill read buffers constantly; allocating and zero-filling a
//! fresh buffer per read is wasted work. The arena keeps a capped free
//! list of fixed-size segments: `take` hands out a recycled segment
//! when one is available, `recycle` returns one unless the arena is
//! full. The arena is injectable per client rather than process-global,
//! so tests and embedders control its lifetime.

use std::fmt;

use parking_lot::Mutex;

/// The size of every segment, in bytes.
pub const SEGMENT_SIZE: usize = 8 * 1024;

/// The maximum number of bytes the arena retains.
const MAX_SIZE: usize = 64 * 1024;

/// A fixed-size byte buffer with read and write cursors.
///
/// Bytes between `pos` and `limit` are readable; bytes past `limit`
/// are writable.
pub struct Segment {
    data: Box<[u8; SEGMENT_SIZE]>,
    pos: usize,
    limit: usize,
    /// Shared segments are visible to more than one buffer and must
    /// never be recycled.
    shared: bool,
}

impl Segment {
    fn new() -> Self {
        // Allocated outside the arena lock; see `SegmentArena::take`.
        Self {
            data: Box::new([0; SEGMENT_SIZE]),
            pos: 0,
            limit: 0,
            shared: false,
        }
    }

    /// Total capacity in bytes.
    pub fn capacity(&self) -> usize {
        SEGMENT_SIZE
    }

    /// The readable bytes.
    pub fn readable(&self) -> &[u8] {
        &self.data[self.pos..self.limit]
    }

    /// The whole backing buffer, for filling.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data[..]
    }

    /// Consume `count` readable bytes.
    ///
    /// # Panics
    ///
    /// Panics when fewer than `count` bytes are readable.
    pub fn advance(&mut self, count: usize) {
        assert!(self.pos + count <= self.limit, "advanced past limit");
        self.pos += count;
    }

    /// Mark the first `limit` bytes as readable.
    ///
    /// # Panics
    ///
    /// Panics when `limit` exceeds the capacity.
    pub fn set_limit(&mut self, limit: usize) {
        assert!(limit <= SEGMENT_SIZE, "limit past capacity");
        self.limit = limit;
    }

    /// Mark this segment as shared with another buffer. Shared
    /// segments are dropped rather than recycled.
    pub fn share(&mut self) {
        self.shared = true;
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("pos", &self.pos)
            .field("limit", &self.limit)
            .field("shared", &self.shared)
            .finish()
    }
}

/// A capped free list of segments.
#[derive(Debug, Default)]
pub struct SegmentArena {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    free: Vec<Segment>,
    byte_count: usize,
}

impl SegmentArena {
    /// An empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// A segment to fill: recycled when one is available, otherwise
    /// freshly allocated. Allocation happens outside the arena lock.
    pub fn take(&self) -> Segment {
        {
            let mut inner = self.inner.lock();
            if let Some(segment) = inner.free.pop() {
                inner.byte_count -= SEGMENT_SIZE;
                return segment;
            }
        }
        Segment::new()
    }

    /// Return `segment` to the free list. Shared segments and segments
    /// past the arena's byte cap are dropped instead.
    pub fn recycle(&self, mut segment: Segment) {
        if segment.shared {
            return;
        }

        let mut inner = self.inner.lock();
        if inner.byte_count + SEGMENT_SIZE > MAX_SIZE {
            return; // Arena is full.
        }
        segment.pos = 0;
        segment.limit = 0;
        inner.byte_count += SEGMENT_SIZE;
        inner.free.push(segment);
    }

    /// Bytes currently retained on the free list.
    pub fn byte_count(&self) -> usize {
        self.inner.lock().byte_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_recycle_round_trip() {
        let arena = SegmentArena::new();
        assert_eq!(arena.byte_count(), 0);

        let mut segment = arena.take();
        segment.data_mut()[..5].copy_from_slice(b"hello");
        segment.set_limit(5);
        assert_eq!(segment.readable(), b"hello");
        segment.advance(2);
        assert_eq!(segment.readable(), b"llo");

        arena.recycle(segment);
        assert_eq!(arena.byte_count(), SEGMENT_SIZE);

        // The recycled segment comes back with clean cursors.
        let segment = arena.take();
        assert_eq!(arena.byte_count(), 0);
        assert!(segment.readable().is_empty());
    }

    #[test]
    fn arena_is_capped() {
        let arena = SegmentArena::new();
        let segments: Vec<_> = (0..10).map(|_| arena.take()).collect();

        for segment in segments {
            arena.recycle(segment);
        }

        assert_eq!(arena.byte_count(), MAX_SIZE);
    }

    #[test]
    fn shared_segments_are_not_recycled() {
        let arena = SegmentArena::new();
        let mut segment = arena.take();
        segment.share();
        arena.recycle(segment);
        assert_eq!(arena.byte_count(), 0);
    }
}
