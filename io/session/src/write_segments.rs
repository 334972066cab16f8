//! Outstanding transport writes.
//!
//! Every buffer handed to the transport is recorded as a [`WriteSegment`]
//! and identified to the transport by a [`WriteHandle`]. The transport hands
//! the handle back on completion; handles for segments that were detached
//! (or already retired) are simply not found.

use std::collections::VecDeque;

/// Flags attached to a transport write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteFlags {
    /// More data follows immediately; the transport may hold this write.
    pub cork: bool,
    /// The write ends a message (end of record).
    pub eor: bool,
}

/// Token returned by the transport when a write completes or fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WriteHandle(u64);

impl WriteHandle {
    pub fn id(self) -> u64 {
        self.0
    }
}

/// One outstanding write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteSegment {
    pub handle: WriteHandle,
    pub length: u64,
    pub flags: WriteFlags,
}

/// In-order list of outstanding writes.
#[derive(Debug, Default)]
pub struct WriteSegmentTracker {
    segments: VecDeque<WriteSegment>,
    next_id: u64,
    pending_bytes: u64,
}

impl WriteSegmentTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a write of `length` bytes and return its handle.
    pub fn push(&mut self, length: u64, flags: WriteFlags) -> WriteHandle {
        let handle = WriteHandle(self.next_id);
        self.next_id += 1;
        self.pending_bytes += length;
        self.segments.push_back(WriteSegment {
            handle,
            length,
            flags,
        });
        handle
    }

    /// Retire `handle` together with every older segment.
    ///
    /// Transports complete writes in order, so a completion for a segment
    /// implies completion of everything issued before it. Returns the bytes
    /// retired, or `None` if the handle is unknown.
    pub fn complete(&mut self, handle: WriteHandle) -> Option<u64> {
        let position = self.segments.iter().position(|s| s.handle == handle)?;
        let retired: u64 = self
            .segments
            .drain(..=position)
            .map(|segment| segment.length)
            .sum();
        self.pending_bytes -= retired;
        Some(retired)
    }

    /// True if `handle` is still outstanding.
    pub fn contains(&self, handle: WriteHandle) -> bool {
        self.segments.iter().any(|s| s.handle == handle)
    }

    /// Forget every outstanding segment; later completions are ignored.
    /// Returns the number of segments detached.
    pub fn detach_all(&mut self) -> usize {
        let count = self.segments.len();
        self.segments.clear();
        self.pending_bytes = 0;
        count
    }

    /// Bytes handed to the transport and not yet confirmed.
    pub fn pending_bytes(&self) -> u64 {
        self.pending_bytes
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WriteSegment> {
        self.segments.iter()
    }
}
