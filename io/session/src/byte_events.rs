//! Notifications tied to byte offsets in the egress stream.
//!
//! Offsets are session-relative and exclusive: an event at offset `n` covers
//! the first `n` bytes ever scheduled, so it fires once `n` bytes have been
//! confirmed written (or acknowledged, for ack events).

use crate::codec::StreamId;

use std::collections::VecDeque;

/// What a byte event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteEventKind {
    /// First byte of a transaction's egress reached the transport.
    FirstByte,
    /// Last byte of a transaction's egress reached the transport.
    LastByte,
    /// Last byte of a transaction's egress was acknowledged by the peer.
    LastByteAcked,
    /// A ping left the host; used to time the reply.
    Ping { id: u64 },
}

/// One pending notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteEvent {
    pub offset: u64,
    pub kind: ByteEventKind,
    pub stream_id: Option<StreamId>,
}

/// Ordered collection of pending byte events.
#[derive(Debug, Default)]
pub struct ByteEventTracker {
    written: VecDeque<ByteEvent>,
    acked: VecDeque<ByteEvent>,
}

fn insert_ordered(queue: &mut VecDeque<ByteEvent>, event: ByteEvent) {
    // Equal offsets keep insertion order.
    let idx = queue.partition_point(|e| e.offset <= event.offset);
    queue.insert(idx, event);
}

fn take_through(queue: &mut VecDeque<ByteEvent>, offset: u64) -> Vec<ByteEvent> {
    let count = queue.partition_point(|e| e.offset <= offset);
    queue.drain(..count).collect()
}

impl ByteEventTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_first_byte_event(&mut self, offset: u64, stream_id: StreamId) {
        insert_ordered(
            &mut self.written,
            ByteEvent {
                offset,
                kind: ByteEventKind::FirstByte,
                stream_id: Some(stream_id),
            },
        );
    }

    pub fn add_last_byte_event(&mut self, offset: u64, stream_id: StreamId) {
        insert_ordered(
            &mut self.written,
            ByteEvent {
                offset,
                kind: ByteEventKind::LastByte,
                stream_id: Some(stream_id),
            },
        );
    }

    pub fn add_ping_event(&mut self, offset: u64, id: u64) {
        insert_ordered(
            &mut self.written,
            ByteEvent {
                offset,
                kind: ByteEventKind::Ping { id },
                stream_id: None,
            },
        );
    }

    /// Arm an acknowledgement event; fired by [`process_acked`](Self::process_acked).
    pub fn add_ack_event(&mut self, offset: u64, stream_id: StreamId) {
        insert_ordered(
            &mut self.acked,
            ByteEvent {
                offset,
                kind: ByteEventKind::LastByteAcked,
                stream_id: Some(stream_id),
            },
        );
    }

    /// Remove and return, in ascending offset order, every write event
    /// covered by `bytes_written`.
    pub fn process_written(&mut self, bytes_written: u64) -> Vec<ByteEvent> {
        take_through(&mut self.written, bytes_written)
    }

    /// Remove and return every ack event covered by `bytes_acked`.
    pub fn process_acked(&mut self, bytes_acked: u64) -> Vec<ByteEvent> {
        take_through(&mut self.acked, bytes_acked)
    }

    pub fn len(&self) -> usize {
        self.written.len() + self.acked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.written.is_empty() && self.acked.is_empty()
    }

    /// Remove every pending event so the caller can release whatever was
    /// waiting on them.
    pub fn drain(&mut self) -> Vec<ByteEvent> {
        let mut events: Vec<ByteEvent> = self.written.drain(..).collect();
        events.extend(self.acked.drain(..));
        events
    }
}
