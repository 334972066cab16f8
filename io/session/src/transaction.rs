//! Per-transaction state.
//!
//! A [`Transaction`] holds everything the session needs to know about one
//! request/response exchange: its half-close state, its send and receive
//! windows, egress that is waiting to be scheduled and ingress that is held
//! back while the application has paused it. Transactions never touch the
//! transport or the session-wide windows; the session does that for them.

use crate::codec::{CodecEvent, HeaderField, StreamId};
use crate::egress_queue::Priority;
use crate::flow_control::FlowControlWindow;
use crate::handler::Handler;

use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::fmt;

/// Role of the session on its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client side: sends requests.
    Upstream,
    /// Server side: accepts requests.
    Downstream,
}

impl Direction {
    pub fn is_upstream(self) -> bool {
        self == Direction::Upstream
    }

    pub fn is_downstream(self) -> bool {
        self == Direction::Downstream
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Upstream => "upstream",
            Direction::Downstream => "downstream",
        }
    }
}

/// Which end opened the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Initiator {
    Local,
    Remote,
}

/// Half-close state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Both halves open.
    Open,
    /// Half-closed (local) - our EOM has been encoded.
    HalfClosedLocal,
    /// Half-closed (remote) - the peer's EOM has been received.
    HalfClosedRemote,
    Closed,
}

pub struct Transaction {
    id: StreamId,
    initiator: Initiator,
    seq_no: u32,
    priority: Priority,
    assoc_stream_id: Option<StreamId>,
    state: StreamState,
    handler: Option<Box<dyn Handler>>,

    send_window: FlowControlWindow,
    recv_window: FlowControlWindow,

    headers_sent: bool,
    first_byte_tracked: bool,
    egress_body: BytesMut,
    pending_trailers: Option<Vec<HeaderField>>,
    eom_queued: bool,
    egress_paused: bool,

    ingress_paused: bool,
    deferred_ingress: VecDeque<CodecEvent>,
    deferred_body_bytes: usize,

    pending_byte_events: usize,
    aborted: bool,
}

impl Transaction {
    pub fn new(
        id: StreamId,
        initiator: Initiator,
        seq_no: u32,
        priority: Priority,
        send_window: u32,
        recv_window: u32,
    ) -> Self {
        Self {
            id,
            initiator,
            seq_no,
            priority,
            assoc_stream_id: None,
            state: StreamState::Open,
            handler: None,
            send_window: FlowControlWindow::new(send_window),
            recv_window: FlowControlWindow::new(recv_window),
            headers_sent: false,
            first_byte_tracked: false,
            egress_body: BytesMut::new(),
            pending_trailers: None,
            eom_queued: false,
            egress_paused: false,
            ingress_paused: false,
            deferred_ingress: VecDeque::new(),
            deferred_body_bytes: 0,
            pending_byte_events: 0,
            aborted: false,
        }
    }

    /// Mark this transaction as pushed on behalf of `assoc`.
    ///
    /// A locally pushed transaction has no ingress; a remotely pushed one has
    /// no egress.
    pub fn with_assoc(mut self, assoc: StreamId) -> Self {
        self.assoc_stream_id = Some(assoc);
        self.state = match self.initiator {
            Initiator::Local => StreamState::HalfClosedRemote,
            Initiator::Remote => StreamState::HalfClosedLocal,
        };
        self
    }

    pub fn with_handler(mut self, handler: Box<dyn Handler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn initiator(&self) -> Initiator {
        self.initiator
    }

    pub fn seq_no(&self) -> u32 {
        self.seq_no
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn set_priority(&mut self, priority: Priority) {
        self.priority = priority;
    }

    pub fn assoc_stream_id(&self) -> Option<StreamId> {
        self.assoc_stream_id
    }

    pub fn is_pushed(&self) -> bool {
        self.assoc_stream_id.is_some()
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn is_ingress_complete(&self) -> bool {
        matches!(
            self.state,
            StreamState::HalfClosedRemote | StreamState::Closed
        )
    }

    pub fn is_egress_complete(&self) -> bool {
        matches!(self.state, StreamState::HalfClosedLocal | StreamState::Closed)
    }

    pub fn mark_ingress_complete(&mut self) {
        self.state = match self.state {
            StreamState::Open => StreamState::HalfClosedRemote,
            StreamState::HalfClosedLocal => StreamState::Closed,
            other => other,
        };
        self.deferred_ingress.clear();
        self.deferred_body_bytes = 0;
    }

    pub fn mark_egress_complete(&mut self) {
        self.state = match self.state {
            StreamState::Open => StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote => StreamState::Closed,
            other => other,
        };
        self.egress_body.clear();
        self.pending_trailers = None;
        self.eom_queued = false;
    }

    /// Close both halves and drop anything buffered.
    pub fn mark_closed(&mut self) {
        self.mark_ingress_complete();
        self.mark_egress_complete();
    }

    pub fn has_handler(&self) -> bool {
        self.handler.is_some()
    }

    pub fn set_handler(&mut self, handler: Box<dyn Handler>) {
        self.handler = Some(handler);
    }

    pub(crate) fn take_handler(&mut self) -> Option<Box<dyn Handler>> {
        self.handler.take()
    }

    pub(crate) fn handler_mut(&mut self) -> Option<&mut dyn Handler> {
        self.handler.as_mut().map(|h| h.as_mut() as &mut dyn Handler)
    }

    pub fn send_window(&self) -> &FlowControlWindow {
        &self.send_window
    }

    pub fn send_window_mut(&mut self) -> &mut FlowControlWindow {
        &mut self.send_window
    }

    pub fn recv_window(&self) -> &FlowControlWindow {
        &self.recv_window
    }

    pub fn recv_window_mut(&mut self) -> &mut FlowControlWindow {
        &mut self.recv_window
    }

    pub fn headers_sent(&self) -> bool {
        self.headers_sent
    }

    pub(crate) fn mark_headers_sent(&mut self) {
        self.headers_sent = true;
    }

    /// Returns true the first time egress bytes are attributed to this
    /// transaction.
    pub(crate) fn track_first_byte(&mut self) -> bool {
        !std::mem::replace(&mut self.first_byte_tracked, true)
    }

    pub(crate) fn queue_body(&mut self, data: &[u8]) {
        self.egress_body.extend_from_slice(data);
    }

    pub(crate) fn queue_trailers(&mut self, trailers: Vec<HeaderField>) {
        self.pending_trailers = Some(trailers);
    }

    pub(crate) fn queue_eom(&mut self) {
        self.eom_queued = true;
    }

    pub fn eom_queued(&self) -> bool {
        self.eom_queued
    }

    pub fn egress_body_len(&self) -> usize {
        self.egress_body.len()
    }

    pub(crate) fn take_body(&mut self, max: usize) -> Bytes {
        let len = max.min(self.egress_body.len());
        self.egress_body.split_to(len).freeze()
    }

    pub(crate) fn take_trailers(&mut self) -> Option<Vec<HeaderField>> {
        self.pending_trailers.take()
    }

    pub fn has_pending_trailers(&self) -> bool {
        self.pending_trailers.is_some()
    }

    /// True if queued egress is waiting for the scheduler.
    pub fn has_pending_egress(&self) -> bool {
        !self.is_egress_complete()
            && (!self.egress_body.is_empty() || self.pending_trailers.is_some() || self.eom_queued)
    }

    pub fn is_egress_paused(&self) -> bool {
        self.egress_paused
    }

    /// Returns true if the paused state changed.
    pub(crate) fn set_egress_paused(&mut self, paused: bool) -> bool {
        std::mem::replace(&mut self.egress_paused, paused) != paused
    }

    pub fn is_ingress_paused(&self) -> bool {
        self.ingress_paused
    }

    /// Returns true if the paused state changed.
    pub(crate) fn set_ingress_paused(&mut self, paused: bool) -> bool {
        std::mem::replace(&mut self.ingress_paused, paused) != paused
    }

    /// Hold an ingress event until ingress is resumed.
    pub(crate) fn defer_ingress(&mut self, event: CodecEvent) {
        if let CodecEvent::Body { data, .. } = &event {
            self.deferred_body_bytes += data.len();
        }
        self.deferred_ingress.push_back(event);
    }

    pub(crate) fn next_deferred_ingress(&mut self) -> Option<CodecEvent> {
        let event = self.deferred_ingress.pop_front()?;
        if let CodecEvent::Body { data, .. } = &event {
            self.deferred_body_bytes -= data.len();
        }
        Some(event)
    }

    pub fn has_deferred_ingress(&self) -> bool {
        !self.deferred_ingress.is_empty()
    }

    /// Body bytes held while ingress is paused.
    pub fn deferred_body_bytes(&self) -> usize {
        self.deferred_body_bytes
    }

    pub fn pending_byte_events(&self) -> usize {
        self.pending_byte_events
    }

    pub(crate) fn add_byte_event(&mut self) {
        self.pending_byte_events += 1;
    }

    pub(crate) fn byte_event_done(&mut self) {
        self.pending_byte_events = self.pending_byte_events.saturating_sub(1);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub(crate) fn mark_aborted(&mut self) {
        self.aborted = true;
        self.mark_closed();
    }

    /// Both halves are done and no byte event still refers to it.
    pub fn is_detachable(&self) -> bool {
        self.state == StreamState::Closed && self.pending_byte_events == 0
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("initiator", &self.initiator)
            .field("seq_no", &self.seq_no)
            .field("priority", &self.priority)
            .field("assoc_stream_id", &self.assoc_stream_id)
            .field("state", &self.state)
            .field("has_handler", &self.handler.is_some())
            .field("pending_byte_events", &self.pending_byte_events)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn txn(id: u32) -> Transaction {
        Transaction::new(StreamId::new(id), Initiator::Local, 0, 3, 65535, 65535)
    }

    #[test]
    fn test_lifecycle() {
        let mut t = txn(1);
        assert_eq!(t.state(), StreamState::Open);

        t.mark_egress_complete();
        assert_eq!(t.state(), StreamState::HalfClosedLocal);
        assert!(t.is_egress_complete());
        assert!(!t.is_ingress_complete());

        t.mark_ingress_complete();
        assert_eq!(t.state(), StreamState::Closed);
        assert!(t.is_detachable());
    }

    #[test]
    fn test_lifecycle_ingress_first() {
        let mut t = txn(1);
        t.mark_ingress_complete();
        assert_eq!(t.state(), StreamState::HalfClosedRemote);
        t.mark_egress_complete();
        assert_eq!(t.state(), StreamState::Closed);
    }

    #[test]
    fn test_byte_events_block_detach() {
        let mut t = txn(1);
        t.add_byte_event();
        t.mark_closed();
        assert!(!t.is_detachable());
        t.byte_event_done();
        assert!(t.is_detachable());
    }

    #[test]
    fn test_pushed_halves() {
        let local = txn(2).with_assoc(StreamId::new(1));
        assert!(local.is_pushed());
        assert!(local.is_ingress_complete());
        assert!(!local.is_egress_complete());

        let remote = Transaction::new(StreamId::new(2), Initiator::Remote, 0, 3, 100, 100)
            .with_assoc(StreamId::new(1));
        assert!(remote.is_egress_complete());
        assert!(!remote.is_ingress_complete());
    }

    #[test]
    fn test_pending_egress() {
        let mut t = txn(1);
        assert!(!t.has_pending_egress());
        t.queue_body(b"hello world");
        assert!(t.has_pending_egress());

        assert_eq!(t.take_body(5), Bytes::from_static(b"hello"));
        assert_eq!(t.egress_body_len(), 6);
        assert_eq!(t.take_body(100), Bytes::from_static(b" world"));
        assert!(!t.has_pending_egress());

        t.queue_eom();
        assert!(t.has_pending_egress());
        t.mark_egress_complete();
        assert!(!t.has_pending_egress());
        assert!(!t.eom_queued());
    }

    #[test]
    fn test_deferred_ingress_accounting() {
        let mut t = txn(1);
        assert!(t.set_ingress_paused(true));
        assert!(!t.set_ingress_paused(true));

        t.defer_ingress(CodecEvent::Body {
            stream_id: StreamId::new(1),
            data: Bytes::from_static(b"abcd"),
        });
        t.defer_ingress(CodecEvent::MessageComplete {
            stream_id: StreamId::new(1),
            upgrade: false,
        });
        assert_eq!(t.deferred_body_bytes(), 4);

        assert!(matches!(
            t.next_deferred_ingress(),
            Some(CodecEvent::Body { .. })
        ));
        assert_eq!(t.deferred_body_bytes(), 0);
        assert!(t.has_deferred_ingress());
        assert!(matches!(
            t.next_deferred_ingress(),
            Some(CodecEvent::MessageComplete { .. })
        ));
        assert!(t.next_deferred_ingress().is_none());
    }

    #[test]
    fn test_first_byte_tracked_once() {
        let mut t = txn(1);
        assert!(t.track_first_byte());
        assert!(!t.track_first_byte());
    }
}
