//! The session orchestrator.
//!
//! A [`Session`] owns one connection. It feeds transport ingress through the
//! codec, routes the resulting events to transactions, schedules their
//! egress under flow control and backpressure, and drives the connection
//! through drain and shutdown.
//!
//! Everything is single threaded and driven by the embedding reactor:
//!
//! - ingress arrives through [`Session::on_read`], [`Session::on_read_eof`]
//!   and [`Session::on_read_error`];
//! - write outcomes arrive through [`Session::on_write_success`],
//!   [`Session::on_write_error`] and [`Session::on_bytes_acked`];
//! - timers fire through [`Session::on_transaction_timeout`],
//!   [`Session::on_write_timeout`] and [`Session::on_idle_timeout`];
//! - egress is flushed at most once per reactor pass by
//!   [`Session::run_loop_callback`] whenever [`Session::write_scheduled`]
//!   reports pending work.

use crate::byte_events::{ByteEvent, ByteEventKind, ByteEventTracker};
use crate::codec::{Codec, CodecEvent, EgressFrame, HeaderField, Message, Setting, SettingId, StreamId};
use crate::config::{DEFAULTS, SessionConfig};
use crate::drain::{CloseReason, DrainController, Phase};
use crate::egress_queue::{EgressQueue, Priority};
use crate::error::{ErrorCode, ErrorKind, FramingError, SessionError, TransactionError};
use crate::flow_control::{DEFAULT_WINDOW_SIZE, FlowControlWindow, MAX_WINDOW_SIZE};
use crate::handler::{Controller, DirectResponseHandler, Effect, Effects, Handler};
use crate::info::{InfoCallback, SessionInfo};
use crate::stats::{MetrikenStats, SessionStats};
use crate::timers::{NoTimers, Timers};
use crate::transaction::{Direction, Initiator, Transaction};
use crate::transaction_table::TransactionTable;
use crate::transport::Transport;
use crate::write_segments::{WriteFlags, WriteHandle, WriteSegmentTracker};

use bytes::BytesMut;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{debug, error, trace, warn};

pub struct Session<C: Codec, T: Transport> {
    direction: Direction,
    codec: C,
    transport: T,
    config: SessionConfig,

    controller: Option<Box<dyn Controller>>,
    info_callback: Option<Box<dyn InfoCallback>>,
    stats: Box<dyn SessionStats>,
    timers: Box<dyn Timers>,

    transactions: TransactionTable,
    egress_queue: EgressQueue,
    byte_events: ByteEventTracker,
    write_segments: WriteSegmentTracker,
    state: DrainController,

    read_buf: BytesMut,
    write_buf: BytesMut,

    // session-scope windows
    send_window: FlowControlWindow,
    recv_window: FlowControlWindow,
    // initial send window for new streams, as announced by the peer
    stream_send_window: u32,

    max_outgoing_config: u32,
    max_outgoing_remote: u32,
    max_incoming: u32,
    max_push: u32,

    bytes_written: u64,
    bytes_scheduled: u64,
    pending_read_size: usize,

    writes_paused: bool,
    write_scheduled: bool,
    write_timeout_armed: bool,
    in_loop_callback: bool,
    ingress_seen: bool,
    goaway_sent: bool,
    destroyed: bool,

    highest_incoming_id: StreamId,
    next_ping_id: u64,
    pings: HashMap<u64, Option<Instant>>,

    pending_effects: VecDeque<(StreamId, Effect)>,
    applying_effects: bool,
}

impl<C: Codec, T: Transport> Session<C, T> {
    /// Bind a session to an already connected transport.
    pub fn new(direction: Direction, codec: C, transport: T, config: SessionConfig) -> Self {
        Self {
            direction,
            codec,
            transport,
            max_outgoing_config: config.max_concurrent_outgoing_streams,
            max_outgoing_remote: DEFAULTS.remote_outgoing_streams,
            max_incoming: config.max_concurrent_incoming_streams,
            max_push: config.max_concurrent_push_transactions,
            config,
            controller: None,
            info_callback: None,
            stats: Box::new(MetrikenStats),
            timers: Box::new(NoTimers),
            transactions: TransactionTable::new(),
            egress_queue: EgressQueue::new(),
            byte_events: ByteEventTracker::new(),
            write_segments: WriteSegmentTracker::new(),
            state: DrainController::new(),
            read_buf: BytesMut::new(),
            write_buf: BytesMut::new(),
            send_window: FlowControlWindow::new(DEFAULT_WINDOW_SIZE),
            recv_window: FlowControlWindow::new(DEFAULT_WINDOW_SIZE),
            stream_send_window: DEFAULT_WINDOW_SIZE,
            bytes_written: 0,
            bytes_scheduled: 0,
            pending_read_size: 0,
            writes_paused: false,
            write_scheduled: false,
            write_timeout_armed: false,
            in_loop_callback: false,
            ingress_seen: false,
            goaway_sent: false,
            destroyed: false,
            highest_incoming_id: StreamId::CONNECTION,
            next_ping_id: 1,
            pings: HashMap::new(),
            pending_effects: VecDeque::new(),
            applying_effects: false,
        }
    }

    pub fn set_controller(&mut self, controller: Box<dyn Controller>) {
        self.controller = Some(controller);
    }

    /// Register the lifecycle observer. It is told about the session's
    /// creation immediately.
    pub fn set_info_callback(&mut self, callback: Box<dyn InfoCallback>) {
        self.info_callback = Some(callback);
        self.notify_info(|cb, info| cb.on_create(info));
    }

    /// Replace the stats sink. Only allowed before `start`, so that every
    /// open gauge is balanced on the sink that raised it.
    pub fn set_session_stats(&mut self, stats: Box<dyn SessionStats>) {
        assert!(
            !self.state.is_started() && self.transactions.is_empty(),
            "stats sink must be set before the session starts"
        );
        self.stats = stats;
    }

    pub fn set_timers(&mut self, timers: Box<dyn Timers>) {
        self.timers = timers;
    }

    /// Arm ingress. Must be called exactly once.
    pub fn start(&mut self) {
        assert!(self.state.start(), "session started twice");
        debug!(session = %self, "starting session");
        self.stats.record_session_created();

        if let Some(controller) = self.controller.as_mut() {
            controller.attach_session();
        }
        if self.codec.is_multiplexed() {
            self.send_settings();
        }
        self.transport.resume_reads();
    }

    /// Set the receive windows announced to the peer.
    ///
    /// Must be called before any ingress has been processed.
    pub fn set_flow_control(
        &mut self,
        initial_receive_window: u32,
        receive_stream_window: u32,
        receive_session_window: u32,
    ) {
        assert!(
            !self.ingress_seen,
            "flow control must be configured before ingress is processed"
        );
        assert!(
            initial_receive_window <= MAX_WINDOW_SIZE
                && receive_stream_window <= MAX_WINDOW_SIZE
                && receive_session_window <= MAX_WINDOW_SIZE,
            "receive window above the protocol maximum"
        );
        self.config.initial_receive_window = initial_receive_window;
        self.config.receive_stream_window = receive_stream_window;
        self.config.receive_session_window = receive_session_window;
        if self.state.is_started() && self.codec.is_multiplexed() {
            self.send_settings();
        }
    }

    /// Set the local outgoing stream limit. Only valid before `start`; the
    /// peer's own limit can lower the effective value later.
    pub fn set_max_concurrent_outgoing_streams(&mut self, max: u32) {
        assert!(
            !self.state.is_started(),
            "outgoing stream limit must be set before start"
        );
        self.max_outgoing_config = max;
    }

    pub fn set_max_concurrent_incoming_streams(&mut self, max: u32) {
        self.max_incoming = max;
        if self.state.is_started() && self.codec.is_multiplexed() {
            self.send_settings();
        }
    }

    pub fn set_max_concurrent_push_transactions(&mut self, max: u32) {
        self.max_push = max;
    }

    // --- queries ---

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    pub fn codec_mut(&mut self) -> &mut C {
        &mut self.codec
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.local_addr()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.transport.peer_addr()
    }

    pub fn outgoing_streams(&self) -> usize {
        self.transactions.outgoing()
    }

    pub fn incoming_streams(&self) -> usize {
        self.transactions.incoming()
    }

    pub fn pushed_transactions(&self) -> usize {
        self.transactions.pushed()
    }

    pub fn number_of_transactions(&self) -> usize {
        self.transactions.len()
    }

    pub fn transaction(&self, id: StreamId) -> Option<&Transaction> {
        self.transactions.get(id)
    }

    /// Effective outgoing stream limit.
    pub fn max_concurrent_outgoing_streams(&self) -> u32 {
        self.max_outgoing_config.min(self.max_outgoing_remote)
    }

    pub fn max_concurrent_outgoing_streams_remote(&self) -> u32 {
        self.max_outgoing_remote
    }

    pub fn max_concurrent_incoming_streams(&self) -> u32 {
        self.max_incoming
    }

    pub fn max_concurrent_push_transactions(&self) -> u32 {
        self.max_push
    }

    /// True if another outgoing transaction fits under both the local and
    /// the remote limit.
    pub fn supports_more_transactions(&self) -> bool {
        self.transactions.outgoing() < self.max_outgoing_config as usize
            && self.transactions.outgoing() < self.max_outgoing_remote as usize
    }

    pub fn is_draining(&self) -> bool {
        self.state.is_draining()
    }

    pub fn is_busy(&self) -> bool {
        !self.transactions.is_empty()
    }

    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.state.close_reason()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn bytes_scheduled(&self) -> u64 {
        self.bytes_scheduled
    }

    /// Bytes handed to the transport and not yet confirmed.
    pub fn pending_write_size(&self) -> u64 {
        self.write_segments.pending_bytes()
    }

    pub fn outstanding_writes(&self) -> usize {
        self.write_segments.len()
    }

    /// Ingress body bytes buffered for paused transactions.
    pub fn pending_read_size(&self) -> usize {
        self.pending_read_size
    }

    pub fn pending_byte_events(&self) -> usize {
        self.byte_events.len()
    }

    pub fn is_egress_paused(&self) -> bool {
        self.writes_paused
    }

    pub fn is_reads_paused(&self) -> bool {
        self.state.reads_paused()
    }

    pub fn send_window(&self) -> &FlowControlWindow {
        &self.send_window
    }

    pub fn recv_window(&self) -> &FlowControlWindow {
        &self.recv_window
    }

    /// True if `run_loop_callback` has work to do.
    pub fn write_scheduled(&self) -> bool {
        self.write_scheduled
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            direction: self.direction,
            local_addr: self.transport.local_addr(),
            peer_addr: self.transport.peer_addr(),
            outgoing_streams: self.transactions.outgoing(),
            incoming_streams: self.transactions.incoming(),
        }
    }

    // --- transaction creation ---

    /// Open a new outgoing transaction on an upstream session.
    pub fn new_transaction(&mut self, handler: Box<dyn Handler>) -> Result<StreamId, SessionError> {
        if !self.direction.is_upstream() {
            return Err(SessionError::WrongDirection("upstream"));
        }
        self.ensure_open()?;
        if self.state.is_draining() {
            return Err(SessionError::Draining);
        }
        if !self.supports_more_transactions() {
            return Err(SessionError::TooManyStreams);
        }

        let id = self.codec.create_stream_id();
        let seq_no = self.transactions.next_seq_no();
        let txn = Transaction::new(
            id,
            Initiator::Local,
            seq_no,
            self.config.default_priority,
            self.stream_send_window,
            self.config.initial_receive_window,
        )
        .with_handler(handler);
        self.add_transaction(txn)?;
        Ok(id)
    }

    /// Push a transaction associated with the incoming transaction `assoc`
    /// on a downstream session.
    pub fn new_pushed_transaction(
        &mut self,
        assoc: StreamId,
        handler: Box<dyn Handler>,
        priority: Option<Priority>,
    ) -> Result<StreamId, SessionError> {
        if !self.direction.is_downstream() {
            return Err(SessionError::WrongDirection("downstream"));
        }
        if !self.codec.supports_push() {
            return Err(SessionError::PushNotSupported);
        }
        self.ensure_open()?;
        if self.state.is_draining() {
            return Err(SessionError::Draining);
        }
        let parent = self
            .transactions
            .get(assoc)
            .ok_or(SessionError::UnknownStream(assoc))?;
        if parent.is_egress_complete() {
            return Err(SessionError::EgressComplete(assoc));
        }
        if self.transactions.pushed() >= self.max_push as usize {
            return Err(SessionError::TooManyPushes);
        }
        // pushes are outgoing streams but only the peer's limit applies
        if self.transactions.outgoing() >= self.max_outgoing_remote as usize {
            return Err(SessionError::TooManyStreams);
        }

        let id = self.codec.create_stream_id();
        let seq_no = self.transactions.next_seq_no();
        let txn = Transaction::new(
            id,
            Initiator::Local,
            seq_no,
            priority.unwrap_or(self.config.default_priority),
            self.stream_send_window,
            self.config.initial_receive_window,
        )
        .with_assoc(assoc)
        .with_handler(handler);
        self.add_transaction(txn)?;
        Ok(id)
    }

    fn add_transaction(&mut self, mut txn: Transaction) -> Result<(), SessionError> {
        let id = txn.id();
        let was_idle = self.transactions.is_empty();
        txn.set_egress_paused(self.writes_paused);
        if let Err(e) = self.transactions.add(txn) {
            error!(stream_id = %id, "codec produced a duplicate stream id");
            return Err(e);
        }
        trace!(stream_id = %id, "transaction added");
        self.stats.record_transaction_opened();
        if was_idle {
            self.notify_info(|cb, info| cb.on_activate_connection(info));
        }
        self.arm_transaction_timeout(id);
        Ok(())
    }

    // --- egress operations ---

    /// Encode headers for `id`. Returns the bytes generated.
    pub fn send_headers(&mut self, id: StreamId, message: Message) -> Result<usize, SessionError> {
        self.ensure_writable()?;
        let txn = self
            .transactions
            .get_mut(id)
            .ok_or(SessionError::UnknownStream(id))?;
        if txn.is_egress_complete() || txn.eom_queued() {
            return Err(SessionError::EgressComplete(id));
        }
        if let Some(priority) = message.priority {
            txn.set_priority(priority);
        }
        let first_headers = !txn.headers_sent();

        let start = self.bytes_scheduled + self.write_buf.len() as u64;
        let bytes = self.codec.encode(
            &EgressFrame::Headers {
                stream_id: id,
                message: &message,
                assoc_stream_id: txn.assoc_stream_id(),
            },
            &mut self.write_buf,
        );
        txn.mark_headers_sent();
        if bytes > 0 && txn.track_first_byte() {
            self.byte_events.add_first_byte_event(start + 1, id);
            txn.add_byte_event();
        }
        let local = txn.initiator() == Initiator::Local && !txn.is_ingress_complete();
        trace!(stream_id = %id, bytes, "headers encoded");

        if first_headers && local {
            self.grow_stream_receive_window(id);
        }
        self.schedule_write();
        Ok(bytes)
    }

    /// Queue body bytes for `id`.
    pub fn send_body(&mut self, id: StreamId, data: &[u8]) -> Result<(), SessionError> {
        let txn = self.writable_transaction(id)?;
        if txn.has_pending_trailers() {
            return Err(SessionError::EgressComplete(id));
        }
        if data.is_empty() {
            return Ok(());
        }
        txn.queue_body(data);
        self.queue_egress(id);
        Ok(())
    }

    pub fn send_trailers(
        &mut self,
        id: StreamId,
        trailers: Vec<HeaderField>,
    ) -> Result<(), SessionError> {
        let txn = self.writable_transaction(id)?;
        txn.queue_trailers(trailers);
        self.queue_egress(id);
        Ok(())
    }

    /// Queue the end of message for `id`.
    pub fn send_eom(&mut self, id: StreamId) -> Result<(), SessionError> {
        let txn = self.writable_transaction(id)?;
        txn.queue_eom();
        self.queue_egress(id);
        Ok(())
    }

    /// Abort `id`. Returns the bytes generated for the abort frame.
    ///
    /// Protocols without per-stream aborts can only abort by resetting the
    /// connection.
    pub fn send_abort(&mut self, id: StreamId, code: ErrorCode) -> Result<usize, SessionError> {
        let txn = self
            .transactions
            .get_mut(id)
            .ok_or(SessionError::UnknownStream(id))?;
        if txn.is_aborted() {
            return Ok(0);
        }
        debug!(stream_id = %id, code = %code, "aborting transaction");

        let mut bytes = 0;
        let multiplexed = self.codec.is_multiplexed();
        if multiplexed && !self.state.writes_shutdown() {
            bytes = self.codec.encode(
                &EgressFrame::Abort {
                    stream_id: id,
                    code,
                },
                &mut self.write_buf,
            );
            self.schedule_write();
        }
        self.close_halves(id, true, true);
        if let Some(txn) = self.transactions.get_mut(id) {
            txn.mark_aborted();
        }
        self.maybe_detach(id);

        if !multiplexed && !self.state.is_reset() {
            self.state.set_close_reason(CloseReason::Reset);
            self.shutdown_transport_with_reset(ErrorKind::ConnectionReset(code));
        }
        Ok(bytes)
    }

    /// Stop delivering ingress to `id`; events are buffered until resumed.
    pub fn pause_ingress(&mut self, id: StreamId) -> Result<(), SessionError> {
        let txn = self
            .transactions
            .get_mut(id)
            .ok_or(SessionError::UnknownStream(id))?;
        if txn.set_ingress_paused(true) {
            trace!(stream_id = %id, "ingress paused");
            self.notify_info(|cb, info| cb.on_ingress_paused(info));
        }
        Ok(())
    }

    /// Resume ingress for `id`, replaying anything buffered meanwhile.
    pub fn resume_ingress(&mut self, id: StreamId) -> Result<(), SessionError> {
        let txn = self
            .transactions
            .get_mut(id)
            .ok_or(SessionError::UnknownStream(id))?;
        if txn.set_ingress_paused(false) {
            trace!(stream_id = %id, "ingress resumed");
            self.replay_deferred_ingress(id);
        }
        Ok(())
    }

    /// Send a liveness probe. Returns the bytes generated, or 0 if the
    /// protocol has no ping.
    pub fn send_ping(&mut self) -> usize {
        if !self.codec.supports_ping() || self.ensure_writable().is_err() {
            return 0;
        }
        let id = self.next_ping_id;
        self.next_ping_id += 1;
        let bytes = self
            .codec
            .encode(&EgressFrame::Ping { id, reply: false }, &mut self.write_buf);
        if bytes > 0 {
            let end = self.bytes_scheduled + self.write_buf.len() as u64;
            self.byte_events.add_ping_event(end, id);
            self.pings.insert(id, None);
            self.schedule_write();
        }
        bytes
    }

    // --- drain and shutdown ---

    /// Stop admitting transactions. An upstream session shuts itself down
    /// once its last transaction finishes; a downstream one waits for an
    /// explicit shutdown.
    pub fn drain(&mut self) {
        if self.state.begin_drain() {
            debug!(session = %self, "draining");
            self.send_goaway(ErrorCode::NoError);
        }
        self.check_for_shutdown();
    }

    pub fn notify_pending_shutdown(&mut self) {
        self.drain();
    }

    /// Drain, and close right away if nothing is in flight.
    pub fn close_when_idle(&mut self) {
        self.drain();
        if self.transactions.is_empty() && !self.destroyed {
            self.shutdown_transport(true, true);
        }
    }

    /// Tear the connection down immediately.
    pub fn drop_connection(&mut self) {
        self.state.set_close_reason(CloseReason::Dropped);
        self.shutdown_transport_with_reset(ErrorKind::Dropped);
    }

    /// Gracefully close the requested directions. Idempotent.
    pub fn shutdown_transport(&mut self, shutdown_reads: bool, shutdown_writes: bool) {
        self.shutdown_transport_inner(shutdown_reads, shutdown_writes, ErrorKind::Shutdown);
    }

    fn shutdown_transport_inner(&mut self, reads: bool, writes: bool, read_kind: ErrorKind) {
        if self.destroyed {
            return;
        }
        self.state.set_close_reason(CloseReason::Shutdown);

        let reads_closed = reads && self.state.shutdown_reads();
        if reads_closed {
            debug!(session = %self, "shutting down reads");
            self.read_buf.clear();
            self.transport.shutdown_read();
        }

        let writes_closed =
            writes && !self.state.writes_shutdown() && !self.state.writes_draining();
        if writes_closed {
            self.send_goaway(ErrorCode::NoError);
            if self.write_segments.is_empty() && self.write_buf.is_empty() {
                debug!(session = %self, "shutting down writes");
                self.state.shutdown_writes();
                self.transport.shutdown_write();
            } else {
                debug!(session = %self, "draining writes before shutdown");
                self.state.begin_writes_draining();
                self.schedule_write();
            }
        }

        if reads_closed || writes_closed {
            for id in self.transactions.snapshot() {
                let Some(txn) = self.transactions.get(id) else {
                    continue;
                };
                let ingress = reads_closed && !txn.is_ingress_complete();
                let egress = writes_closed && !txn.is_egress_complete();
                let kind = if ingress {
                    read_kind.clone()
                } else {
                    ErrorKind::Write
                };
                let error = TransactionError::both(kind).restricted_to(ingress, egress);

                self.close_halves(id, reads_closed, writes_closed);
                if let Some(error) = error {
                    self.stats.record_transaction_error();
                    self.dispatch(id, |handler, effects| handler.on_error(&error, effects));
                }
                self.maybe_detach(id);
            }
        }
        self.check_for_shutdown();
    }

    /// Abort the connection: drop unflushed egress, fail every live
    /// transaction with `kind` and reset the transport.
    pub fn shutdown_transport_with_reset(&mut self, kind: ErrorKind) {
        if self.destroyed {
            return;
        }
        if self.state.mark_reset() {
            warn!(session = %self, error = %kind, "resetting connection");
            self.state.set_close_reason(CloseReason::Reset);
            self.stats.record_reset();
            self.transport.close_with_reset();
        }

        self.write_buf.clear();
        self.read_buf.clear();
        self.egress_queue.clear();
        self.write_segments.detach_all();
        self.cancel_write_timeout();
        self.pings.clear();
        for event in self.byte_events.drain() {
            if let Some(id) = event.stream_id
                && let Some(txn) = self.transactions.get_mut(id)
            {
                txn.byte_event_done();
            }
        }

        let error = TransactionError::both(kind);
        for id in self.transactions.snapshot() {
            let Some(txn) = self.transactions.get(id) else {
                continue;
            };
            let aborted = txn.is_aborted();
            // a finished transaction still waiting on its bytes hears about
            // the egress side
            let scoped = error
                .restricted_to(!txn.is_ingress_complete(), !txn.is_egress_complete())
                .unwrap_or_else(|| TransactionError::egress(error.kind.clone()));

            self.close_halves(id, true, true);
            if !aborted {
                self.stats.record_transaction_error();
                self.dispatch(id, |handler, effects| handler.on_error(&scoped, effects));
                if let Some(txn) = self.transactions.get_mut(id) {
                    txn.mark_aborted();
                }
            }
            self.maybe_detach(id);
        }
        self.pending_effects.clear();
        self.check_for_shutdown();
    }

    // --- reactor entry points: ingress ---

    /// Transport delivered ingress bytes.
    pub fn on_read(&mut self, data: &[u8]) {
        if self.destroyed || self.state.reads_shutdown() || self.state.ingress_error() {
            trace!(bytes = data.len(), "ignoring ingress on closed session");
            return;
        }
        self.ingress_seen = true;
        self.stats.record_bytes_read(data.len());
        self.notify_info(|cb, info| cb.on_read(info, data.len()));
        self.read_buf.extend_from_slice(data);

        match self.codec.decode(&mut self.read_buf) {
            Ok(events) => {
                for event in events {
                    if self.destroyed || self.state.ingress_error() || self.state.reads_shutdown() {
                        break;
                    }
                    self.on_codec_event(event);
                }
            }
            Err(e) => self.on_framing_error(e),
        }
        self.apply_effects();
        self.check_for_shutdown();
    }

    /// The peer closed its write half.
    pub fn on_read_eof(&mut self) {
        debug!(session = %self, "read eof");
        self.state.set_close_reason(CloseReason::ReadEof);
        let writes = self.transactions.is_empty();
        self.shutdown_transport_inner(true, writes, ErrorKind::Eof);
    }

    pub fn on_read_error(&mut self, error: &std::io::Error) {
        warn!(session = %self, error = %error, "read error");
        self.state.set_close_reason(CloseReason::ReadError);
        let message = error.to_string();
        self.notify_info(|cb, info| cb.on_ingress_error(info, &message));
        let writes = self.transactions.is_empty();
        self.shutdown_transport_inner(true, writes, ErrorKind::Read);
    }

    fn on_framing_error(&mut self, error: FramingError) {
        warn!(session = %self, error = %error, "framing error");
        self.stats.record_framing_error();
        self.state.set_ingress_error();
        self.state.set_close_reason(CloseReason::ParseError);
        let message = error.to_string();
        self.notify_info(|cb, info| cb.on_ingress_error(info, &message));
        if let Some(controller) = self.controller.as_mut() {
            controller.on_framing_error(&error);
        }
        self.send_goaway(error.code);
        self.shutdown_transport_inner(true, true, ErrorKind::Malformed(error.message));
    }

    fn on_codec_event(&mut self, event: CodecEvent) {
        match event {
            CodecEvent::MessageBegin { stream_id } => self.on_message_begin(stream_id),
            CodecEvent::PushMessageBegin {
                stream_id,
                assoc_stream_id,
            } => self.on_push_message_begin(stream_id, assoc_stream_id),
            event @ (CodecEvent::HeadersComplete { .. }
            | CodecEvent::Body { .. }
            | CodecEvent::Trailers { .. }
            | CodecEvent::MessageComplete { .. }) => self.on_stream_ingress(event),
            CodecEvent::StreamError {
                stream_id,
                message,
                new_transaction,
            } => self.on_stream_error(stream_id, message, new_transaction),
            CodecEvent::Abort { stream_id, code } => self.on_abort(stream_id, code),
            CodecEvent::GoAway {
                last_good_stream_id,
                code,
            } => self.on_goaway(last_good_stream_id, code),
            CodecEvent::PingRequest { id } => {
                if self.codec.supports_ping() && self.ensure_writable().is_ok() {
                    self.codec
                        .encode(&EgressFrame::Ping { id, reply: true }, &mut self.write_buf);
                    self.schedule_write();
                }
            }
            CodecEvent::PingReply { id } => match self.pings.remove(&id) {
                Some(Some(sent_at)) => {
                    let latency = sent_at.elapsed();
                    if let Some(cb) = self.info_callback.as_mut() {
                        cb.on_ping_reply(latency);
                    }
                }
                Some(None) => trace!(ping_id = id, "ping reply before ping was flushed"),
                None => debug!(ping_id = id, "unexpected ping reply"),
            },
            CodecEvent::WindowUpdate { stream_id, amount } => {
                self.on_window_update(stream_id, amount)
            }
            CodecEvent::Settings(settings) => self.on_settings(&settings),
        }
    }

    fn on_message_begin(&mut self, id: StreamId) {
        if let Some(txn) = self.transactions.get(id) {
            if txn.initiator() == Initiator::Local && !txn.is_ingress_complete() {
                trace!(stream_id = %id, "response begins");
                return;
            }
            warn!(stream_id = %id, "message begin for a live stream");
            self.stream_error(
                id,
                TransactionError::both(ErrorKind::Malformed("duplicate message begin".into())),
                ErrorCode::ProtocolError,
            );
            return;
        }
        if self.direction.is_upstream() {
            self.on_invalid_stream(id, ErrorCode::ProtocolError);
            return;
        }
        if self.state.is_draining() && self.codec.is_multiplexed() {
            debug!(stream_id = %id, "refusing stream while draining");
            self.refuse_stream(id);
            return;
        }
        if self.transactions.incoming() >= self.max_incoming as usize {
            debug!(stream_id = %id, limit = self.max_incoming, "incoming stream limit reached");
            self.refuse_stream(id);
            return;
        }
        if self.create_incoming(id, None, None).is_ok() {
            self.notify_info(|cb, info| cb.on_request_begin(info));
        }
    }

    fn on_push_message_begin(&mut self, id: StreamId, assoc: StreamId) {
        if self.direction.is_downstream() || self.transactions.contains(id) {
            self.on_invalid_stream(id, ErrorCode::ProtocolError);
            return;
        }
        if !self.transactions.contains(assoc) {
            warn!(stream_id = %id, assoc_stream_id = %assoc, "push for unknown stream");
            self.on_invalid_stream(id, ErrorCode::ProtocolError);
            return;
        }
        if self.transactions.pushed() >= self.max_push as usize
            || self.transactions.incoming() >= self.max_incoming as usize
        {
            self.refuse_stream(id);
            return;
        }
        let handler = self
            .transactions
            .get_mut(assoc)
            .and_then(|parent| parent.handler_mut())
            .and_then(|parent| parent.on_pushed_transaction(id));
        match handler {
            Some(handler) => {
                let _ = self.create_incoming(id, Some(assoc), Some(handler));
            }
            None => {
                debug!(stream_id = %id, "push declined");
                self.refuse_stream(id);
            }
        }
    }

    fn create_incoming(
        &mut self,
        id: StreamId,
        assoc: Option<StreamId>,
        handler: Option<Box<dyn Handler>>,
    ) -> Result<(), SessionError> {
        let seq_no = self.transactions.next_seq_no();
        let mut txn = Transaction::new(
            id,
            Initiator::Remote,
            seq_no,
            self.config.default_priority,
            self.stream_send_window,
            self.config.initial_receive_window,
        );
        if let Some(assoc) = assoc {
            txn = txn.with_assoc(assoc);
        }
        if let Some(handler) = handler {
            txn.set_handler(handler);
        }
        self.add_transaction(txn)?;
        if id > self.highest_incoming_id {
            self.highest_incoming_id = id;
        }
        self.grow_stream_receive_window(id);
        Ok(())
    }

    fn on_stream_ingress(&mut self, event: CodecEvent) {
        let Some(id) = event.stream_id() else {
            return;
        };
        let stream_fc = self.codec.supports_stream_flow_control();
        let session_fc = self.codec.supports_session_flow_control();

        let body_len = match &event {
            CodecEvent::Body { data, .. } => data.len(),
            _ => 0,
        };
        if session_fc
            && body_len > 0
            && let Err(e) = self.recv_window.reserve(body_len as u32)
        {
            warn!(error = %e, "peer overran the session receive window");
            self.state.set_close_reason(CloseReason::FlowControl);
            self.on_framing_error(FramingError::new(
                ErrorCode::FlowControlError,
                "session receive window exceeded",
            ));
            return;
        }

        let Some(txn) = self.transactions.get_mut(id) else {
            self.credit_session(body_len as u32);
            self.on_invalid_stream(id, ErrorCode::StreamClosed);
            return;
        };
        if txn.is_ingress_complete() {
            warn!(stream_id = %id, "ingress after message complete");
            self.credit_session(body_len as u32);
            self.stream_error(
                id,
                TransactionError::ingress(ErrorKind::Malformed("ingress after EOM".into())),
                ErrorCode::StreamClosed,
            );
            return;
        }
        if stream_fc
            && body_len > 0
            && let Err(e) = txn.recv_window_mut().reserve(body_len as u32)
        {
            warn!(stream_id = %id, error = %e, "peer overran the stream receive window");
            self.credit_session(body_len as u32);
            self.stream_error(
                id,
                TransactionError::both(ErrorKind::FlowControl),
                ErrorCode::FlowControlError,
            );
            return;
        }

        self.arm_transaction_timeout(id);

        let Some(txn) = self.transactions.get_mut(id) else {
            return;
        };
        if txn.is_ingress_paused() || txn.has_deferred_ingress() {
            txn.defer_ingress(event);
            self.pending_read_size += body_len;
            self.check_read_buffer_limit();
            return;
        }
        self.deliver_ingress(id, event);
    }

    fn deliver_ingress(&mut self, id: StreamId, event: CodecEvent) {
        match event {
            CodecEvent::HeadersComplete { message, .. } => {
                let Some(txn) = self.transactions.get_mut(id) else {
                    return;
                };
                if !txn.has_handler() {
                    let handler = self
                        .controller
                        .as_mut()
                        .map(|controller| controller.request_handler(id, &message));
                    match handler {
                        Some(handler) => txn.set_handler(handler),
                        None => {
                            warn!(stream_id = %id, "no controller to handle request");
                            let _ = self.send_abort(id, ErrorCode::RefusedStream);
                            return;
                        }
                    }
                }
                if let Some(priority) = message.priority {
                    self.reprioritize(id, priority);
                }
                self.notify_info(|cb, info| cb.on_ingress_message(info));
                self.dispatch(id, |handler, effects| handler.on_headers(message, effects));
            }
            CodecEvent::Body { data, .. } => {
                let len = data.len() as u32;
                self.dispatch(id, |handler, effects| handler.on_body(data, effects));
                self.credit_ingress(id, len);
            }
            CodecEvent::Trailers { trailers, .. } => {
                self.dispatch(id, |handler, effects| handler.on_trailers(trailers, effects));
            }
            CodecEvent::MessageComplete { upgrade, .. } => {
                if upgrade {
                    debug!(stream_id = %id, "protocol upgrade is not supported, ignoring");
                }
                self.close_halves(id, true, false);
                if self.direction.is_downstream() {
                    self.notify_info(|cb, info| cb.on_request_end(info));
                }
                self.dispatch(id, |handler, effects| handler.on_eom(effects));
                self.maybe_detach(id);
            }
            other => trace!(stream_id = %id, event = ?other, "not a stream ingress event"),
        }
    }

    fn replay_deferred_ingress(&mut self, id: StreamId) {
        loop {
            let Some(txn) = self.transactions.get_mut(id) else {
                break;
            };
            if txn.is_ingress_paused() {
                break;
            }
            let Some(event) = txn.next_deferred_ingress() else {
                break;
            };
            if let CodecEvent::Body { data, .. } = &event {
                self.pending_read_size -= data.len();
            }
            self.deliver_ingress(id, event);
        }
        self.check_read_buffer_limit();
    }

    fn check_read_buffer_limit(&mut self) {
        if self.pending_read_size > self.config.read_buf_limit {
            if self.state.pause_reads() {
                debug!(
                    pending = self.pending_read_size,
                    limit = self.config.read_buf_limit,
                    "read buffer limit exceeded, pausing reads"
                );
                self.transport.pause_reads();
                self.notify_info(|cb, info| cb.on_ingress_limit_exceeded(info));
            }
        } else if self.state.resume_reads() {
            debug!(pending = self.pending_read_size, "resuming reads");
            self.transport.resume_reads();
        }
    }

    /// Return receive credit for body bytes the application consumed.
    fn credit_ingress(&mut self, id: StreamId, len: u32) {
        if len == 0 {
            return;
        }
        if self.codec.supports_stream_flow_control()
            && let Some(txn) = self.transactions.get_mut(id)
            && !txn.is_ingress_complete()
        {
            txn.recv_window_mut().release(len);
            if let Some(amount) = txn.recv_window_mut().take_update() {
                self.send_window_update(id, amount);
            }
        }
        self.credit_session(len);
    }

    fn credit_session(&mut self, len: u32) {
        if len == 0 || !self.codec.supports_session_flow_control() {
            return;
        }
        self.recv_window.release(len);
        if let Some(amount) = self.recv_window.take_update() {
            self.send_window_update(StreamId::CONNECTION, amount);
        }
    }

    fn on_stream_error(&mut self, id: StreamId, message: String, new_transaction: bool) {
        warn!(stream_id = %id, error = %message, "stream error");
        let error = TransactionError::both(ErrorKind::Malformed(message));

        if self.transactions.contains(id) {
            self.stream_error(id, error, ErrorCode::ProtocolError);
            return;
        }
        if !new_transaction || self.direction.is_upstream() {
            self.on_invalid_stream(id, ErrorCode::ProtocolError);
            return;
        }

        // a request that failed to parse before it began still gets an answer
        let handler = match self.controller.as_mut() {
            Some(controller) => controller.parse_error_handler(id, &error),
            None => Some(Box::new(DirectResponseHandler::new(400)) as Box<dyn Handler>),
        };
        let Some(handler) = handler else {
            self.on_invalid_stream(id, ErrorCode::ProtocolError);
            return;
        };
        if self.create_incoming(id, None, Some(handler)).is_err() {
            return;
        }
        self.close_halves(id, true, false);
        self.stats.record_transaction_error();
        let scoped = TransactionError::egress(error.kind);
        self.dispatch(id, |handler, effects| handler.on_error(&scoped, effects));
        self.abort_if_stalled(id);
    }

    fn on_abort(&mut self, id: StreamId, code: ErrorCode) {
        if !self.transactions.contains(id) {
            trace!(stream_id = %id, "abort for unknown stream");
            return;
        }
        debug!(stream_id = %id, code = %code, "stream aborted by peer");
        let error = TransactionError::both(ErrorKind::StreamAbort(code));
        self.deliver_error(id, &error);
        self.close_halves(id, true, true);
        if let Some(txn) = self.transactions.get_mut(id) {
            txn.mark_aborted();
        }
        self.maybe_detach(id);
    }

    fn on_goaway(&mut self, last_good: StreamId, code: ErrorCode) {
        debug!(last_good_stream_id = %last_good, code = %code, "goaway received");
        self.state.set_close_reason(CloseReason::GoAway);
        self.state.begin_drain();

        for id in self.transactions.snapshot() {
            let Some(txn) = self.transactions.get(id) else {
                continue;
            };
            if txn.initiator() != Initiator::Local || txn.is_pushed() || id <= last_good {
                continue;
            }
            let error = TransactionError::both(ErrorKind::StreamUnacknowledged);
            self.deliver_error(id, &error);
            self.close_halves(id, true, true);
            if let Some(txn) = self.transactions.get_mut(id) {
                txn.mark_aborted();
            }
            self.maybe_detach(id);
        }
        self.check_for_shutdown();
    }

    fn on_window_update(&mut self, id: StreamId, amount: u32) {
        if id.is_connection_level() {
            if !self.codec.supports_session_flow_control() {
                return;
            }
            if let Err(e) = self.send_window.increase(amount) {
                warn!(error = %e, "session window overflow");
                self.state.set_close_reason(CloseReason::FlowControl);
                self.on_framing_error(FramingError::new(
                    ErrorCode::FlowControlError,
                    "session send window overflow",
                ));
                return;
            }
            trace!(amount, window = self.send_window.available(), "session window update");
            if !self.egress_queue.is_empty() {
                self.schedule_write();
            }
            return;
        }

        let Some(txn) = self.transactions.get_mut(id) else {
            trace!(stream_id = %id, "window update for unknown stream");
            return;
        };
        if let Err(e) = txn.send_window_mut().increase(amount) {
            warn!(stream_id = %id, error = %e, "stream window overflow");
            self.stream_error(
                id,
                TransactionError::both(ErrorKind::FlowControl),
                ErrorCode::FlowControlError,
            );
            return;
        }
        if txn.has_pending_egress() {
            self.queue_egress(id);
        }
    }

    fn on_settings(&mut self, settings: &[Setting]) {
        for setting in settings {
            match setting.id {
                SettingId::MaxConcurrentStreams => {
                    let was_full = !self.supports_more_transactions();
                    self.max_outgoing_remote = setting.value;
                    let full = !self.supports_more_transactions();
                    debug!(limit = setting.value, "peer outgoing stream limit");
                    if full && !was_full {
                        self.notify_info(|cb, info| cb.on_settings_outgoing_streams_full(info));
                    } else if was_full && !full {
                        self.notify_info(|cb, info| {
                            cb.on_settings_outgoing_streams_not_full(info)
                        });
                    }
                }
                SettingId::InitialWindowSize => {
                    if setting.value > MAX_WINDOW_SIZE {
                        self.on_framing_error(FramingError::new(
                            ErrorCode::FlowControlError,
                            "initial window size above maximum",
                        ));
                        return;
                    }
                    self.rebase_stream_send_windows(setting.value);
                }
                other => trace!(setting = ?other, value = setting.value, "ignoring setting"),
            }
        }
    }

    fn rebase_stream_send_windows(&mut self, size: u32) {
        self.stream_send_window = size;
        for id in self.transactions.snapshot() {
            let Some(txn) = self.transactions.get_mut(id) else {
                continue;
            };
            if let Err(e) = txn.send_window_mut().set_capacity(size) {
                warn!(stream_id = %id, error = %e, "stream window overflow on settings");
                self.stream_error(
                    id,
                    TransactionError::both(ErrorKind::FlowControl),
                    ErrorCode::FlowControlError,
                );
            }
        }
        if !self.egress_queue.is_empty() {
            self.schedule_write();
        }
    }

    // --- reactor entry points: egress ---

    /// Flush ready egress to the transport. Called once at the end of each
    /// reactor pass.
    pub fn run_loop_callback(&mut self) {
        if self.in_loop_callback || self.destroyed {
            return;
        }
        self.in_loop_callback = true;
        self.write_scheduled = false;
        if !self.state.writes_shutdown() {
            self.flush();
        }
        self.in_loop_callback = false;

        self.apply_effects();
        self.check_for_shutdown();
    }

    fn flush(&mut self) {
        let mut eor = false;
        for id in self.egress_queue.ordered() {
            if self.writes_paused
                || self.write_segments.pending_bytes() as usize + self.write_buf.len()
                    > self.config.pending_write_max
            {
                break;
            }
            eor |= self.write_transaction_egress(id);
        }

        if self.write_buf.is_empty() {
            return;
        }
        let more = self.has_ready_egress();
        let flags = WriteFlags { cork: more, eor };
        let data = self.write_buf.split().freeze();
        let length = data.len() as u64;
        if self.write_segments.is_empty() {
            self.arm_write_timeout();
        }
        let handle = self.write_segments.push(length, flags);
        self.bytes_scheduled += length;
        trace!(bytes = length, cork = flags.cork, eor = flags.eor, "write scheduled");
        self.transport.write(data, handle, flags);

        self.update_backpressure();
        if more && !self.writes_paused {
            self.schedule_write();
        }
    }

    /// Encode what `id` may send right now. Returns true if its message
    /// ended.
    fn write_transaction_egress(&mut self, id: StreamId) -> bool {
        let stream_fc = self.codec.supports_stream_flow_control();
        let session_fc = self.codec.supports_session_flow_control();
        let chunk = self.config.write_chunk_size;

        let Some(txn) = self.transactions.get_mut(id) else {
            self.egress_queue.remove(id);
            return false;
        };
        if !txn.headers_sent() {
            return false;
        }

        let mut finished = false;
        if txn.egress_body_len() > 0 {
            let mut allowed = chunk.min(txn.egress_body_len());
            if stream_fc {
                allowed = allowed.min(txn.send_window().sendable() as usize);
            }
            if session_fc {
                allowed = allowed.min(self.send_window.sendable() as usize);
            }
            if allowed == 0 {
                trace!(stream_id = %id, "egress blocked on flow control");
                return false;
            }

            let data = txn.take_body(allowed);
            let len = data.len() as u32;
            if stream_fc && let Err(e) = txn.send_window_mut().reserve(len) {
                error!(stream_id = %id, error = %e, "stream window accounting");
            }
            if session_fc && let Err(e) = self.send_window.reserve(len) {
                error!(stream_id = %id, error = %e, "session window accounting");
            }
            let eom = txn.egress_body_len() == 0 && txn.eom_queued() && !txn.has_pending_trailers();
            let start = self.bytes_scheduled + self.write_buf.len() as u64;
            self.codec.encode(
                &EgressFrame::Body {
                    stream_id: id,
                    data: &data,
                    eom,
                },
                &mut self.write_buf,
            );
            if txn.track_first_byte() {
                self.byte_events.add_first_byte_event(start + 1, id);
                txn.add_byte_event();
            }
            finished = eom;
        }

        if !finished && txn.egress_body_len() == 0 {
            if let Some(trailers) = txn.take_trailers() {
                self.codec.encode(
                    &EgressFrame::Trailers {
                        stream_id: id,
                        trailers: &trailers,
                    },
                    &mut self.write_buf,
                );
            }
            if txn.eom_queued() {
                self.codec
                    .encode(&EgressFrame::Eom { stream_id: id }, &mut self.write_buf);
                finished = true;
            }
        }

        if finished {
            txn.mark_egress_complete();
            let end = self.bytes_scheduled + self.write_buf.len() as u64;
            self.byte_events.add_last_byte_event(end, id);
            txn.add_byte_event();
            trace!(stream_id = %id, offset = end, "egress complete");
        }
        if !txn.has_pending_egress() {
            self.egress_queue.remove(id);
        }
        finished
    }

    fn has_ready_egress(&self) -> bool {
        let stream_fc = self.codec.supports_stream_flow_control();
        let session_fc = self.codec.supports_session_flow_control();
        self.egress_queue.ordered().into_iter().any(|id| {
            let Some(txn) = self.transactions.get(id) else {
                return false;
            };
            if !txn.headers_sent() {
                return false;
            }
            if txn.egress_body_len() == 0 {
                return txn.has_pending_trailers() || txn.eom_queued();
            }
            (!stream_fc || !txn.send_window().is_blocked())
                && (!session_fc || !self.send_window.is_blocked())
        })
    }

    /// The transport finished the write identified by `handle`.
    pub fn on_write_success(&mut self, handle: WriteHandle) {
        let Some(bytes) = self.write_segments.complete(handle) else {
            trace!(handle = handle.id(), "completion for detached write");
            return;
        };
        self.bytes_written += bytes;
        self.stats.record_bytes_written(bytes);
        self.notify_info(|cb, info| cb.on_write(info, bytes as usize));
        trace!(bytes, total = self.bytes_written, "write complete");

        if self.write_segments.is_empty() {
            self.cancel_write_timeout();
        } else {
            self.arm_write_timeout();
        }

        for event in self.byte_events.process_written(self.bytes_written) {
            self.fire_byte_event(event);
        }
        self.update_backpressure();
        if !self.writes_paused && !self.write_scheduled && self.has_ready_egress() {
            self.schedule_write();
        }

        if self.state.writes_draining()
            && self.write_segments.is_empty()
            && self.write_buf.is_empty()
        {
            debug!(session = %self, "writes drained, shutting down writes");
            self.state.shutdown_writes();
            self.transport.shutdown_write();
        }
        self.apply_effects();
        self.check_for_shutdown();
    }

    /// The transport failed the write identified by `handle`.
    pub fn on_write_error(&mut self, handle: WriteHandle, error: &std::io::Error) {
        if !self.write_segments.contains(handle) {
            trace!(handle = handle.id(), "failure for detached write");
            return;
        }
        warn!(session = %self, error = %error, "write failed");
        self.state.set_close_reason(CloseReason::WriteError);
        self.shutdown_transport_with_reset(ErrorKind::Write);
    }

    /// The peer acknowledged everything up to `offset`.
    pub fn on_bytes_acked(&mut self, offset: u64) {
        for event in self.byte_events.process_acked(offset) {
            self.fire_byte_event(event);
        }
        self.apply_effects();
        self.check_for_shutdown();
    }

    fn fire_byte_event(&mut self, event: ByteEvent) {
        if let ByteEventKind::Ping { id } = event.kind {
            if let Some(sent_at) = self.pings.get_mut(&id) {
                *sent_at = Some(Instant::now());
            }
            return;
        }
        let Some(id) = event.stream_id else {
            return;
        };
        let track_acks = self.config.track_acks;
        let Some(txn) = self.transactions.get_mut(id) else {
            return;
        };
        if event.kind == ByteEventKind::LastByte && track_acks {
            self.byte_events.add_ack_event(event.offset, id);
            txn.add_byte_event();
        }
        if let Some(handler) = txn.handler_mut() {
            match event.kind {
                ByteEventKind::FirstByte => handler.on_first_byte_flushed(),
                ByteEventKind::LastByte => handler.on_last_byte_flushed(),
                ByteEventKind::LastByteAcked => handler.on_last_byte_acked(),
                ByteEventKind::Ping { .. } => {}
            }
        }
        txn.byte_event_done();
        self.maybe_detach(id);
    }

    fn update_backpressure(&mut self) {
        let pending = self.write_segments.pending_bytes() as usize;
        let max = self.config.pending_write_max;

        if !self.writes_paused && pending > max {
            debug!(pending, max, "pausing egress");
            self.writes_paused = true;
            self.stats.record_egress_paused();
            for id in self.transactions.snapshot() {
                if let Some(txn) = self.transactions.get_mut(id)
                    && !txn.is_egress_complete()
                    && txn.set_egress_paused(true)
                    && let Some(handler) = txn.handler_mut()
                {
                    handler.on_egress_paused();
                }
            }
        } else if self.writes_paused && pending < max {
            debug!(pending, max, "resuming egress");
            self.writes_paused = false;
            for id in self.transactions.snapshot() {
                let resumed = self
                    .transactions
                    .get_mut(id)
                    .is_some_and(|txn| txn.set_egress_paused(false) && !txn.is_egress_complete());
                if resumed {
                    self.dispatch(id, |handler, effects| handler.on_egress_resumed(effects));
                }
            }
            if !self.egress_queue.is_empty() {
                self.schedule_write();
            }
        }
    }

    // --- timers ---

    /// The inactivity timer for `id` expired.
    pub fn on_transaction_timeout(&mut self, id: StreamId) {
        let Some(txn) = self.transactions.get_mut(id) else {
            return;
        };
        debug!(stream_id = %id, "transaction timed out");
        self.stats.record_transaction_timeout();

        if !txn.has_handler() {
            let handler = match self.controller.as_mut() {
                Some(controller) => controller.transaction_timeout_handler(id),
                None => Some(Box::new(DirectResponseHandler::new(408)) as Box<dyn Handler>),
            };
            let Some(handler) = handler else {
                let _ = self.send_abort(id, ErrorCode::Cancel);
                return;
            };
            if let Some(txn) = self.transactions.get_mut(id) {
                txn.set_handler(handler);
            }
            self.notify_info(|cb, info| cb.on_ingress_error(info, "transaction timeout"));
        }

        let error = TransactionError::both(ErrorKind::Timeout);
        self.deliver_error(id, &error);
        self.close_halves(id, true, false);
        self.abort_if_stalled(id);
    }

    /// The write-stall timer expired: transactions with unfinished egress
    /// are failed individually.
    pub fn on_write_timeout(&mut self) {
        self.write_timeout_armed = false;
        if self.write_segments.is_empty() {
            return;
        }
        warn!(session = %self, pending = self.write_segments.pending_bytes(), "write timed out");
        for id in self.transactions.snapshot() {
            let egress_open = self
                .transactions
                .get(id)
                .is_some_and(|txn| !txn.is_egress_complete());
            if egress_open {
                self.stream_error(
                    id,
                    TransactionError::egress(ErrorKind::WriteTimeout),
                    ErrorCode::Cancel,
                );
            }
        }
        self.apply_effects();
    }

    /// The connection has been idle past the reactor's read timeout.
    pub fn on_idle_timeout(&mut self) {
        if !self.transactions.is_empty() || !self.write_segments.is_empty() {
            trace!("idle timeout with work in flight, ignoring");
            return;
        }
        debug!(session = %self, "idle timeout");
        self.state.set_close_reason(CloseReason::Timeout);
        self.drain();
        self.shutdown_transport(true, true);
    }

    // --- internals ---

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.destroyed || self.state.is_closed() {
            return Err(SessionError::Closed);
        }
        Ok(())
    }

    fn ensure_writable(&self) -> Result<(), SessionError> {
        if self.destroyed || self.state.writes_shutdown() || self.state.writes_draining() {
            return Err(SessionError::Closed);
        }
        Ok(())
    }

    fn writable_transaction(&mut self, id: StreamId) -> Result<&mut Transaction, SessionError> {
        self.ensure_writable()?;
        let txn = self
            .transactions
            .get_mut(id)
            .ok_or(SessionError::UnknownStream(id))?;
        if txn.is_egress_complete() || txn.eom_queued() {
            return Err(SessionError::EgressComplete(id));
        }
        if !txn.headers_sent() {
            return Err(SessionError::HeadersNotSent(id));
        }
        Ok(txn)
    }

    fn queue_egress(&mut self, id: StreamId) {
        if let Some(txn) = self.transactions.get(id) {
            self.egress_queue.push(id, txn.priority(), txn.seq_no());
            self.schedule_write();
        }
    }

    fn reprioritize(&mut self, id: StreamId, priority: Priority) {
        if let Some(txn) = self.transactions.get_mut(id) {
            txn.set_priority(priority);
            if self.egress_queue.contains(id) {
                self.egress_queue.push(id, priority, txn.seq_no());
            }
        }
    }

    fn schedule_write(&mut self) {
        if !self.write_scheduled && !self.destroyed {
            trace!("write scheduled for end of loop");
            self.write_scheduled = true;
        }
    }

    fn send_settings(&mut self) {
        let settings = [
            Setting {
                id: SettingId::InitialWindowSize,
                value: self.config.initial_receive_window,
            },
            Setting {
                id: SettingId::MaxConcurrentStreams,
                value: self.max_incoming,
            },
        ];
        self.codec
            .encode(&EgressFrame::Settings(&settings), &mut self.write_buf);

        if self.codec.supports_session_flow_control() {
            let target = self.config.receive_session_window;
            let current = self.recv_window.capacity();
            if target != current {
                if let Err(e) = self.recv_window.set_capacity(target) {
                    error!(error = %e, "session receive window");
                } else if target > current {
                    self.send_window_update(StreamId::CONNECTION, target - current);
                }
            }
        }
        self.schedule_write();
    }

    fn send_goaway(&mut self, code: ErrorCode) {
        if self.goaway_sent || !self.codec.supports_goaway() || self.state.writes_shutdown() {
            return;
        }
        self.goaway_sent = true;
        self.codec.encode(
            &EgressFrame::GoAway {
                last_good_stream_id: self.highest_incoming_id,
                code,
            },
            &mut self.write_buf,
        );
        self.schedule_write();
    }

    fn send_window_update(&mut self, id: StreamId, amount: u32) {
        if self.state.writes_shutdown() {
            return;
        }
        self.codec.encode(
            &EgressFrame::WindowUpdate {
                stream_id: id,
                amount,
            },
            &mut self.write_buf,
        );
        self.schedule_write();
    }

    /// Raise a stream's receive window from the initial size to the
    /// configured per-stream size.
    fn grow_stream_receive_window(&mut self, id: StreamId) {
        if !self.codec.supports_stream_flow_control() {
            return;
        }
        let target = self.config.receive_stream_window;
        let Some(txn) = self.transactions.get_mut(id) else {
            return;
        };
        let current = txn.recv_window().capacity();
        if target <= current {
            return;
        }
        if txn.recv_window_mut().set_capacity(target).is_ok() {
            self.send_window_update(id, target - current);
        }
    }

    fn refuse_stream(&mut self, id: StreamId) {
        self.stats.record_stream_refused();
        if self.codec.is_multiplexed() && !self.state.writes_shutdown() {
            self.codec.encode(
                &EgressFrame::Abort {
                    stream_id: id,
                    code: ErrorCode::RefusedStream,
                },
                &mut self.write_buf,
            );
            self.schedule_write();
        }
    }

    fn on_invalid_stream(&mut self, id: StreamId, code: ErrorCode) {
        warn!(stream_id = %id, code = %code, "event for invalid stream");
        if self.codec.is_multiplexed() && !self.state.writes_shutdown() {
            self.codec.encode(
                &EgressFrame::Abort {
                    stream_id: id,
                    code,
                },
                &mut self.write_buf,
            );
            self.schedule_write();
        }
    }

    /// Fail one transaction and abort its stream; the rest of the session
    /// carries on.
    fn stream_error(&mut self, id: StreamId, error: TransactionError, code: ErrorCode) {
        self.deliver_error(id, &error);
        if self.transactions.contains(id) {
            let _ = self.send_abort(id, code);
        }
    }

    /// After an error, abort `id` unless its handler has finished or queued
    /// the rest of its egress.
    fn abort_if_stalled(&mut self, id: StreamId) {
        self.apply_effects();
        let stalled = self
            .transactions
            .get(id)
            .is_some_and(|txn| !txn.is_egress_complete() && !txn.eom_queued());
        if stalled {
            let _ = self.send_abort(id, ErrorCode::Cancel);
        } else {
            self.maybe_detach(id);
        }
    }

    fn deliver_error(&mut self, id: StreamId, error: &TransactionError) {
        let Some(txn) = self.transactions.get(id) else {
            return;
        };
        if txn.is_aborted() {
            return;
        }
        let Some(scoped) = error.restricted_to(!txn.is_ingress_complete(), !txn.is_egress_complete())
        else {
            return;
        };
        self.stats.record_transaction_error();
        self.dispatch(id, |handler, effects| handler.on_error(&scoped, effects));
    }

    /// Close the requested halves of `id`, releasing buffered ingress and
    /// queued egress.
    fn close_halves(&mut self, id: StreamId, ingress: bool, egress: bool) {
        let Some(txn) = self.transactions.get_mut(id) else {
            return;
        };
        let mut dropped = 0;
        if ingress && !txn.is_ingress_complete() {
            dropped = txn.deferred_body_bytes();
            self.pending_read_size -= dropped;
            txn.mark_ingress_complete();
        }
        if egress && !txn.is_egress_complete() {
            txn.mark_egress_complete();
            self.egress_queue.remove(id);
        }
        if ingress {
            self.credit_session(dropped as u32);
            self.check_read_buffer_limit();
        }
    }

    fn maybe_detach(&mut self, id: StreamId) {
        if !self
            .transactions
            .get(id)
            .is_some_and(|txn| txn.is_detachable())
        {
            return;
        }
        let Some(mut txn) = self.transactions.remove(id) else {
            return;
        };
        trace!(stream_id = %id, "transaction detached");
        self.egress_queue.remove(id);
        self.timers.cancel_transaction_timeout(id);
        if let Some(mut handler) = txn.take_handler() {
            handler.on_detached();
        }
        self.stats.record_transaction_closed();
        self.notify_info(|cb, info| cb.on_transaction_detached(info));

        if self.transactions.is_empty() {
            self.notify_info(|cb, info| cb.on_deactivate_connection(info));
            if !self.codec.is_reusable() && !self.destroyed {
                self.state.set_close_reason(CloseReason::NotReusable);
                self.drain();
                self.shutdown_transport(true, true);
            }
        }
        self.check_for_shutdown();
    }

    fn check_for_shutdown(&mut self) {
        if self.destroyed || self.in_loop_callback {
            return;
        }
        let wind_down =
            (self.direction.is_upstream() && self.state.is_draining()) || self.state.reads_shutdown();
        if wind_down
            && self.transactions.is_empty()
            && !(self.state.reads_shutdown() && self.state.writes_shutdown())
            && !self.state.writes_draining()
        {
            self.shutdown_transport(true, true);
            return;
        }
        if self.state.is_closed() && self.transactions.is_empty() && self.write_segments.is_empty()
        {
            self.destroy();
        }
    }

    fn destroy(&mut self) {
        if std::mem::replace(&mut self.destroyed, true) {
            return;
        }
        debug!(session = %self, reason = ?self.state.close_reason(), "destroying session");
        self.write_scheduled = false;
        self.write_segments.detach_all();
        let leftover = self.byte_events.drain();
        if !leftover.is_empty() {
            debug!(count = leftover.len(), "dropping byte events at teardown");
        }
        self.cancel_write_timeout();
        self.notify_info(|cb, info| cb.on_destroy(info));
        if self.state.is_started() {
            self.stats.record_session_closed();
        }
        if let Some(controller) = self.controller.as_mut() {
            controller.detach_session();
        }
    }

    fn arm_transaction_timeout(&mut self, id: StreamId) {
        if self.config.transaction_timeout_ms > 0 {
            self.timers
                .schedule_transaction_timeout(id, self.config.transaction_timeout());
        }
    }

    fn arm_write_timeout(&mut self) {
        if self.config.write_timeout_ms > 0 {
            self.write_timeout_armed = true;
            self.timers.schedule_write_timeout(self.config.write_timeout());
        }
    }

    fn cancel_write_timeout(&mut self) {
        if std::mem::replace(&mut self.write_timeout_armed, false) {
            self.timers.cancel_write_timeout();
        }
    }

    fn notify_info<F>(&mut self, f: F)
    where
        F: FnOnce(&mut dyn InfoCallback, &SessionInfo),
    {
        let info = self.info();
        if let Some(callback) = self.info_callback.as_mut() {
            f(callback.as_mut(), &info);
        }
    }

    /// Call into the handler of `id` and queue whatever it asks for.
    ///
    /// Ingress pauses take effect immediately so that events already decoded
    /// are held back; every other effect is applied after the callback.
    fn dispatch<F>(&mut self, id: StreamId, f: F)
    where
        F: FnOnce(&mut dyn Handler, &mut Effects),
    {
        let Some(handler) = self
            .transactions
            .get_mut(id)
            .and_then(|txn| txn.handler_mut())
        else {
            trace!(stream_id = %id, "no handler to notify");
            return;
        };
        let mut effects = Effects::new(id);
        f(handler, &mut effects);

        let (_, queue) = effects.into_parts();
        for effect in queue {
            if matches!(effect, Effect::PauseIngress) {
                let _ = self.pause_ingress(id);
            } else {
                self.pending_effects.push_back((id, effect));
            }
        }
        self.apply_effects();
    }

    fn apply_effects(&mut self) {
        if self.applying_effects {
            return;
        }
        self.applying_effects = true;
        while let Some((id, effect)) = self.pending_effects.pop_front() {
            let result = match effect {
                Effect::SendHeaders(message) => self.send_headers(id, message).map(|_| ()),
                Effect::SendBody(data) => self.send_body(id, &data),
                Effect::SendTrailers(trailers) => self.send_trailers(id, trailers),
                Effect::SendEom => self.send_eom(id),
                Effect::SendAbort(code) => self.send_abort(id, code).map(|_| ()),
                Effect::PauseIngress => self.pause_ingress(id),
                Effect::ResumeIngress => self.resume_ingress(id),
            };
            if let Err(e) = result {
                debug!(stream_id = %id, error = %e, "handler effect rejected");
            }
        }
        self.applying_effects = false;
    }
}

impl<C: Codec, T: Transport> fmt::Display for Session<C, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} {:?} session", self.direction.as_str(), self.codec.protocol())?;
        if let Some(addr) = self.transport.local_addr() {
            write!(f, " local={}", addr)?;
        }
        if let Some(addr) = self.transport.peer_addr() {
            write!(f, " peer={}", addr)?;
        }
        write!(
            f,
            " out={} in={} phase={:?}]",
            self.transactions.outgoing(),
            self.transactions.incoming(),
            self.state.phase()
        )
    }
}

impl<C: Codec, T: Transport> fmt::Debug for Session<C, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("direction", &self.direction)
            .field("transactions", &self.transactions.len())
            .field("phase", &self.state.phase())
            .field("bytes_scheduled", &self.bytes_scheduled)
            .field("bytes_written", &self.bytes_written)
            .finish()
    }
}

impl<C: Codec, T: Transport> Drop for Session<C, T> {
    fn drop(&mut self) {
        if !self.destroyed {
            self.state.set_close_reason(CloseReason::Dropped);
            self.shutdown_transport_with_reset(ErrorKind::Dropped);
        }
    }
}

