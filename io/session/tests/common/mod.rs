//! Shared test doubles for driving a full session.
//!
//! Every double records into `Rc<RefCell<..>>` state so the test keeps a
//! handle after the double has been moved into the session.

#![allow(dead_code)]

use bytes::{Bytes, BytesMut};
use http_session::{
    Codec, CodecEvent, Controller, Direction, Effects, EgressFrame, ErrorCode, FramingError,
    Handler, InfoCallback, Message, Protocol, Session, SessionConfig, SessionInfo, Setting,
    StreamId, Timers, TransactionError, Transport, WriteFlags, WriteHandle,
};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Once;
use std::time::Duration;

static LOGGING: Once = Once::new();

/// Install a test-friendly tracing subscriber once per test binary.
pub fn init_test_logging() {
    LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

// --- codec ---

/// Owned record of one frame the session asked the codec to encode.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Headers {
        stream_id: StreamId,
        status: Option<u16>,
        assoc_stream_id: Option<StreamId>,
    },
    Body {
        stream_id: StreamId,
        len: usize,
        eom: bool,
    },
    Trailers {
        stream_id: StreamId,
    },
    Eom {
        stream_id: StreamId,
    },
    Abort {
        stream_id: StreamId,
        code: ErrorCode,
    },
    WindowUpdate {
        stream_id: StreamId,
        amount: u32,
    },
    Settings(Vec<Setting>),
    GoAway {
        last_good_stream_id: StreamId,
        code: ErrorCode,
    },
    Ping {
        id: u64,
        reply: bool,
    },
}

/// Encoded sizes, chosen so byte offsets are easy to reason about.
pub const HEADERS_LEN: usize = 10;
pub const TRAILERS_LEN: usize = 5;
pub const EOM_LEN: usize = 1;
pub const CONTROL_LEN: usize = 8;

#[derive(Default)]
pub struct CodecState {
    pub batches: VecDeque<Result<Vec<CodecEvent>, FramingError>>,
    pub frames: Vec<Frame>,
    pub reusable: bool,
}

/// Codec whose ingress is scripted by the test and whose egress is
/// recorded as [`Frame`]s.
pub struct ScriptedCodec {
    protocol: Protocol,
    next_stream_id: u32,
    state: Rc<RefCell<CodecState>>,
}

#[derive(Clone)]
pub struct CodecHandle(Rc<RefCell<CodecState>>);

impl ScriptedCodec {
    pub fn new(protocol: Protocol, direction: Direction) -> (Self, CodecHandle) {
        let state = Rc::new(RefCell::new(CodecState {
            reusable: true,
            ..Default::default()
        }));
        let codec = Self {
            protocol,
            next_stream_id: if direction.is_upstream() { 1 } else { 2 },
            state: state.clone(),
        };
        (codec, CodecHandle(state))
    }
}

impl CodecHandle {
    /// Queue the events produced by the next `on_read`.
    pub fn script(&self, events: Vec<CodecEvent>) {
        self.0.borrow_mut().batches.push_back(Ok(events));
    }

    pub fn script_error(&self, error: FramingError) {
        self.0.borrow_mut().batches.push_back(Err(error));
    }

    pub fn frames(&self) -> Vec<Frame> {
        self.0.borrow().frames.clone()
    }

    pub fn take_frames(&self) -> Vec<Frame> {
        std::mem::take(&mut self.0.borrow_mut().frames)
    }

    pub fn set_reusable(&self, reusable: bool) {
        self.0.borrow_mut().reusable = reusable;
    }

    pub fn window_updates(&self, stream_id: StreamId) -> Vec<u32> {
        self.frames()
            .into_iter()
            .filter_map(|frame| match frame {
                Frame::WindowUpdate {
                    stream_id: id,
                    amount,
                } if id == stream_id => Some(amount),
                _ => None,
            })
            .collect()
    }

    pub fn aborts(&self) -> Vec<(StreamId, ErrorCode)> {
        self.frames()
            .into_iter()
            .filter_map(|frame| match frame {
                Frame::Abort { stream_id, code } => Some((stream_id, code)),
                _ => None,
            })
            .collect()
    }

    pub fn goaways(&self) -> usize {
        self.frames()
            .iter()
            .filter(|frame| matches!(frame, Frame::GoAway { .. }))
            .count()
    }
}

impl Codec for ScriptedCodec {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn is_reusable(&self) -> bool {
        self.state.borrow().reusable
    }

    fn create_stream_id(&mut self) -> StreamId {
        let id = StreamId(self.next_stream_id);
        self.next_stream_id += 2;
        id
    }

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Vec<CodecEvent>, FramingError> {
        buf.clear();
        self.state
            .borrow_mut()
            .batches
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    fn encode(&mut self, frame: &EgressFrame<'_>, out: &mut BytesMut) -> usize {
        let (record, len) = match *frame {
            EgressFrame::Headers {
                stream_id,
                message,
                assoc_stream_id,
            } => (
                Frame::Headers {
                    stream_id,
                    status: message.status(),
                    assoc_stream_id,
                },
                HEADERS_LEN,
            ),
            EgressFrame::Body {
                stream_id,
                data,
                eom,
            } => (
                Frame::Body {
                    stream_id,
                    len: data.len(),
                    eom,
                },
                data.len(),
            ),
            EgressFrame::Trailers { stream_id, .. } => (Frame::Trailers { stream_id }, TRAILERS_LEN),
            EgressFrame::Eom { stream_id } => (Frame::Eom { stream_id }, EOM_LEN),
            EgressFrame::Abort { stream_id, code } => (Frame::Abort { stream_id, code }, CONTROL_LEN),
            EgressFrame::WindowUpdate { stream_id, amount } => {
                (Frame::WindowUpdate { stream_id, amount }, CONTROL_LEN)
            }
            EgressFrame::Settings(settings) => (Frame::Settings(settings.to_vec()), CONTROL_LEN),
            EgressFrame::GoAway {
                last_good_stream_id,
                code,
            } => (
                Frame::GoAway {
                    last_good_stream_id,
                    code,
                },
                CONTROL_LEN,
            ),
            EgressFrame::Ping { id, reply } => (Frame::Ping { id, reply }, CONTROL_LEN),
        };
        self.state.borrow_mut().frames.push(record);
        out.extend_from_slice(&vec![0u8; len]);
        len
    }
}

// --- transport ---

#[derive(Debug, Default)]
pub struct TransportState {
    pub writes: Vec<(WriteHandle, usize, WriteFlags)>,
    pub shutdown_read: bool,
    pub shutdown_write: bool,
    pub reset: bool,
    pub reads_paused: bool,
}

/// Transport that accepts every write and leaves completion to the test.
pub struct MockTransport(Rc<RefCell<TransportState>>);

#[derive(Clone)]
pub struct TransportHandle(Rc<RefCell<TransportState>>);

impl MockTransport {
    pub fn new() -> (Self, TransportHandle) {
        let state = Rc::new(RefCell::new(TransportState::default()));
        (Self(state.clone()), TransportHandle(state))
    }
}

impl TransportHandle {
    pub fn writes(&self) -> Vec<(WriteHandle, usize, WriteFlags)> {
        self.0.borrow().writes.clone()
    }

    pub fn handles(&self) -> Vec<WriteHandle> {
        self.0.borrow().writes.iter().map(|w| w.0).collect()
    }

    pub fn last_handle(&self) -> Option<WriteHandle> {
        self.0.borrow().writes.last().map(|w| w.0)
    }

    pub fn total_written(&self) -> usize {
        self.0.borrow().writes.iter().map(|w| w.1).sum()
    }

    pub fn is_shutdown_read(&self) -> bool {
        self.0.borrow().shutdown_read
    }

    pub fn is_shutdown_write(&self) -> bool {
        self.0.borrow().shutdown_write
    }

    pub fn is_reset(&self) -> bool {
        self.0.borrow().reset
    }

    pub fn reads_paused(&self) -> bool {
        self.0.borrow().reads_paused
    }
}

impl Transport for MockTransport {
    fn write(&mut self, data: Bytes, handle: WriteHandle, flags: WriteFlags) {
        self.0.borrow_mut().writes.push((handle, data.len(), flags));
    }

    fn shutdown_read(&mut self) {
        self.0.borrow_mut().shutdown_read = true;
    }

    fn shutdown_write(&mut self) {
        self.0.borrow_mut().shutdown_write = true;
    }

    fn close_with_reset(&mut self) {
        self.0.borrow_mut().reset = true;
    }

    fn pause_reads(&mut self) {
        self.0.borrow_mut().reads_paused = true;
    }

    fn resume_reads(&mut self) {
        self.0.borrow_mut().reads_paused = false;
    }
}

// --- handler ---

#[derive(Debug, Clone, PartialEq)]
pub enum HandlerEvent {
    Headers(Option<u16>),
    Body(usize),
    Trailers,
    Eom,
    Error(TransactionError),
    EgressPaused,
    EgressResumed,
    Pushed(StreamId),
    FirstByteFlushed,
    LastByteFlushed,
    LastByteAcked,
    Detached,
}

pub type HandlerLog = Rc<RefCell<Vec<HandlerEvent>>>;

/// Handler that records every callback and optionally reacts.
#[derive(Default)]
pub struct RecordingHandler {
    log: HandlerLog,
    respond_on_eom: Option<u16>,
    pause_on_headers: bool,
    accept_pushes: bool,
    push_logs: Rc<RefCell<Vec<HandlerLog>>>,
}

impl RecordingHandler {
    pub fn new() -> (Self, HandlerLog) {
        let handler = Self::default();
        let log = handler.log.clone();
        (handler, log)
    }

    /// Answer with `status` and an empty body once the request ends.
    pub fn respond_on_eom(mut self, status: u16) -> Self {
        self.respond_on_eom = Some(status);
        self
    }

    pub fn pause_on_headers(mut self) -> Self {
        self.pause_on_headers = true;
        self
    }

    /// Accept pushed transactions; their logs are collected in `logs`.
    pub fn accept_pushes(mut self, logs: Rc<RefCell<Vec<HandlerLog>>>) -> Self {
        self.accept_pushes = true;
        self.push_logs = logs;
        self
    }

    fn record(&self, event: HandlerEvent) {
        self.log.borrow_mut().push(event);
    }
}

impl Handler for RecordingHandler {
    fn on_headers(&mut self, message: Message, effects: &mut Effects) {
        self.record(HandlerEvent::Headers(message.status()));
        if self.pause_on_headers {
            effects.pause_ingress();
        }
    }

    fn on_body(&mut self, data: Bytes, _effects: &mut Effects) {
        self.record(HandlerEvent::Body(data.len()));
    }

    fn on_trailers(&mut self, _trailers: Vec<http_session::HeaderField>, _effects: &mut Effects) {
        self.record(HandlerEvent::Trailers);
    }

    fn on_eom(&mut self, effects: &mut Effects) {
        self.record(HandlerEvent::Eom);
        if let Some(status) = self.respond_on_eom {
            effects.send_headers(Message::response(status));
            effects.send_eom();
        }
    }

    fn on_error(&mut self, error: &TransactionError, _effects: &mut Effects) {
        self.record(HandlerEvent::Error(error.clone()));
    }

    fn on_egress_paused(&mut self) {
        self.record(HandlerEvent::EgressPaused);
    }

    fn on_egress_resumed(&mut self, _effects: &mut Effects) {
        self.record(HandlerEvent::EgressResumed);
    }

    fn on_pushed_transaction(&mut self, stream_id: StreamId) -> Option<Box<dyn Handler>> {
        self.record(HandlerEvent::Pushed(stream_id));
        if !self.accept_pushes {
            return None;
        }
        let (handler, log) = RecordingHandler::new();
        self.push_logs.borrow_mut().push(log);
        Some(Box::new(handler))
    }

    fn on_first_byte_flushed(&mut self) {
        self.record(HandlerEvent::FirstByteFlushed);
    }

    fn on_last_byte_flushed(&mut self) {
        self.record(HandlerEvent::LastByteFlushed);
    }

    fn on_last_byte_acked(&mut self) {
        self.record(HandlerEvent::LastByteAcked);
    }

    fn on_detached(&mut self) {
        self.record(HandlerEvent::Detached);
    }
}

pub fn errors(log: &HandlerLog) -> Vec<TransactionError> {
    log.borrow()
        .iter()
        .filter_map(|event| match event {
            HandlerEvent::Error(e) => Some(e.clone()),
            _ => None,
        })
        .collect()
}

pub fn count(log: &HandlerLog, event: &HandlerEvent) -> usize {
    log.borrow().iter().filter(|e| *e == event).count()
}

// --- controller ---

/// Controller that hands every request a [`RecordingHandler`] answering
/// 200, and keeps the handler logs in arrival order.
#[derive(Clone, Default)]
pub struct RecordingController {
    pub logs: Rc<RefCell<Vec<(StreamId, HandlerLog)>>>,
    pub framing_errors: Rc<RefCell<usize>>,
    pub attached: Rc<RefCell<bool>>,
    pub detached: Rc<RefCell<bool>>,
    pub pause_on_headers: bool,
}

impl RecordingController {
    pub fn log(&self, stream_id: u32) -> HandlerLog {
        self.logs
            .borrow()
            .iter()
            .find(|(id, _)| *id == StreamId(stream_id))
            .map(|(_, log)| log.clone())
            .expect("no handler for stream")
    }
}

impl Controller for RecordingController {
    fn request_handler(&mut self, stream_id: StreamId, _message: &Message) -> Box<dyn Handler> {
        let (mut handler, log) = RecordingHandler::new();
        handler = handler.respond_on_eom(200);
        if self.pause_on_headers {
            handler = handler.pause_on_headers();
        }
        self.logs.borrow_mut().push((stream_id, log));
        Box::new(handler)
    }

    fn attach_session(&mut self) {
        *self.attached.borrow_mut() = true;
    }

    fn detach_session(&mut self) {
        *self.detached.borrow_mut() = true;
    }

    fn on_framing_error(&mut self, _error: &FramingError) {
        *self.framing_errors.borrow_mut() += 1;
    }
}

// --- info callback ---

#[derive(Debug, Default)]
pub struct InfoState {
    pub events: Vec<&'static str>,
    pub ping_latencies: Vec<Duration>,
    pub bytes_read: usize,
    pub bytes_written: usize,
}

#[derive(Clone, Default)]
pub struct InfoRecorder(pub Rc<RefCell<InfoState>>);

impl InfoRecorder {
    pub fn count(&self, name: &str) -> usize {
        self.0.borrow().events.iter().filter(|e| **e == name).count()
    }

    fn push(&self, name: &'static str) {
        self.0.borrow_mut().events.push(name);
    }
}

impl InfoCallback for InfoRecorder {
    fn on_create(&mut self, _info: &SessionInfo) {
        self.push("create");
    }

    fn on_ingress_error(&mut self, _info: &SessionInfo, _error: &str) {
        self.push("ingress_error");
    }

    fn on_read(&mut self, _info: &SessionInfo, bytes: usize) {
        self.0.borrow_mut().bytes_read += bytes;
    }

    fn on_write(&mut self, _info: &SessionInfo, bytes: usize) {
        self.0.borrow_mut().bytes_written += bytes;
    }

    fn on_request_begin(&mut self, _info: &SessionInfo) {
        self.push("request_begin");
    }

    fn on_request_end(&mut self, _info: &SessionInfo) {
        self.push("request_end");
    }

    fn on_activate_connection(&mut self, _info: &SessionInfo) {
        self.push("activate");
    }

    fn on_deactivate_connection(&mut self, _info: &SessionInfo) {
        self.push("deactivate");
    }

    fn on_destroy(&mut self, _info: &SessionInfo) {
        self.push("destroy");
    }

    fn on_ingress_message(&mut self, _info: &SessionInfo) {
        self.push("ingress_message");
    }

    fn on_ingress_limit_exceeded(&mut self, _info: &SessionInfo) {
        self.push("ingress_limit_exceeded");
    }

    fn on_ingress_paused(&mut self, _info: &SessionInfo) {
        self.push("ingress_paused");
    }

    fn on_transaction_detached(&mut self, _info: &SessionInfo) {
        self.push("transaction_detached");
    }

    fn on_ping_reply(&mut self, latency: Duration) {
        self.0.borrow_mut().ping_latencies.push(latency);
    }

    fn on_settings_outgoing_streams_full(&mut self, _info: &SessionInfo) {
        self.push("outgoing_full");
    }

    fn on_settings_outgoing_streams_not_full(&mut self, _info: &SessionInfo) {
        self.push("outgoing_not_full");
    }
}

// --- timers ---

#[derive(Debug, Default)]
pub struct TimerState {
    pub scheduled: Vec<StreamId>,
    pub cancelled: Vec<StreamId>,
    pub write_armed: usize,
    pub write_cancelled: usize,
}

#[derive(Clone, Default)]
pub struct RecordingTimers(pub Rc<RefCell<TimerState>>);

impl Timers for RecordingTimers {
    fn schedule_transaction_timeout(&mut self, stream_id: StreamId, _timeout: Duration) {
        self.0.borrow_mut().scheduled.push(stream_id);
    }

    fn cancel_transaction_timeout(&mut self, stream_id: StreamId) {
        self.0.borrow_mut().cancelled.push(stream_id);
    }

    fn schedule_write_timeout(&mut self, _timeout: Duration) {
        self.0.borrow_mut().write_armed += 1;
    }

    fn cancel_write_timeout(&mut self) {
        self.0.borrow_mut().write_cancelled += 1;
    }
}

// --- harness ---

pub type TestSession = Session<ScriptedCodec, MockTransport>;

pub struct Harness {
    pub session: TestSession,
    pub codec: CodecHandle,
    pub transport: TransportHandle,
    pub info: InfoRecorder,
    pub timers: RecordingTimers,
}

impl Harness {
    pub fn new(direction: Direction, protocol: Protocol, config: SessionConfig) -> Self {
        init_test_logging();
        let (codec, codec_handle) = ScriptedCodec::new(protocol, direction);
        let (transport, transport_handle) = MockTransport::new();
        let info = InfoRecorder::default();
        let timers = RecordingTimers::default();

        let mut session = Session::new(direction, codec, transport, config);
        session.set_info_callback(Box::new(info.clone()));
        session.set_timers(Box::new(timers.clone()));

        Self {
            session,
            codec: codec_handle,
            transport: transport_handle,
            info,
            timers,
        }
    }

    pub fn upstream() -> Self {
        Self::new(Direction::Upstream, Protocol::Http2, SessionConfig::default())
    }

    pub fn downstream() -> Self {
        Self::new(Direction::Downstream, Protocol::Http2, SessionConfig::default())
    }

    /// Install a recording controller and return a handle to it.
    pub fn with_controller(&mut self) -> RecordingController {
        let controller = RecordingController::default();
        self.session.set_controller(Box::new(controller.clone()));
        controller
    }

    /// Feed one scripted batch of ingress events.
    pub fn read(&mut self, events: Vec<CodecEvent>) {
        self.codec.script(events);
        self.session.on_read(b"ingress");
    }

    /// Run the end-of-loop flush if one is pending.
    pub fn flush(&mut self) {
        if self.session.write_scheduled() {
            self.session.run_loop_callback();
        }
    }

    /// Complete every write the transport has not yet acknowledged, in
    /// order.
    pub fn complete_writes(&mut self, from: usize) -> usize {
        let handles = self.transport.handles();
        for handle in &handles[from..] {
            self.session.on_write_success(*handle);
        }
        handles.len()
    }

    /// Flush and complete writes until the session goes quiet.
    pub fn settle(&mut self) {
        let mut done = self.transport.handles().len();
        for _ in 0..64 {
            self.flush();
            let total = self.transport.handles().len();
            if total == done && !self.session.write_scheduled() {
                break;
            }
            done = self.complete_writes(done);
        }
    }
}

pub fn request(stream_id: u32) -> Vec<CodecEvent> {
    let stream_id = StreamId(stream_id);
    vec![
        CodecEvent::MessageBegin { stream_id },
        CodecEvent::HeadersComplete {
            stream_id,
            message: Message::request("GET", "/"),
        },
    ]
}

pub fn complete_request(stream_id: u32) -> Vec<CodecEvent> {
    let mut events = request(stream_id);
    events.push(CodecEvent::MessageComplete {
        stream_id: StreamId(stream_id),
        upgrade: false,
    });
    events
}

pub fn response(stream_id: u32, status: u16) -> Vec<CodecEvent> {
    let stream_id = StreamId(stream_id);
    vec![
        CodecEvent::MessageBegin { stream_id },
        CodecEvent::HeadersComplete {
            stream_id,
            message: Message::response(status),
        },
        CodecEvent::MessageComplete {
            stream_id,
            upgrade: false,
        },
    ]
}
