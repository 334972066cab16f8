//! Codec boundary: the wire protocol seen as a stream of events.
//!
//! The session never parses or serializes bytes itself. A [`Codec`] turns
//! ingress bytes into [`CodecEvent`]s and serializes [`EgressFrame`]s, which
//! keeps the session independent of the protocol version in use.

use crate::error::{ErrorCode, FramingError};

use bytes::{Bytes, BytesMut};
use std::fmt;

/// Stream identifier (31 bits, high bit reserved).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct StreamId(pub u32);

impl StreamId {
    /// Connection-level stream (stream 0).
    pub const CONNECTION: StreamId = StreamId(0);

    /// Create a new stream ID, masking the reserved bit.
    #[inline]
    pub fn new(id: u32) -> Self {
        StreamId(id & 0x7FFF_FFFF)
    }

    /// Get the raw stream ID value.
    #[inline]
    pub fn value(self) -> u32 {
        self.0
    }

    /// Check if this is the connection-level stream.
    #[inline]
    pub fn is_connection_level(self) -> bool {
        self.0 == 0
    }
}

impl From<u32> for StreamId {
    fn from(id: u32) -> Self {
        StreamId::new(id)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Wire protocol family spoken by a codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http1,
    Spdy,
    Http2,
}

impl Protocol {
    /// True if more than one transaction can be live at once.
    pub fn is_multiplexed(self) -> bool {
        !matches!(self, Protocol::Http1)
    }
}

/// A header field (name-value pair).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    pub name: Vec<u8>,
    pub value: Vec<u8>,
}

impl HeaderField {
    /// Create a new header field.
    pub fn new(name: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A request or response head.
///
/// Request line and status travel as pseudo-headers (`:method`, `:path`,
/// `:status`) whatever the protocol version; codecs translate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub headers: Vec<HeaderField>,
    /// Requested egress priority (lower is more urgent).
    pub priority: Option<u8>,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(method: &str, path: &str) -> Self {
        Self::new()
            .with_header(":method", method)
            .with_header(":path", path)
    }

    pub fn response(status: u16) -> Self {
        Self::new().with_header(":status", status.to_string())
    }

    pub fn with_header(mut self, name: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.push(HeaderField::new(name, value));
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    /// First value of the named header.
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name.as_bytes()))
            .map(|h| h.value.as_slice())
    }

    /// Response status, if this is a response.
    pub fn status(&self) -> Option<u16> {
        std::str::from_utf8(self.header(":status")?).ok()?.parse().ok()
    }
}

/// Setting identifiers exchanged in a settings event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingId {
    HeaderTableSize,
    EnablePush,
    MaxConcurrentStreams,
    InitialWindowSize,
    MaxFrameSize,
    MaxHeaderListSize,
    /// Unknown setting ID.
    Unknown(u16),
}

/// A single setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Setting {
    pub id: SettingId,
    pub value: u32,
}

/// Protocol events produced by decoding ingress bytes.
#[derive(Debug, Clone, PartialEq)]
pub enum CodecEvent {
    /// A new message starts on a stream.
    MessageBegin { stream_id: StreamId },
    /// The peer pushes a message associated with one of our streams.
    PushMessageBegin {
        stream_id: StreamId,
        assoc_stream_id: StreamId,
    },
    HeadersComplete {
        stream_id: StreamId,
        message: Message,
    },
    Body { stream_id: StreamId, data: Bytes },
    Trailers {
        stream_id: StreamId,
        trailers: Vec<HeaderField>,
    },
    MessageComplete { stream_id: StreamId, upgrade: bool },
    /// A malformed message scoped to one stream.
    StreamError {
        stream_id: StreamId,
        message: String,
        /// The error happened before the message began.
        new_transaction: bool,
    },
    /// The peer aborted a stream.
    Abort { stream_id: StreamId, code: ErrorCode },
    GoAway {
        last_good_stream_id: StreamId,
        code: ErrorCode,
    },
    PingRequest { id: u64 },
    PingReply { id: u64 },
    /// Send credit returned by the peer. Stream 0 is the session scope.
    WindowUpdate { stream_id: StreamId, amount: u32 },
    Settings(Vec<Setting>),
}

impl CodecEvent {
    /// Stream the event is scoped to, if any.
    pub fn stream_id(&self) -> Option<StreamId> {
        match self {
            CodecEvent::MessageBegin { stream_id }
            | CodecEvent::PushMessageBegin { stream_id, .. }
            | CodecEvent::HeadersComplete { stream_id, .. }
            | CodecEvent::Body { stream_id, .. }
            | CodecEvent::Trailers { stream_id, .. }
            | CodecEvent::MessageComplete { stream_id, .. }
            | CodecEvent::StreamError { stream_id, .. }
            | CodecEvent::Abort { stream_id, .. } => Some(*stream_id),
            CodecEvent::WindowUpdate { stream_id, .. } if !stream_id.is_connection_level() => {
                Some(*stream_id)
            }
            _ => None,
        }
    }
}

/// Frames the session asks the codec to serialize.
#[derive(Debug, Clone, Copy)]
pub enum EgressFrame<'a> {
    Headers {
        stream_id: StreamId,
        message: &'a Message,
        assoc_stream_id: Option<StreamId>,
    },
    Body {
        stream_id: StreamId,
        data: &'a [u8],
        eom: bool,
    },
    Trailers {
        stream_id: StreamId,
        trailers: &'a [HeaderField],
    },
    Eom { stream_id: StreamId },
    Abort { stream_id: StreamId, code: ErrorCode },
    WindowUpdate { stream_id: StreamId, amount: u32 },
    Settings(&'a [Setting]),
    GoAway {
        last_good_stream_id: StreamId,
        code: ErrorCode,
    },
    Ping { id: u64, reply: bool },
}

/// Wire format collaborator.
pub trait Codec {
    /// Protocol family.
    fn protocol(&self) -> Protocol;

    fn is_multiplexed(&self) -> bool {
        self.protocol().is_multiplexed()
    }

    fn supports_stream_flow_control(&self) -> bool {
        self.protocol().is_multiplexed()
    }

    fn supports_session_flow_control(&self) -> bool {
        self.protocol().is_multiplexed()
    }

    fn supports_push(&self) -> bool {
        self.protocol().is_multiplexed()
    }

    fn supports_ping(&self) -> bool {
        self.protocol().is_multiplexed()
    }

    fn supports_goaway(&self) -> bool {
        self.protocol().is_multiplexed()
    }

    /// False once the protocol says the connection cannot carry another
    /// message (for example after `Connection: close`).
    fn is_reusable(&self) -> bool {
        true
    }

    /// Allocate the id for a locally initiated stream.
    fn create_stream_id(&mut self) -> StreamId;

    /// Consume bytes from `buf`, returning zero or more events.
    ///
    /// Incomplete trailing input stays in `buf`. Stream-scoped problems are
    /// reported as [`CodecEvent::StreamError`]; an `Err` is fatal to the
    /// connection.
    fn decode(&mut self, buf: &mut BytesMut) -> Result<Vec<CodecEvent>, FramingError>;

    /// Serialize `frame` into `out`, returning the bytes written.
    ///
    /// Returns 0 for frames the protocol cannot express.
    fn encode(&mut self, frame: &EgressFrame<'_>, out: &mut BytesMut) -> usize;
}
