//! Session, transaction and protocol error types.

use crate::codec::StreamId;
use crate::flow_control::FlowControlError;
use std::fmt;

/// Error code carried by a stream abort or GOAWAY.
///
/// Only the codes the session itself produces or reacts to are named. A
/// codec passes any other wire code through as [`ErrorCode::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NoError,
    ProtocolError,
    FlowControlError,
    StreamClosed,
    /// The stream was not admitted and may be retried elsewhere.
    RefusedStream,
    Cancel,
    Other(u32),
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::NoError => "no error",
            ErrorCode::ProtocolError => "protocol error",
            ErrorCode::FlowControlError => "flow control error",
            ErrorCode::StreamClosed => "stream closed",
            ErrorCode::RefusedStream => "refused stream",
            ErrorCode::Cancel => "cancel",
            ErrorCode::Other(code) => return write!(f, "error code {code:#x}"),
        };
        f.write_str(name)
    }
}

/// Errors returned to the embedding layer by session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session is draining")]
    Draining,
    #[error("session is closed")]
    Closed,
    #[error("concurrent outgoing stream limit reached")]
    TooManyStreams,
    #[error("codec does not support push transactions")]
    PushNotSupported,
    #[error("concurrent push transaction limit reached")]
    TooManyPushes,
    #[error("operation requires a {0} session")]
    WrongDirection(&'static str),
    #[error("unknown stream {0}")]
    UnknownStream(StreamId),
    #[error("stream {0} already exists")]
    DuplicateStream(StreamId),
    #[error("egress already complete on stream {0}")]
    EgressComplete(StreamId),
    #[error("headers not yet sent on stream {0}")]
    HeadersNotSent(StreamId),
    #[error("flow control: {0}")]
    FlowControl(#[from] FlowControlError),
}

/// A connection-fatal decode failure reported by the codec.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("framing error ({code}): {message}")]
pub struct FramingError {
    pub code: ErrorCode,
    pub message: String,
}

impl FramingError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Configuration loading and validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
}

/// Which half of a transaction an error terminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDirection {
    Ingress,
    Egress,
    IngressAndEgress,
}

impl ErrorDirection {
    pub fn affects_ingress(self) -> bool {
        matches!(self, ErrorDirection::Ingress | ErrorDirection::IngressAndEgress)
    }

    pub fn affects_egress(self) -> bool {
        matches!(self, ErrorDirection::Egress | ErrorDirection::IngressAndEgress)
    }
}

/// Cause of a transaction error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ErrorKind {
    #[error("transport write failed")]
    Write,
    #[error("transport read failed")]
    Read,
    #[error("end of input before message complete")]
    Eof,
    #[error("session shut down")]
    Shutdown,
    #[error("stream aborted by peer: {0}")]
    StreamAbort(ErrorCode),
    #[error("stream not acknowledged by GOAWAY")]
    StreamUnacknowledged,
    #[error("transaction timed out")]
    Timeout,
    #[error("write timed out")]
    WriteTimeout,
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("flow control violation")]
    FlowControl,
    #[error("session dropped")]
    Dropped,
    #[error("connection reset: {0}")]
    ConnectionReset(ErrorCode),
}

/// Error delivered to a transaction's handler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} ({direction:?})")]
pub struct TransactionError {
    pub kind: ErrorKind,
    pub direction: ErrorDirection,
}

impl TransactionError {
    pub fn new(kind: ErrorKind, direction: ErrorDirection) -> Self {
        Self { kind, direction }
    }

    pub fn ingress(kind: ErrorKind) -> Self {
        Self::new(kind, ErrorDirection::Ingress)
    }

    pub fn egress(kind: ErrorKind) -> Self {
        Self::new(kind, ErrorDirection::Egress)
    }

    pub fn both(kind: ErrorKind) -> Self {
        Self::new(kind, ErrorDirection::IngressAndEgress)
    }

    /// Narrow the error to the halves that are still open.
    pub(crate) fn restricted_to(&self, ingress_open: bool, egress_open: bool) -> Option<Self> {
        let ingress = ingress_open && self.direction.affects_ingress();
        let egress = egress_open && self.direction.affects_egress();
        let direction = match (ingress, egress) {
            (true, true) => ErrorDirection::IngressAndEgress,
            (true, false) => ErrorDirection::Ingress,
            (false, true) => ErrorDirection::Egress,
            (false, false) => return None,
        };
        Some(Self::new(self.kind.clone(), direction))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_display() {
        assert_eq!(ErrorCode::RefusedStream.to_string(), "refused stream");
        assert_eq!(ErrorCode::Other(0xb).to_string(), "error code 0xb");
    }

    #[test]
    fn test_session_error_display() {
        let err = SessionError::UnknownStream(StreamId::new(7));
        assert_eq!(err.to_string(), "unknown stream 7");
    }

    #[test]
    fn test_restricted_to() {
        let err = TransactionError::both(ErrorKind::Write);
        assert_eq!(
            err.restricted_to(false, true),
            Some(TransactionError::egress(ErrorKind::Write))
        );
        assert_eq!(err.restricted_to(false, false), None);

        let err = TransactionError::ingress(ErrorKind::Eof);
        assert_eq!(err.restricted_to(false, true), None);
        assert_eq!(err.restricted_to(true, true), Some(err.clone()));
    }
}
