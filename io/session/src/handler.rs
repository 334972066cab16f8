//! Application-facing callbacks.
//!
//! A [`Handler`] owns the application logic of one transaction. Handlers
//! never call back into the session directly: every callback receives an
//! [`Effects`] list, and whatever the handler pushes there is applied by the
//! session once the callback has returned. This keeps ingress dispatch free
//! of re-entrant mutation.

use crate::codec::{HeaderField, Message, StreamId};
use crate::error::{ErrorCode, FramingError, TransactionError};

use bytes::Bytes;

/// A session operation requested by a handler.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    SendHeaders(Message),
    SendBody(Bytes),
    SendTrailers(Vec<HeaderField>),
    SendEom,
    SendAbort(ErrorCode),
    PauseIngress,
    ResumeIngress,
}

/// Operations queued by a handler during a callback.
#[derive(Debug)]
pub struct Effects {
    stream_id: StreamId,
    queue: Vec<Effect>,
}

impl Effects {
    pub(crate) fn new(stream_id: StreamId) -> Self {
        Self {
            stream_id,
            queue: Vec::new(),
        }
    }

    /// Stream of the transaction being called back.
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn send_headers(&mut self, message: Message) {
        self.queue.push(Effect::SendHeaders(message));
    }

    pub fn send_body(&mut self, data: impl Into<Bytes>) {
        self.queue.push(Effect::SendBody(data.into()));
    }

    pub fn send_trailers(&mut self, trailers: Vec<HeaderField>) {
        self.queue.push(Effect::SendTrailers(trailers));
    }

    pub fn send_eom(&mut self) {
        self.queue.push(Effect::SendEom);
    }

    pub fn send_abort(&mut self, code: ErrorCode) {
        self.queue.push(Effect::SendAbort(code));
    }

    pub fn pause_ingress(&mut self) {
        self.queue.push(Effect::PauseIngress);
    }

    pub fn resume_ingress(&mut self) {
        self.queue.push(Effect::ResumeIngress);
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub(crate) fn into_parts(self) -> (StreamId, Vec<Effect>) {
        (self.stream_id, self.queue)
    }
}

/// Per-transaction application callbacks.
pub trait Handler {
    fn on_headers(&mut self, message: Message, effects: &mut Effects);

    fn on_body(&mut self, data: Bytes, effects: &mut Effects);

    fn on_trailers(&mut self, _trailers: Vec<HeaderField>, _effects: &mut Effects) {}

    fn on_eom(&mut self, effects: &mut Effects);

    /// Delivered at most once per error event, scoped to the halves of the
    /// transaction that were still open.
    fn on_error(&mut self, error: &TransactionError, effects: &mut Effects);

    fn on_egress_paused(&mut self) {}

    fn on_egress_resumed(&mut self, _effects: &mut Effects) {}

    /// The peer pushes a transaction associated with this one. Returning
    /// `None` refuses the push.
    fn on_pushed_transaction(&mut self, _stream_id: StreamId) -> Option<Box<dyn Handler>> {
        None
    }

    fn on_first_byte_flushed(&mut self) {}

    fn on_last_byte_flushed(&mut self) {}

    fn on_last_byte_acked(&mut self) {}

    /// Final callback; the transaction is gone afterwards.
    fn on_detached(&mut self) {}
}

/// Supplies handlers for transactions the peer starts and observes the
/// session lifetime.
pub trait Controller {
    /// Handler for a new incoming request.
    fn request_handler(&mut self, stream_id: StreamId, message: &Message) -> Box<dyn Handler>;

    /// Handler for a new stream that failed to parse. `None` aborts the
    /// stream instead of answering it.
    fn parse_error_handler(
        &mut self,
        _stream_id: StreamId,
        _error: &TransactionError,
    ) -> Option<Box<dyn Handler>> {
        Some(Box::new(DirectResponseHandler::new(400)))
    }

    /// Handler for a transaction that timed out before it had one.
    fn transaction_timeout_handler(&mut self, _stream_id: StreamId) -> Option<Box<dyn Handler>> {
        Some(Box::new(DirectResponseHandler::new(408)))
    }

    fn attach_session(&mut self) {}

    fn detach_session(&mut self) {}

    /// A connection-fatal decode error was seen.
    fn on_framing_error(&mut self, _error: &FramingError) {}
}

/// Answers a failed transaction with a bodiless synthetic response.
#[derive(Debug)]
pub struct DirectResponseHandler {
    status: u16,
    responded: bool,
}

impl DirectResponseHandler {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            responded: false,
        }
    }
}

impl Handler for DirectResponseHandler {
    fn on_headers(&mut self, _message: Message, _effects: &mut Effects) {}

    fn on_body(&mut self, _data: Bytes, _effects: &mut Effects) {}

    fn on_eom(&mut self, _effects: &mut Effects) {}

    fn on_error(&mut self, error: &TransactionError, effects: &mut Effects) {
        if self.responded || !error.direction.affects_egress() {
            return;
        }
        self.responded = true;
        effects.send_headers(
            Message::response(self.status)
                .with_header("connection", "close")
                .with_header("content-length", "0"),
        );
        effects.send_eom();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_effects_queue_in_order() {
        let mut effects = Effects::new(StreamId::new(1));
        assert!(effects.is_empty());
        effects.send_headers(Message::response(200));
        effects.send_body(&b"hello"[..]);
        effects.send_eom();

        let (id, queue) = effects.into_parts();
        assert_eq!(id, StreamId::new(1));
        assert_eq!(queue.len(), 3);
        assert_eq!(queue[1], Effect::SendBody(Bytes::from_static(b"hello")));
        assert_eq!(queue[2], Effect::SendEom);
    }

    #[test]
    fn test_direct_response_once() {
        let mut handler = DirectResponseHandler::new(408);
        let error = TransactionError::both(ErrorKind::Timeout);

        let mut effects = Effects::new(StreamId::new(3));
        handler.on_error(&error, &mut effects);
        let (_, queue) = effects.into_parts();
        match &queue[0] {
            Effect::SendHeaders(message) => assert_eq!(message.status(), Some(408)),
            other => panic!("unexpected effect {:?}", other),
        }
        assert_eq!(queue[1], Effect::SendEom);

        let mut effects = Effects::new(StreamId::new(3));
        handler.on_error(&error, &mut effects);
        assert!(effects.is_empty());
    }

    #[test]
    fn test_direct_response_skips_ingress_only() {
        let mut handler = DirectResponseHandler::new(400);
        let mut effects = Effects::new(StreamId::new(3));
        handler.on_error(&TransactionError::ingress(ErrorKind::Eof), &mut effects);
        assert!(effects.is_empty());
    }
}
