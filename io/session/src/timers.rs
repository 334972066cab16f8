//! Timer service boundary.
//!
//! The session does not own a clock. It asks a [`Timers`] implementation to
//! arm and cancel deadlines; on expiry the embedding layer calls
//! `Session::on_transaction_timeout` or `Session::on_write_timeout`.

use crate::codec::StreamId;

use std::time::Duration;

pub trait Timers {
    fn schedule_transaction_timeout(&mut self, stream_id: StreamId, timeout: Duration);

    fn cancel_transaction_timeout(&mut self, stream_id: StreamId);

    fn schedule_write_timeout(&mut self, timeout: Duration);

    fn cancel_write_timeout(&mut self);
}

/// Timer service that never fires.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTimers;

impl Timers for NoTimers {
    fn schedule_transaction_timeout(&mut self, _stream_id: StreamId, _timeout: Duration) {}

    fn cancel_transaction_timeout(&mut self, _stream_id: StreamId) {}

    fn schedule_write_timeout(&mut self, _timeout: Duration) {}

    fn cancel_write_timeout(&mut self) {}
}
