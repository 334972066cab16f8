//! Transport boundary.
//!
//! The session hands whole buffers to a [`Transport`] and never assumes a
//! write completes synchronously. Completion and failure come back through
//! the session's `on_write_success` / `on_write_error` with the
//! [`WriteHandle`] given here.

use crate::write_segments::{WriteFlags, WriteHandle};

use bytes::Bytes;
use std::net::SocketAddr;

/// Abstraction over the byte channel carrying one connection.
pub trait Transport {
    /// Queue `data` for writing. The outcome is reported later for `handle`.
    fn write(&mut self, data: Bytes, handle: WriteHandle, flags: WriteFlags);

    /// Stop delivering ingress.
    fn shutdown_read(&mut self);

    /// Close the write half once queued bytes are flushed.
    fn shutdown_write(&mut self);

    /// Abort the connection, discarding anything unsent.
    fn close_with_reset(&mut self);

    fn pause_reads(&mut self) {}

    fn resume_reads(&mut self) {}

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// False once the transport has failed or been closed.
    fn is_good(&self) -> bool {
        true
    }
}
