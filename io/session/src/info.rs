//! Session lifecycle side channel.

use crate::transaction::Direction;

use std::net::SocketAddr;
use std::time::Duration;

/// Read-only view of a session passed to [`InfoCallback`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionInfo {
    pub direction: Direction,
    pub local_addr: Option<SocketAddr>,
    pub peer_addr: Option<SocketAddr>,
    pub outgoing_streams: usize,
    pub incoming_streams: usize,
}

/// Observer of session milestones. Every method defaults to a no-op.
///
/// Callbacks only see a [`SessionInfo`] snapshot and so cannot mutate the
/// session they report on.
#[allow(unused_variables)]
pub trait InfoCallback {
    fn on_create(&mut self, info: &SessionInfo) {}

    fn on_ingress_error(&mut self, info: &SessionInfo, error: &str) {}

    fn on_read(&mut self, info: &SessionInfo, bytes: usize) {}

    fn on_write(&mut self, info: &SessionInfo, bytes: usize) {}

    fn on_request_begin(&mut self, info: &SessionInfo) {}

    fn on_request_end(&mut self, info: &SessionInfo) {}

    /// First transaction of an idle session started.
    fn on_activate_connection(&mut self, info: &SessionInfo) {}

    /// Last transaction of a busy session finished.
    fn on_deactivate_connection(&mut self, info: &SessionInfo) {}

    fn on_destroy(&mut self, info: &SessionInfo) {}

    fn on_ingress_message(&mut self, info: &SessionInfo) {}

    fn on_ingress_limit_exceeded(&mut self, info: &SessionInfo) {}

    fn on_ingress_paused(&mut self, info: &SessionInfo) {}

    fn on_transaction_detached(&mut self, info: &SessionInfo) {}

    fn on_ping_reply(&mut self, latency: Duration) {}

    fn on_settings_outgoing_streams_full(&mut self, info: &SessionInfo) {}

    fn on_settings_outgoing_streams_not_full(&mut self, info: &SessionInfo) {}
}
