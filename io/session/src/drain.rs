//! Drain and shutdown state.
//!
//! The session keeps its lifecycle flags here rather than scattering them
//! across the orchestrator. Flags only ever move forward; each transition
//! method reports whether this call performed it, which makes the public
//! shutdown operations idempotent.

use std::fmt;

/// Why the connection was closed. Recorded once; the first cause wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Shutdown,
    ReadEof,
    GoAway,
    ParseError,
    ReadError,
    WriteError,
    Timeout,
    NotReusable,
    FlowControl,
    Dropped,
    Reset,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloseReason::Shutdown => "shutdown",
            CloseReason::ReadEof => "read_eof",
            CloseReason::GoAway => "goaway",
            CloseReason::ParseError => "parse_error",
            CloseReason::ReadError => "read_error",
            CloseReason::WriteError => "write_error",
            CloseReason::Timeout => "timeout",
            CloseReason::NotReusable => "not_reusable",
            CloseReason::FlowControl => "flow_control",
            CloseReason::Dropped => "dropped",
            CloseReason::Reset => "reset",
        };
        f.write_str(s)
    }
}

/// Coarse lifecycle phase derived from the flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Active,
    Draining,
    ReadsClosed,
    WritesClosed,
    Closed,
}

#[derive(Debug, Default)]
pub struct DrainController {
    started: bool,
    draining: bool,
    reads_paused: bool,
    reads_shutdown: bool,
    writes_draining: bool,
    writes_shutdown: bool,
    reset: bool,
    ingress_error: bool,
    close_reason: Option<CloseReason>,
}

impl DrainController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> Phase {
        match (self.reads_shutdown, self.writes_shutdown) {
            (true, true) => Phase::Closed,
            _ if self.reset => Phase::Closed,
            (true, false) => Phase::ReadsClosed,
            (false, true) => Phase::WritesClosed,
            (false, false) if self.draining => Phase::Draining,
            (false, false) => Phase::Active,
        }
    }

    pub fn start(&mut self) -> bool {
        !std::mem::replace(&mut self.started, true)
    }

    pub fn begin_drain(&mut self) -> bool {
        !std::mem::replace(&mut self.draining, true)
    }

    pub fn pause_reads(&mut self) -> bool {
        if self.reads_shutdown {
            return false;
        }
        !std::mem::replace(&mut self.reads_paused, true)
    }

    pub fn resume_reads(&mut self) -> bool {
        if self.reads_shutdown {
            return false;
        }
        std::mem::replace(&mut self.reads_paused, false)
    }

    pub fn shutdown_reads(&mut self) -> bool {
        self.reads_paused = false;
        !std::mem::replace(&mut self.reads_shutdown, true)
    }

    /// Writes were asked to close while bytes are still in flight.
    pub fn begin_writes_draining(&mut self) -> bool {
        if self.writes_shutdown {
            return false;
        }
        !std::mem::replace(&mut self.writes_draining, true)
    }

    pub fn shutdown_writes(&mut self) -> bool {
        self.writes_draining = false;
        !std::mem::replace(&mut self.writes_shutdown, true)
    }

    /// Jump straight to closed.
    pub fn mark_reset(&mut self) -> bool {
        self.draining = true;
        self.reads_paused = false;
        self.reads_shutdown = true;
        self.writes_draining = false;
        self.writes_shutdown = true;
        !std::mem::replace(&mut self.reset, true)
    }

    pub fn set_ingress_error(&mut self) {
        self.ingress_error = true;
    }

    /// Record the close reason unless one is already set.
    pub fn set_close_reason(&mut self, reason: CloseReason) -> bool {
        if self.close_reason.is_some() {
            return false;
        }
        self.close_reason = Some(reason);
        true
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn is_draining(&self) -> bool {
        self.draining
    }

    pub fn reads_paused(&self) -> bool {
        self.reads_paused
    }

    pub fn reads_shutdown(&self) -> bool {
        self.reads_shutdown
    }

    pub fn writes_draining(&self) -> bool {
        self.writes_draining
    }

    pub fn writes_shutdown(&self) -> bool {
        self.writes_shutdown
    }

    pub fn is_reset(&self) -> bool {
        self.reset
    }

    pub fn ingress_error(&self) -> bool {
        self.ingress_error
    }

    pub fn is_closed(&self) -> bool {
        self.phase() == Phase::Closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_progression() {
        let mut state = DrainController::new();
        assert_eq!(state.phase(), Phase::Active);

        assert!(state.begin_drain());
        assert_eq!(state.phase(), Phase::Draining);

        assert!(state.shutdown_reads());
        assert_eq!(state.phase(), Phase::ReadsClosed);

        assert!(state.shutdown_writes());
        assert_eq!(state.phase(), Phase::Closed);
    }

    #[test]
    fn test_writes_closed_first() {
        let mut state = DrainController::new();
        state.shutdown_writes();
        assert_eq!(state.phase(), Phase::WritesClosed);
    }

    #[test]
    fn test_transitions_are_idempotent() {
        let mut state = DrainController::new();
        assert!(state.start());
        assert!(!state.start());
        assert!(state.begin_drain());
        assert!(!state.begin_drain());
        assert!(state.shutdown_reads());
        assert!(!state.shutdown_reads());
        assert!(state.shutdown_writes());
        assert!(!state.shutdown_writes());
    }

    #[test]
    fn test_reset_from_any_state() {
        let mut state = DrainController::new();
        assert!(state.mark_reset());
        assert_eq!(state.phase(), Phase::Closed);
        assert!(state.is_draining());
        assert!(!state.mark_reset());
    }

    #[test]
    fn test_close_reason_first_wins() {
        let mut state = DrainController::new();
        assert!(state.set_close_reason(CloseReason::WriteError));
        assert!(!state.set_close_reason(CloseReason::Shutdown));
        assert_eq!(state.close_reason(), Some(CloseReason::WriteError));
    }

    #[test]
    fn test_pause_reads() {
        let mut state = DrainController::new();
        assert!(state.pause_reads());
        assert!(!state.pause_reads());
        assert!(state.resume_reads());
        assert!(!state.resume_reads());

        state.pause_reads();
        state.shutdown_reads();
        assert!(!state.reads_paused());
        assert!(!state.pause_reads());
    }

    #[test]
    fn test_writes_draining() {
        let mut state = DrainController::new();
        assert!(state.begin_writes_draining());
        assert!(state.writes_draining());
        assert_eq!(state.phase(), Phase::Active);
        state.shutdown_writes();
        assert!(!state.writes_draining());
        assert!(!state.begin_writes_draining());
    }
}
