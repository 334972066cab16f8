//! http-session - protocol-agnostic HTTP session engine.
//!
//! A session owns one connection and multiplexes HTTP transactions over it.
//! It does not parse or serialize bytes itself and it does no I/O: a
//! [`Codec`] turns ingress bytes into [`CodecEvent`]s and serializes
//! [`EgressFrame`]s, and a [`Transport`] carries the bytes. The embedding
//! reactor calls into the session when bytes arrive, when writes complete
//! and when timers fire, and calls [`Session::run_loop_callback`] once per
//! loop pass to flush egress.
//!
//! # Features
//!
//! - Upstream (client) and downstream (server) sessions
//! - Outgoing, incoming and push stream limits
//! - Stream and session flow control
//! - Priority ordered egress with write coalescing and backpressure
//! - First byte, last byte and acknowledgement notifications
//! - Graceful drain, half-close and reset teardown
//!
//! # Architecture
//!
//! - `session`: the orchestrator
//! - `transaction`, `transaction_table`: per-stream state and the live set
//! - `flow_control`, `egress_queue`, `write_segments`, `byte_events`:
//!   egress bookkeeping
//! - `drain`: connection lifecycle state
//! - `codec`, `transport`, `timers`: collaborator boundaries
//! - `handler`, `info`, `stats`: application and observer callbacks
//! - `config`: tunables, loadable from TOML

pub mod byte_events;
pub mod codec;
pub mod config;
pub mod drain;
pub mod egress_queue;
pub mod error;
pub mod flow_control;
pub mod handler;
pub mod info;
pub mod metrics;
pub mod session;
pub mod stats;
pub mod timers;
pub mod transaction;
pub mod transaction_table;
pub mod transport;
pub mod write_segments;

// Re-export commonly used types
pub use byte_events::{ByteEvent, ByteEventKind, ByteEventTracker};
pub use codec::{
    Codec, CodecEvent, EgressFrame, HeaderField, Message, Protocol, Setting, SettingId, StreamId,
};
pub use config::{DEFAULTS, SessionConfig};
pub use drain::{CloseReason, Phase};
pub use egress_queue::Priority;
pub use error::{
    ConfigError, ErrorCode, ErrorDirection, ErrorKind, FramingError, SessionError,
    TransactionError,
};
pub use flow_control::{DEFAULT_WINDOW_SIZE, FlowControlError, FlowControlWindow, MAX_WINDOW_SIZE};
pub use handler::{Controller, DirectResponseHandler, Effect, Effects, Handler};
pub use info::{InfoCallback, SessionInfo};
pub use session::Session;
pub use stats::{MetrikenStats, SessionStats};
pub use timers::{NoTimers, Timers};
pub use transaction::{Direction, Initiator, StreamState, Transaction};
pub use transport::Transport;
pub use write_segments::{WriteFlags, WriteHandle};
