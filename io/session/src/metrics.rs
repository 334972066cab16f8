//! Session metrics.

use metriken::{Counter, Gauge, metric};

/// Sessions currently alive.
#[metric(name = "session_open")]
pub static SESSIONS_OPEN: Gauge = Gauge::new();

/// Sessions ever created.
#[metric(name = "session_created")]
pub static SESSIONS_CREATED: Counter = Counter::new();

/// Transactions currently alive across all sessions.
#[metric(name = "session_transactions_open")]
pub static TRANSACTIONS_OPEN: Gauge = Gauge::new();

/// Transactions ever created.
#[metric(name = "session_transactions_created")]
pub static TRANSACTIONS_CREATED: Counter = Counter::new();

/// Peer-initiated streams refused at admission.
#[metric(name = "session_streams_refused")]
pub static STREAMS_REFUSED: Counter = Counter::new();

/// Transactions that ended with an error.
#[metric(name = "session_transaction_errors")]
pub static TRANSACTION_ERRORS: Counter = Counter::new();

/// Transaction timeouts.
#[metric(name = "session_transaction_timeouts")]
pub static TRANSACTION_TIMEOUTS: Counter = Counter::new();

/// Connection-fatal framing errors.
#[metric(name = "session_framing_errors")]
pub static FRAMING_ERRORS: Counter = Counter::new();

/// Bytes read from transports.
#[metric(name = "session_bytes_read")]
pub static BYTES_READ: Counter = Counter::new();

/// Bytes confirmed written to transports.
#[metric(name = "session_bytes_written")]
pub static BYTES_WRITTEN: Counter = Counter::new();

/// Times egress backpressure paused all transactions of a session.
#[metric(name = "session_egress_paused")]
pub static EGRESS_PAUSED: Counter = Counter::new();

/// Sessions torn down with a reset.
#[metric(name = "session_resets")]
pub static SESSION_RESETS: Counter = Counter::new();
