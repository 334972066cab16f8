//! Stats sink registered with a session.

use crate::metrics::*;

/// Receives session-level statistics.
#[allow(unused_variables)]
pub trait SessionStats {
    fn record_session_created(&self) {}
    fn record_session_closed(&self) {}
    fn record_transaction_opened(&self) {}
    fn record_transaction_closed(&self) {}
    fn record_stream_refused(&self) {}
    fn record_transaction_error(&self) {}
    fn record_transaction_timeout(&self) {}
    fn record_framing_error(&self) {}
    fn record_bytes_read(&self, bytes: usize) {}
    fn record_bytes_written(&self, bytes: u64) {}
    fn record_egress_paused(&self) {}
    fn record_reset(&self) {}
}

/// Default sink backed by the process-wide metriken registry.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetrikenStats;

impl SessionStats for MetrikenStats {
    fn record_session_created(&self) {
        SESSIONS_CREATED.increment();
        SESSIONS_OPEN.increment();
    }

    fn record_session_closed(&self) {
        SESSIONS_OPEN.decrement();
    }

    fn record_transaction_opened(&self) {
        TRANSACTIONS_CREATED.increment();
        TRANSACTIONS_OPEN.increment();
    }

    fn record_transaction_closed(&self) {
        TRANSACTIONS_OPEN.decrement();
    }

    fn record_stream_refused(&self) {
        STREAMS_REFUSED.increment();
    }

    fn record_transaction_error(&self) {
        TRANSACTION_ERRORS.increment();
    }

    fn record_transaction_timeout(&self) {
        TRANSACTION_TIMEOUTS.increment();
    }

    fn record_framing_error(&self) {
        FRAMING_ERRORS.increment();
    }

    fn record_bytes_read(&self, bytes: usize) {
        BYTES_READ.add(bytes as u64);
    }

    fn record_bytes_written(&self, bytes: u64) {
        BYTES_WRITTEN.add(bytes);
    }

    fn record_egress_paused(&self) {
        EGRESS_PAUSED.increment();
    }

    fn record_reset(&self) {
        SESSION_RESETS.increment();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metriken_stats_counts() {
        let stats = MetrikenStats;
        let before = STREAMS_REFUSED.value();
        stats.record_stream_refused();
        assert!(STREAMS_REFUSED.value() > before);

        let before = BYTES_WRITTEN.value();
        stats.record_bytes_written(128);
        assert!(BYTES_WRITTEN.value() >= before + 128);
    }
}
