//! Session configuration.
//!
//! Values are normally loaded from a TOML table; any field left out falls
//! back to the process-wide [`DEFAULTS`] table.

use crate::error::ConfigError;
use crate::flow_control::MAX_WINDOW_SIZE;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Process-wide defaults consulted when a field is not configured.
#[derive(Debug, Clone, Copy)]
pub struct SessionDefaults {
    pub read_buf_limit: usize,
    pub pending_write_max: usize,
    pub write_chunk_size: usize,
    pub max_concurrent_outgoing_streams: u32,
    pub max_concurrent_incoming_streams: u32,
    pub max_concurrent_push_transactions: u32,
    /// Assumed peer limit until the peer announces its own.
    pub remote_outgoing_streams: u32,
    pub initial_receive_window: u32,
    pub receive_stream_window: u32,
    pub receive_session_window: u32,
    pub default_priority: u8,
    pub transaction_timeout_ms: u64,
    pub write_timeout_ms: u64,
}

pub const DEFAULTS: SessionDefaults = SessionDefaults {
    read_buf_limit: 64 * 1024,
    pending_write_max: 8 * 1024,
    write_chunk_size: 16 * 1024,
    max_concurrent_outgoing_streams: 100,
    max_concurrent_incoming_streams: 100,
    max_concurrent_push_transactions: 100,
    remote_outgoing_streams: 100_000,
    initial_receive_window: 65536,
    receive_stream_window: 65536,
    receive_session_window: 65536,
    default_priority: 3,
    transaction_timeout_ms: 60_000,
    write_timeout_ms: 30_000,
};

/// Per-session configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    /// Ingress body bytes buffered across all transactions before reads
    /// are paused.
    #[serde(default = "default_read_buf_limit", deserialize_with = "deserialize_size")]
    pub read_buf_limit: usize,

    /// Bytes handed to the transport but not yet confirmed before every
    /// transaction is paused for egress.
    #[serde(
        default = "default_pending_write_max",
        deserialize_with = "deserialize_size"
    )]
    pub pending_write_max: usize,

    /// Largest body chunk taken from one transaction per flush.
    #[serde(
        default = "default_write_chunk_size",
        deserialize_with = "deserialize_size"
    )]
    pub write_chunk_size: usize,

    #[serde(default = "default_max_concurrent_outgoing_streams")]
    pub max_concurrent_outgoing_streams: u32,

    #[serde(default = "default_max_concurrent_incoming_streams")]
    pub max_concurrent_incoming_streams: u32,

    #[serde(default = "default_max_concurrent_push_transactions")]
    pub max_concurrent_push_transactions: u32,

    /// Initial per-stream receive window announced to the peer.
    #[serde(default = "default_initial_receive_window")]
    pub initial_receive_window: u32,

    /// Per-stream receive window once settings are exchanged.
    #[serde(default = "default_receive_stream_window")]
    pub receive_stream_window: u32,

    /// Session-wide receive window.
    #[serde(default = "default_receive_session_window")]
    pub receive_session_window: u32,

    /// Egress priority for transactions that do not ask for one.
    #[serde(default = "default_priority")]
    pub default_priority: u8,

    #[serde(default = "default_transaction_timeout_ms")]
    pub transaction_timeout_ms: u64,

    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,

    /// Re-arm last-byte events as acknowledgement events.
    #[serde(default)]
    pub track_acks: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            read_buf_limit: default_read_buf_limit(),
            pending_write_max: default_pending_write_max(),
            write_chunk_size: default_write_chunk_size(),
            max_concurrent_outgoing_streams: default_max_concurrent_outgoing_streams(),
            max_concurrent_incoming_streams: default_max_concurrent_incoming_streams(),
            max_concurrent_push_transactions: default_max_concurrent_push_transactions(),
            initial_receive_window: default_initial_receive_window(),
            receive_stream_window: default_receive_stream_window(),
            receive_session_window: default_receive_session_window(),
            default_priority: default_priority(),
            transaction_timeout_ms: default_transaction_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            track_acks: false,
        }
    }
}

impl SessionConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: SessionConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.write_chunk_size == 0 {
            return Err(ConfigError::Invalid {
                field: "write_chunk_size",
                reason: "must be greater than zero".to_string(),
            });
        }

        if self.pending_write_max == 0 {
            return Err(ConfigError::Invalid {
                field: "pending_write_max",
                reason: "must be greater than zero".to_string(),
            });
        }

        for (field, value) in [
            ("initial_receive_window", self.initial_receive_window),
            ("receive_stream_window", self.receive_stream_window),
            ("receive_session_window", self.receive_session_window),
        ] {
            if value > MAX_WINDOW_SIZE {
                return Err(ConfigError::Invalid {
                    field,
                    reason: format!("{} exceeds the maximum window {}", value, MAX_WINDOW_SIZE),
                });
            }
        }

        Ok(())
    }

    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

fn default_read_buf_limit() -> usize {
    DEFAULTS.read_buf_limit
}

fn default_pending_write_max() -> usize {
    DEFAULTS.pending_write_max
}

fn default_write_chunk_size() -> usize {
    DEFAULTS.write_chunk_size
}

fn default_max_concurrent_outgoing_streams() -> u32 {
    DEFAULTS.max_concurrent_outgoing_streams
}

fn default_max_concurrent_incoming_streams() -> u32 {
    DEFAULTS.max_concurrent_incoming_streams
}

fn default_max_concurrent_push_transactions() -> u32 {
    DEFAULTS.max_concurrent_push_transactions
}

fn default_initial_receive_window() -> u32 {
    DEFAULTS.initial_receive_window
}

fn default_receive_stream_window() -> u32 {
    DEFAULTS.receive_stream_window
}

fn default_receive_session_window() -> u32 {
    DEFAULTS.receive_session_window
}

fn default_priority() -> u8 {
    DEFAULTS.default_priority
}

fn default_transaction_timeout_ms() -> u64 {
    DEFAULTS.transaction_timeout_ms
}

fn default_write_timeout_ms() -> u64 {
    DEFAULTS.write_timeout_ms
}

fn deserialize_size<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum SizeValue {
        Number(usize),
        String(String),
    }

    match SizeValue::deserialize(deserializer)? {
        SizeValue::Number(n) => Ok(n),
        SizeValue::String(s) => parse_size(&s).map_err(D::Error::custom),
    }
}

/// Parse a size string like "64KB" or "8MB" into bytes.
pub fn parse_size(s: &str) -> Result<usize, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty size string".to_string());
    }

    let (num_str, suffix) = match s.find(|c: char| c.is_alphabetic()) {
        Some(idx) => (&s[..idx], s[idx..].to_uppercase()),
        None => (s, String::new()),
    };

    let num: usize = num_str
        .trim()
        .parse()
        .map_err(|_| format!("invalid number: {}", num_str))?;

    let multiplier: usize = match suffix.as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KIB" => 1024,
        "M" | "MB" | "MIB" => 1024 * 1024,
        "G" | "GB" | "GIB" => 1024 * 1024 * 1024,
        _ => return Err(format!("unknown size suffix: {}", suffix)),
    };

    num.checked_mul(multiplier)
        .ok_or_else(|| "size overflow".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("1024").unwrap(), 1024);
        assert_eq!(parse_size("8K").unwrap(), 8192);
        assert_eq!(parse_size("64KB").unwrap(), 64 * 1024);
        assert_eq!(parse_size("1 MiB").unwrap(), 1024 * 1024);
        assert!(parse_size("").is_err());
        assert!(parse_size("12XB").is_err());
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = SessionConfig::from_toml_str("").unwrap();
        assert_eq!(config.read_buf_limit, DEFAULTS.read_buf_limit);
        assert_eq!(config.pending_write_max, DEFAULTS.pending_write_max);
        assert_eq!(
            config.max_concurrent_outgoing_streams,
            DEFAULTS.max_concurrent_outgoing_streams
        );
        assert!(!config.track_acks);
    }

    #[test]
    fn test_sizes_accept_strings() {
        let config = SessionConfig::from_toml_str(
            r#"
            read_buf_limit = "128KB"
            pending_write_max = 4096
            max_concurrent_push_transactions = 2
            track_acks = true
            "#,
        )
        .unwrap();
        assert_eq!(config.read_buf_limit, 128 * 1024);
        assert_eq!(config.pending_write_max, 4096);
        assert_eq!(config.max_concurrent_push_transactions, 2);
        assert!(config.track_acks);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = SessionConfig::from_toml_str("bogus = 1").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_validate() {
        let err = SessionConfig::from_toml_str("write_chunk_size = 0").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "write_chunk_size",
                ..
            }
        ));

        let err = SessionConfig::from_toml_str("receive_session_window = 4294967295").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "receive_session_window",
                ..
            }
        ));
    }

    #[test]
    fn test_durations() {
        let config = SessionConfig::default();
        assert_eq!(config.write_timeout(), Duration::from_secs(30));
        assert_eq!(config.transaction_timeout(), Duration::from_secs(60));
    }
}
