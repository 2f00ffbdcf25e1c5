//! Session configuration.
//!
//! [`Config`] can be built in code or deserialized (e.g. from JSON via
//! [`Config::from_json`]). Durations are expressed in milliseconds on the
//! wire. Missing fields take their defaults, and a zero value also means
//! "use the default".
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use tunnel_mux::Config;
//!
//! let config = Config::from_json(r#"{ "keep_alive_interval_ms": 5000 }"#).unwrap();
//! assert_eq!(config.keep_alive_interval, Duration::from_secs(5));
//! assert_eq!(config.stream_buffer_size, 1024);
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::{DEFAULT_MAX_MESSAGE_SIZE, FRAME_HEADER_SIZE};

/// Default inbound buffer capacity of each stream (also its initial credit grant).
pub const DEFAULT_STREAM_BUFFER_SIZE: usize = 1024;

/// Default keep-alive ping period.
pub const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(20);

/// Default time `open` waits for the peer to accept.
pub const DEFAULT_STREAM_ACCEPT_DEADLINE: Duration = Duration::from_secs(30);

/// Default capacity of the queue of streams waiting for `accept`.
pub const DEFAULT_ACCEPT_QUEUE_SIZE: usize = 200;

/// Default period of the dead-stream sweep.
pub const DEFAULT_DEAD_STREAM_CHECK_INTERVAL: Duration = Duration::from_secs(2);

/// Callback invoked once when a session closes.
pub type CloseCallback = Arc<dyn Fn() + Send + Sync>;

/// Configuration for a session.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Keep-alive pings are sent at this period, and a pong must be seen
    /// within the same period.
    #[serde(rename = "keep_alive_interval_ms", with = "duration_ms")]
    pub keep_alive_interval: Duration,

    /// `open` fails with `AcceptTimeout` if the peer has not accepted by then.
    #[serde(rename = "stream_accept_deadline_ms", with = "duration_ms")]
    pub stream_accept_deadline: Duration,

    /// Inbound buffer size of each stream. Capped so that a full buffer
    /// fits in one message of `max_message_size`.
    pub stream_buffer_size: usize,

    /// Peer-initiated streams that may wait for `accept` before the session
    /// is aborted.
    pub accept_queue_size: usize,

    /// Period of the sweep that forgets dead, drained streams.
    #[serde(rename = "dead_stream_check_interval_ms", with = "duration_ms")]
    pub dead_stream_check_interval: Duration,

    /// Largest transport message accepted from the peer.
    pub max_message_size: u32,

    /// Name recorded on the session's tracing span.
    pub name: Option<String>,

    /// Invoked exactly once when the session transitions to closed.
    #[serde(skip)]
    pub close_callback: Option<CloseCallback>,
}

impl Config {
    /// Parse a configuration from JSON.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    /// Replace zero values with defaults.
    pub(crate) fn normalized(mut self) -> Self {
        let defaults = Config::default();
        if self.keep_alive_interval.is_zero() {
            self.keep_alive_interval = defaults.keep_alive_interval;
        }
        if self.stream_accept_deadline.is_zero() {
            self.stream_accept_deadline = defaults.stream_accept_deadline;
        }
        if self.stream_buffer_size == 0 {
            self.stream_buffer_size = defaults.stream_buffer_size;
        }
        if self.accept_queue_size == 0 {
            self.accept_queue_size = defaults.accept_queue_size;
        }
        if self.dead_stream_check_interval.is_zero() {
            self.dead_stream_check_interval = defaults.dead_stream_check_interval;
        }
        if self.max_message_size == 0 {
            self.max_message_size = defaults.max_message_size;
        }
        // A full buffer of credit must fit in one DAT frame the peer will
        // accept, and credit travels as a u32.
        let max_chunk = (self.max_message_size as usize)
            .saturating_sub(FRAME_HEADER_SIZE)
            .max(1);
        self.stream_buffer_size = self
            .stream_buffer_size
            .min(max_chunk)
            .min(u32::MAX as usize);
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL,
            stream_accept_deadline: DEFAULT_STREAM_ACCEPT_DEADLINE,
            stream_buffer_size: DEFAULT_STREAM_BUFFER_SIZE,
            accept_queue_size: DEFAULT_ACCEPT_QUEUE_SIZE,
            dead_stream_check_interval: DEFAULT_DEAD_STREAM_CHECK_INTERVAL,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            name: None,
            close_callback: None,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("keep_alive_interval", &self.keep_alive_interval)
            .field("stream_accept_deadline", &self.stream_accept_deadline)
            .field("stream_buffer_size", &self.stream_buffer_size)
            .field("accept_queue_size", &self.accept_queue_size)
            .field("dead_stream_check_interval", &self.dead_stream_check_interval)
            .field("max_message_size", &self.max_message_size)
            .field("name", &self.name)
            .field("close_callback", &self.close_callback.is_some())
            .finish()
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.keep_alive_interval, Duration::from_secs(20));
        assert_eq!(config.stream_accept_deadline, Duration::from_secs(30));
        assert_eq!(config.stream_buffer_size, 1024);
        assert_eq!(config.accept_queue_size, 200);
        assert_eq!(config.dead_stream_check_interval, Duration::from_secs(2));
        assert!(config.close_callback.is_none());
    }

    #[test]
    fn test_from_json_partial() {
        let config = Config::from_json(
            r#"{
                "stream_accept_deadline_ms": 250,
                "stream_buffer_size": 4096,
                "name": "worker-7"
            }"#,
        )
        .unwrap();

        assert_eq!(config.stream_accept_deadline, Duration::from_millis(250));
        assert_eq!(config.stream_buffer_size, 4096);
        assert_eq!(config.name.as_deref(), Some("worker-7"));
        assert_eq!(config.keep_alive_interval, DEFAULT_KEEP_ALIVE_INTERVAL);
    }

    #[test]
    fn test_from_json_rejects_bad_types() {
        assert!(Config::from_json(r#"{ "stream_buffer_size": "big" }"#).is_err());
    }

    #[test]
    fn test_json_roundtrip_uses_millis() {
        let config = Config {
            keep_alive_interval: Duration::from_millis(1500),
            ..Config::default()
        };
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["keep_alive_interval_ms"], 1500);
        assert!(json.get("close_callback").is_none());
    }

    #[test]
    fn test_normalized_replaces_zeros() {
        let config = Config {
            keep_alive_interval: Duration::ZERO,
            stream_buffer_size: 0,
            accept_queue_size: 0,
            ..Config::default()
        }
        .normalized();

        assert_eq!(config.keep_alive_interval, DEFAULT_KEEP_ALIVE_INTERVAL);
        assert_eq!(config.stream_buffer_size, DEFAULT_STREAM_BUFFER_SIZE);
        assert_eq!(config.accept_queue_size, DEFAULT_ACCEPT_QUEUE_SIZE);
    }

    #[test]
    fn test_normalized_caps_buffer_to_message_size() {
        let config = Config {
            stream_buffer_size: 32 * 1024 * 1024,
            ..Config::default()
        }
        .normalized();
        assert_eq!(
            config.stream_buffer_size,
            DEFAULT_MAX_MESSAGE_SIZE as usize - FRAME_HEADER_SIZE
        );

        let config = Config {
            stream_buffer_size: 4096,
            max_message_size: 1024,
            ..Config::default()
        }
        .normalized();
        assert_eq!(config.stream_buffer_size, 1024 - FRAME_HEADER_SIZE);

        let config = Config {
            max_message_size: 2,
            ..Config::default()
        }
        .normalized();
        assert_eq!(config.stream_buffer_size, 1);
    }

    #[test]
    fn test_debug_hides_callback() {
        let config = Config {
            close_callback: Some(Arc::new(|| {})),
            ..Config::default()
        };
        let rendered = format!("{:?}", config);
        assert!(rendered.contains("close_callback: true"));
    }
}
