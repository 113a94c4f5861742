//! Engine configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::EngineError;

/// Hard ceiling on a single coded payload (20 MiB).
pub const DEFAULT_MAX_PAYLOAD_BYTES: u32 = 20 * 1024 * 1024;

/// Unparsed bytes allowed to accumulate before the framer resets (5 MiB).
pub const DEFAULT_MAX_BUFFERED_BYTES: usize = 5 * 1024 * 1024;

/// Deadline for the TCP connect made during session start.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;

/// Recycled pixel buffers kept per session.
pub const DEFAULT_RECYCLE_CAPACITY: usize = 5;

/// Coded format carried by a session, fixed at connect time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    #[default]
    Hevc,
    H264,
}

/// Per-session tuning shared by every session a manager creates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub codec: CodecKind,
    pub max_payload_bytes: u32,
    pub max_buffered_bytes: usize,
    pub recycle_capacity: usize,
    /// Size of each blocking socket read. Must not exceed `max_buffered_bytes`.
    pub read_chunk_bytes: usize,
    /// SO_RCVBUF requested on connect; `0` keeps the OS default.
    pub recv_buffer_bytes: usize,
    pub tcp_nodelay: bool,
    /// `None` connects without a deadline.
    pub connect_timeout_ms: Option<u64>,
    pub reaper_queue_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            codec: CodecKind::Hevc,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            max_buffered_bytes: DEFAULT_MAX_BUFFERED_BYTES,
            recycle_capacity: DEFAULT_RECYCLE_CAPACITY,
            read_chunk_bytes: 8192,
            recv_buffer_bytes: 1024 * 1024,
            tcp_nodelay: true,
            connect_timeout_ms: Some(DEFAULT_CONNECT_TIMEOUT_MS),
            reaper_queue_capacity: 64,
        }
    }
}

impl EngineConfig {
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }

    /// Reject settings that would make a session unable to make progress.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.read_chunk_bytes == 0 {
            return Err(EngineError::Config("read_chunk_bytes must be > 0".into()));
        }
        if self.max_buffered_bytes < crate::framer::HEADER_LEN {
            return Err(EngineError::Config(format!(
                "max_buffered_bytes must hold at least one {} byte header",
                crate::framer::HEADER_LEN
            )));
        }
        // The framer checks its limit before parsing, so one oversized read
        // would discard complete packets.
        if self.read_chunk_bytes > self.max_buffered_bytes {
            return Err(EngineError::Config(format!(
                "read_chunk_bytes ({}) must not exceed max_buffered_bytes ({})",
                self.read_chunk_bytes, self.max_buffered_bytes
            )));
        }
        if self.reaper_queue_capacity == 0 {
            return Err(EngineError::Config(
                "reaper_queue_capacity must be > 0".into(),
            ));
        }
        if self.connect_timeout_ms == Some(0) {
            return Err(EngineError::Config(
                "connect_timeout_ms must be > 0 when set".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_wire_limits() {
        let config = EngineConfig::default();
        assert_eq!(config.max_payload_bytes, 20 * 1024 * 1024);
        assert_eq!(config.max_buffered_bytes, 5 * 1024 * 1024);
        assert_eq!(config.recycle_capacity, 5);
        assert_eq!(config.codec, CodecKind::Hevc);
        assert_eq!(config.connect_timeout(), Some(Duration::from_secs(5)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"codec":"h264","read_chunk_bytes":4096}"#).unwrap();
        assert_eq!(config.codec, CodecKind::H264);
        assert_eq!(config.read_chunk_bytes, 4096);
        assert_eq!(config.recycle_capacity, DEFAULT_RECYCLE_CAPACITY);
    }

    #[test]
    fn zero_chunk_is_rejected() {
        let config = EngineConfig {
            read_chunk_bytes: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn read_chunk_larger_than_buffer_limit_is_rejected() {
        let config = EngineConfig {
            max_buffered_bytes: 64,
            read_chunk_bytes: 65,
            ..EngineConfig::default()
        };
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));

        let config = EngineConfig {
            read_chunk_bytes: 64,
            ..config
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn missing_timeout_in_json_keeps_the_default_deadline() {
        let config: EngineConfig = serde_json::from_str(r#"{"tcp_nodelay":false}"#).unwrap();
        assert_eq!(config.connect_timeout_ms, Some(DEFAULT_CONNECT_TIMEOUT_MS));

        let config: EngineConfig = serde_json::from_str(r#"{"connect_timeout_ms":null}"#).unwrap();
        assert_eq!(config.connect_timeout(), None);
    }

    #[test]
    fn zero_connect_timeout_is_rejected() {
        let config = EngineConfig {
            connect_timeout_ms: Some(0),
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
