//! Protocol tunables. Deserializable so hosts can embed them in their own config file.

use std::time::Duration;

use serde::Deserialize;

use crate::delivery::{RetryPolicy, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_INTERVAL};
use crate::session::DEFAULT_PEER_TTL;
use crate::transfer::DEFAULT_CHUNK_SIZE;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ProtocolConfig {
    /// Heartbeat ticks a silent peer survives (default 5).
    pub peer_ttl: u8,
    /// Delay between retransmissions of an unacknowledged packet (default 1000 ms).
    pub retry_interval_ms: u64,
    /// Retransmissions before a delivery is given up (default 5).
    pub max_retries: u32,
    /// Largest file chunk in bytes (default 64000).
    pub chunk_size: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            peer_ttl: DEFAULT_PEER_TTL,
            retry_interval_ms: DEFAULT_RETRY_INTERVAL.as_millis() as u64,
            max_retries: DEFAULT_MAX_RETRIES,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl ProtocolConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            interval: Duration::from_millis(self.retry_interval_ms),
            max_retries: self.max_retries,
        }
    }
}
