//! Tuning knobs for device sessions and transfers.

use std::time::Duration;

/// Configuration for [`DeviceSessionManager`](crate::device::DeviceSessionManager).
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long a cached directory listing stays valid.
    pub listing_ttl: Duration,
    /// Timeout applied to each individual protocol operation.
    pub op_timeout: Duration,
    /// Number of chunks a streaming download/upload may buffer ahead of the
    /// consumer. Bounds transfer memory to `stream_lookahead * chunk size`.
    pub stream_lookahead: usize,
    /// Depth of the per-device command queue.
    pub command_queue_depth: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            listing_ttl: Duration::from_secs(5),
            op_timeout: Duration::from_secs(30),
            stream_lookahead: 4,
            command_queue_depth: 32,
        }
    }
}

/// Configuration for [`TransferEngine`](crate::transfer::TransferEngine).
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Chunk size for chunked and streaming copies.
    ///
    /// 4 MiB keeps per-chunk protocol overhead low on device transfers while
    /// still giving cancellation and progress a sub-second granularity on
    /// slow network mounts.
    pub chunk_size: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: 4 * 1024 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.listing_ttl, Duration::from_secs(5));
        assert_eq!(config.op_timeout, Duration::from_secs(30));
        assert_eq!(config.stream_lookahead, 4);
    }

    #[test]
    fn test_transfer_defaults() {
        let config = TransferConfig::default();
        assert_eq!(config.chunk_size, 4 * 1024 * 1024);
    }
}
