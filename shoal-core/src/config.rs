//! Centralized configuration for Shoal.
//!
//! All tunable parameters and settings are defined here to avoid
//! hard-coded values scattered throughout the codebase.

use std::time::Duration;

use crate::ShoalError;

/// Largest block a peer is expected to honour in a single Request.
pub const MAX_BLOCK_SIZE: u32 = 131_072;

/// Central configuration for all Shoal components.
///
/// Groups related configuration settings into logical sections.
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct ShoalConfig {
    pub download: DownloadConfig,
    pub network: NetworkConfig,
}

/// Piece transfer configuration.
///
/// Controls block sizing and request pipelining for each peer connection.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// BitTorrent client identifier used as the peer id prefix
    pub client_id: &'static str,
    /// Bytes requested per Request message
    pub block_size: u32,
    /// Maximum outstanding Request messages per connection
    pub pipeline_depth: usize,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            client_id: "-SH0001-",
            block_size: 16_384, // 16 KiB
            pipeline_depth: 5,
        }
    }
}

/// Peer connection timeouts and limits.
///
/// Every blocking step of a peer connection runs under one of these
/// deadlines so a stalled peer cannot hold a worker indefinitely.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// TCP connection establishment timeout
    pub connect_timeout: Duration,
    /// Deadline for the complete handshake exchange
    pub handshake_timeout: Duration,
    /// Deadline for receiving the peer's initial bitfield
    pub bitfield_timeout: Duration,
    /// Per-read deadline once the connection is active
    pub read_timeout: Duration,
    /// Maximum concurrent peer connections per run
    pub max_peer_connections: usize,
    /// Time workers get to exit after shutdown is signalled
    pub shutdown_grace: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            handshake_timeout: Duration::from_secs(3),
            bitfield_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(30),
            max_peer_connections: 50,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl ShoalConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Allows runtime configuration via environment variables while
    /// maintaining sensible defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(size) = std::env::var("SHOAL_BLOCK_SIZE")
            && let Ok(bytes) = size.parse::<u32>()
        {
            config.download.block_size = bytes;
        }

        if let Ok(depth) = std::env::var("SHOAL_PIPELINE_DEPTH")
            && let Ok(count) = depth.parse::<usize>()
        {
            config.download.pipeline_depth = count;
        }

        if let Ok(timeout) = std::env::var("SHOAL_CONNECT_TIMEOUT")
            && let Ok(seconds) = timeout.parse::<u64>()
        {
            config.network.connect_timeout = Duration::from_secs(seconds);
        }

        if let Ok(timeout) = std::env::var("SHOAL_READ_TIMEOUT")
            && let Ok(seconds) = timeout.parse::<u64>()
        {
            config.network.read_timeout = Duration::from_secs(seconds);
        }

        if let Ok(max_peers) = std::env::var("SHOAL_MAX_PEERS")
            && let Ok(count) = max_peers.parse::<usize>()
        {
            config.network.max_peer_connections = count;
        }

        config
    }

    /// Creates a configuration optimized for testing.
    ///
    /// Loopback peers answer immediately, so deadlines are kept short to
    /// make failure paths fast.
    pub fn for_testing() -> Self {
        Self {
            download: DownloadConfig::default(),
            network: NetworkConfig {
                connect_timeout: Duration::from_millis(500),
                handshake_timeout: Duration::from_millis(500),
                bitfield_timeout: Duration::from_millis(500),
                read_timeout: Duration::from_millis(750),
                max_peer_connections: 50,
                shutdown_grace: Duration::from_millis(500),
            },
        }
    }

    /// Checks that the settings describe a usable download.
    ///
    /// # Errors
    ///
    /// - `ShoalError::Configuration` - If block size or pipeline depth is unusable
    pub fn validate(&self) -> Result<(), ShoalError> {
        if self.download.block_size == 0 || self.download.block_size > MAX_BLOCK_SIZE {
            return Err(ShoalError::Configuration {
                reason: format!(
                    "block size must be between 1 and {MAX_BLOCK_SIZE} bytes, got {}",
                    self.download.block_size
                ),
            });
        }

        if self.download.pipeline_depth == 0 {
            return Err(ShoalError::Configuration {
                reason: "pipeline depth must be at least 1".to_string(),
            });
        }

        if self.network.max_peer_connections == 0 {
            return Err(ShoalError::Configuration {
                reason: "at least one peer connection must be allowed".to_string(),
            });
        }

        Ok(())
    }
}
