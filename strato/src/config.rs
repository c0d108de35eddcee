//! Context-wide configuration.

use strato_cluster::ClusterConfig;
use strato_transport::{ChannelConfig, ExposerConfig};

/// Configuration for an `RpcContext`.
///
/// ```rust
/// use std::time::Duration;
/// use strato::{ChannelConfig, ClusterConfig, RpcConfig};
///
/// let config = RpcConfig::new()
///     .channel(ChannelConfig::new().connections(2))
///     .cluster(ClusterConfig::new().default_retries(3).balancer("round_robin"));
///
/// assert_eq!(config.channel.connections, 2);
/// assert_eq!(config.cluster.strategy, "failover");
/// ```
#[derive(Debug, Clone, Default)]
pub struct RpcConfig {
    /// Connection pools to providers.
    pub channel: ChannelConfig,

    /// Listening sockets for exposed services.
    pub exposer: ExposerConfig,

    /// Defaults for every referred interface.
    pub cluster: ClusterConfig,
}

impl RpcConfig {
    /// Create a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the channel configuration.
    #[must_use]
    pub fn channel(mut self, channel: ChannelConfig) -> Self {
        self.channel = channel;
        self
    }

    /// Set the exposer configuration.
    #[must_use]
    pub fn exposer(mut self, exposer: ExposerConfig) -> Self {
        self.exposer = exposer;
        self
    }

    /// Set the cluster defaults.
    #[must_use]
    pub fn cluster(mut self, cluster: ClusterConfig) -> Self {
        self.cluster = cluster;
        self
    }
}
