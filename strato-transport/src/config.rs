//! Client pool and server configuration.

use std::time::Duration;

use strato_codec::CodecConfig;

/// Configuration for a provider channel (connection pool).
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Connections per provider address, unless the address sets `connections`.
    pub connections: usize,

    /// Connection timeout.
    pub connect_timeout: Duration,

    /// Request timeout, unless the request or address sets `timeout`.
    pub request_timeout: Duration,

    /// Interval between health probes.
    pub heartbeat_interval: Duration,

    /// How long a health probe may take before the connection is marked inactive.
    pub heartbeat_timeout: Duration,

    /// Open connections in the background instead of during `Channel::open`.
    pub lazy_connect: bool,

    /// Enable TCP nodelay.
    pub nodelay: bool,

    /// Frame codec settings.
    pub codec: CodecConfig,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            connections: 4,
            connect_timeout: Duration::from_secs(3),
            request_timeout: Duration::from_secs(3),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(3),
            lazy_connect: false,
            nodelay: true,
            codec: CodecConfig::default(),
        }
    }
}

impl ChannelConfig {
    /// Create a new channel configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set connections per address.
    #[must_use]
    pub fn connections(mut self, connections: usize) -> Self {
        self.connections = connections;
        self
    }

    /// Set the connect timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the default request timeout.
    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the health probe interval.
    #[must_use]
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the health probe timeout.
    #[must_use]
    pub fn heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    /// Connect in the background.
    #[must_use]
    pub fn lazy_connect(mut self, lazy: bool) -> Self {
        self.lazy_connect = lazy;
        self
    }

    /// Set the frame codec configuration.
    #[must_use]
    pub fn codec(mut self, codec: CodecConfig) -> Self {
        self.codec = codec;
        self
    }
}

/// Configuration for an exposer (listening side).
#[derive(Debug, Clone)]
pub struct ExposerConfig {
    /// Frame codec settings.
    pub codec: CodecConfig,

    /// Requests handled concurrently per connection.
    pub max_in_flight_per_connection: usize,

    /// Enable TCP nodelay on accepted sockets.
    pub nodelay: bool,
}

impl Default for ExposerConfig {
    fn default() -> Self {
        Self {
            codec: CodecConfig::default(),
            max_in_flight_per_connection: 256,
            nodelay: true,
        }
    }
}

impl ExposerConfig {
    /// Create a new exposer configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the frame codec configuration.
    #[must_use]
    pub fn codec(mut self, codec: CodecConfig) -> Self {
        self.codec = codec;
        self
    }

    /// Set the per-connection in-flight limit.
    #[must_use]
    pub fn max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight_per_connection = max;
        self
    }
}
