//! Invoker cluster configuration.

use std::time::Duration;

/// Configuration for an invoker cluster.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Raise failures as errors; otherwise return them inside a `Reply`.
    ///
    /// Business errors are always raised.
    pub surface_exceptions: bool,

    /// Failover retry budget when neither request nor provider sets `retries`.
    pub default_retries: u32,

    /// Calls slower than this are logged as warnings.
    pub slow_call_threshold: Duration,

    /// Load balancer name, unless the address sets `loadbalance`.
    pub balancer: String,

    /// Fault-tolerance strategy name, unless the address sets `cluster`.
    pub strategy: String,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            surface_exceptions: true,
            default_retries: 2,
            slow_call_threshold: Duration::from_secs(1),
            balancer: "random".to_string(),
            strategy: "failover".to_string(),
        }
    }
}

impl ClusterConfig {
    /// Create a new cluster configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise or package failures.
    #[must_use]
    pub fn surface_exceptions(mut self, surface: bool) -> Self {
        self.surface_exceptions = surface;
        self
    }

    /// Set the default retry budget.
    #[must_use]
    pub fn default_retries(mut self, retries: u32) -> Self {
        self.default_retries = retries;
        self
    }

    /// Set the slow call threshold.
    #[must_use]
    pub fn slow_call_threshold(mut self, threshold: Duration) -> Self {
        self.slow_call_threshold = threshold;
        self
    }

    /// Set the default load balancer.
    #[must_use]
    pub fn balancer(mut self, name: impl Into<String>) -> Self {
        self.balancer = name.into();
        self
    }

    /// Set the default fault-tolerance strategy.
    #[must_use]
    pub fn strategy(mut self, name: impl Into<String>) -> Self {
        self.strategy = name.into();
        self
    }
}
