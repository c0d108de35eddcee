//! Name-keyed factories for load balancers and fault-tolerance strategies.

use std::collections::HashMap;
use std::sync::Arc;

use strato_core::FrameworkError;

use crate::balancer::{LeastActiveBalancer, LoadBalancer, RandomBalancer, RoundRobinBalancer};
use crate::strategy::{Broadcast, FailFast, Failover, FaultTolerance};

/// Builds a fresh load balancer.
pub type BalancerFactory = Arc<dyn Fn() -> Arc<dyn LoadBalancer> + Send + Sync>;

/// Builds a fault-tolerance strategy.
pub type StrategyFactory = Arc<dyn Fn() -> Arc<dyn FaultTolerance> + Send + Sync>;

/// Startup-time registry of pluggable policies.
///
/// Populated once while the process initializes, then shared read-only.
/// `Extensions::default()` carries the built-in policies:
///
/// | kind | names |
/// |---|---|
/// | balancer | `random`, `round_robin`, `least_active` |
/// | strategy | `failfast`, `failover`, `broadcast` |
///
/// ## Example
///
/// ```rust
/// use std::sync::Arc;
/// use strato_cluster::{Extensions, RoundRobinBalancer};
///
/// let mut extensions = Extensions::default();
/// extensions.register_balancer("rr", || Arc::new(RoundRobinBalancer::new()));
///
/// assert_eq!(extensions.balancer("rr").unwrap().name(), "round_robin");
/// assert!(extensions.balancer("consistent_hash").is_err());
/// ```
#[derive(Clone)]
pub struct Extensions {
    balancers: HashMap<String, BalancerFactory>,
    strategies: HashMap<String, StrategyFactory>,
}

impl Extensions {
    /// Create a registry with no policies at all.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            balancers: HashMap::new(),
            strategies: HashMap::new(),
        }
    }

    /// Register (or replace) a load balancer factory.
    pub fn register_balancer<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn LoadBalancer> + Send + Sync + 'static,
    {
        self.balancers.insert(name.into(), Arc::new(factory));
    }

    /// Register (or replace) a strategy factory.
    pub fn register_strategy<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn FaultTolerance> + Send + Sync + 'static,
    {
        self.strategies.insert(name.into(), Arc::new(factory));
    }

    /// Build the load balancer registered under `name`.
    pub fn balancer(&self, name: &str) -> Result<Arc<dyn LoadBalancer>, FrameworkError> {
        self.balancers
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| FrameworkError::UnknownExtension {
                kind: "load balancer",
                name: name.to_owned(),
            })
    }

    /// Build the strategy registered under `name`.
    pub fn strategy(&self, name: &str) -> Result<Arc<dyn FaultTolerance>, FrameworkError> {
        self.strategies
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| FrameworkError::UnknownExtension {
                kind: "strategy",
                name: name.to_owned(),
            })
    }

    /// Registered balancer names, sorted.
    #[must_use]
    pub fn balancer_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.balancers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Registered strategy names, sorted.
    #[must_use]
    pub fn strategy_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.strategies.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for Extensions {
    fn default() -> Self {
        let mut extensions = Self::empty();
        extensions.register_balancer("random", || Arc::new(RandomBalancer::new()));
        extensions.register_balancer("round_robin", || Arc::new(RoundRobinBalancer::new()));
        extensions.register_balancer("least_active", || Arc::new(LeastActiveBalancer::new()));
        extensions.register_strategy("failfast", || Arc::new(FailFast));
        extensions.register_strategy("failover", || Arc::new(Failover));
        extensions.register_strategy("broadcast", || Arc::new(Broadcast));
        extensions
    }
}

impl std::fmt::Debug for Extensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Extensions")
            .field("balancers", &self.balancer_names())
            .field("strategies", &self.strategy_names())
            .finish()
    }
}
