//! Per-interface invocation facade.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Instant;

use serde::{Serialize, de::DeserializeOwned};

use strato_codec::{Serialization, signature_of};
use strato_core::{FrameworkError, Options, Reply, Request, StratoError, service_key};

use crate::balancer::LoadBalancer;
use crate::config::ClusterConfig;
use crate::hooks::{Destroyable, ShutdownHooks};
use crate::strategy::FaultTolerance;

/// Lifecycle of an `InvokerCluster`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClusterState {
    /// Built but not yet initialized; calls fail.
    Uninitialized = 0,
    /// Accepting calls.
    Active = 1,
    /// Torn down; calls fail.
    Destroyed = 2,
}

impl From<u8> for ClusterState {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Uninitialized,
            1 => Self::Active,
            _ => Self::Destroyed,
        }
    }
}

/// The object a consumer calls for one interface.
///
/// Owns a load balancer (fed by discovery) and a fault-tolerance strategy.
/// Moves `Uninitialized -> Active -> Destroyed`; only an active cluster
/// accepts calls.
///
/// Failure handling per call:
/// - business errors are always returned as `Err`, unchanged
/// - with `surface_exceptions` on, framework errors are returned as-is and
///   anything else is wrapped in `FrameworkError::Invocation`
/// - with it off, the failure is packaged in an `Ok(Reply)`
pub struct InvokerCluster {
    interface: String,
    version: String,
    serialization: Serialization,
    options: Options,
    balancer: Arc<dyn LoadBalancer>,
    strategy: Arc<dyn FaultTolerance>,
    config: ClusterConfig,
    state: AtomicU8,
}

impl InvokerCluster {
    /// Create an uninitialized cluster.
    pub fn new(
        interface: impl Into<String>,
        balancer: Arc<dyn LoadBalancer>,
        strategy: Arc<dyn FaultTolerance>,
        config: ClusterConfig,
    ) -> Self {
        Self {
            interface: interface.into(),
            version: String::new(),
            serialization: Serialization::default(),
            options: Options::new(),
            balancer,
            strategy,
            config,
            state: AtomicU8::new(ClusterState::Uninitialized as u8),
        }
    }

    /// Set the interface version.
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Set the serializer used by `invoke`.
    #[must_use]
    pub fn with_serialization(mut self, serialization: Serialization) -> Self {
        self.serialization = serialization;
        self
    }

    /// Add an option applied to every call that does not set it itself.
    #[must_use]
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Activate the cluster and register it for destruction at shutdown.
    ///
    /// Does nothing unless the cluster is still uninitialized.
    pub fn init(self: &Arc<Self>, hooks: &ShutdownHooks) {
        let moved = self
            .state
            .compare_exchange(
                ClusterState::Uninitialized as u8,
                ClusterState::Active as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if moved {
            let weak = Arc::downgrade(self);
            hooks.register(weak);
            tracing::debug!(
                interface = %self.interface,
                balancer = self.balancer.name(),
                strategy = self.strategy.name(),
                "Cluster initialized"
            );
        }
    }

    /// Interface name.
    #[must_use]
    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Interface version.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Routing key: interface plus version.
    #[must_use]
    pub fn service_key(&self) -> String {
        service_key(&self.interface, &self.version)
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ClusterState {
        self.state.load(Ordering::Acquire).into()
    }

    /// Check if the cluster accepts calls.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state() == ClusterState::Active
    }

    /// The load balancer discovery refreshes.
    #[must_use]
    pub fn balancer(&self) -> &Arc<dyn LoadBalancer> {
        &self.balancer
    }

    /// The fault-tolerance strategy.
    #[must_use]
    pub fn strategy(&self) -> &Arc<dyn FaultTolerance> {
        &self.strategy
    }

    /// Cluster configuration.
    #[must_use]
    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Run one logical call through the strategy.
    pub async fn call(&self, mut request: Request) -> Result<Reply, StratoError> {
        for (key, value) in &self.options {
            request
                .options
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        let request_id = request.request_id;
        let method = request.method.clone();
        let started = Instant::now();

        let result = if self.is_active() {
            self.strategy
                .invoke(self.balancer.as_ref(), request, self.config.default_retries)
                .await
        } else {
            Err(FrameworkError::ServiceUnavailable(self.service_key()).into())
        };

        let elapsed = started.elapsed();
        if elapsed > self.config.slow_call_threshold {
            tracing::warn!(
                interface = %self.interface,
                method = %method,
                request_id,
                elapsed_ms = elapsed.as_millis() as u64,
                "Slow call"
            );
        }

        match result {
            Ok(reply) => Ok(reply),
            Err(e) if e.is_business() => Err(e),
            Err(e) if self.config.surface_exceptions => Err(self.surface(e)),
            Err(e) => {
                tracing::debug!(
                    interface = %self.interface,
                    method = %method,
                    error = %e,
                    "Returning failed reply"
                );
                let mut reply = Reply::failed(request_id, e);
                reply.elapsed = elapsed;
                Ok(reply)
            }
        }
    }

    fn surface(&self, error: StratoError) -> StratoError {
        match error {
            StratoError::Framework(_) => error,
            other => FrameworkError::Invocation {
                interface: self.interface.clone(),
                cause: Box::new(other),
            }
            .into(),
        }
    }

    /// Call a method with serde-encoded arguments and decode the result.
    ///
    /// `A` is the argument tuple (or single argument) the provider registered
    /// the method with; its type name is sent as the signature.
    pub async fn invoke<A, R>(&self, method: &str, args: &A) -> Result<R, StratoError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let request = Request::new(self.interface.clone(), method)
            .with_version(self.version.clone())
            .with_signature(signature_of::<A>())
            .with_args(self.serialization.id(), self.serialization.encode(args)?);

        let reply = self.call(request).await?;
        let serialization = Serialization::from_id(reply.serialization)?;
        let bytes = reply.into_result()?;
        Ok(serialization.decode(&bytes)?)
    }

    /// Stop accepting calls, then release every sender and the balancer.
    pub fn destroy(&self) {
        let previous = self
            .state
            .swap(ClusterState::Destroyed as u8, Ordering::AcqRel);
        if ClusterState::from(previous) == ClusterState::Destroyed {
            return;
        }

        for sender in self.balancer.snapshot().iter() {
            sender.destroy();
        }
        self.balancer.destroy();
        tracing::info!(interface = %self.interface, "Cluster destroyed");
    }
}

impl Destroyable for InvokerCluster {
    fn destroy(&self) {
        InvokerCluster::destroy(self);
    }
}

impl std::fmt::Debug for InvokerCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvokerCluster")
            .field("interface", &self.interface)
            .field("version", &self.version)
            .field("state", &self.state())
            .field("balancer", &self.balancer.name())
            .field("strategy", &self.strategy.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::RoundRobinBalancer;
    use crate::sender::testing::*;
    use crate::strategy::{FailFast, Failover};
    use std::time::Duration;
    use strato_core::{BusinessError, TransportError};

    fn cluster(
        strategy: Arc<dyn FaultTolerance>,
        config: ClusterConfig,
        senders: Vec<Arc<crate::sender::Sender>>,
    ) -> Arc<InvokerCluster> {
        let balancer = Arc::new(RoundRobinBalancer::new());
        balancer.refresh(senders);
        Arc::new(InvokerCluster::new("Echo", balancer, strategy, config))
    }

    #[tokio::test]
    async fn test_uninitialized_rejects_calls() {
        let (sender, transport) = sender(9000, vec![Step::Ok(b"1")]);
        let cluster = cluster(Arc::new(FailFast), ClusterConfig::default(), vec![sender]);
        assert_eq!(cluster.state(), ClusterState::Uninitialized);

        let err = cluster.call(Request::new("Echo", "ping")).await.unwrap_err();
        assert!(matches!(
            err,
            StratoError::Framework(FrameworkError::ServiceUnavailable(_))
        ));
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_active_cluster_calls_through() {
        let hooks = ShutdownHooks::new();
        let (sender, _) = sender(9000, vec![Step::Ok(b"42")]);
        let cluster = cluster(Arc::new(FailFast), ClusterConfig::default(), vec![sender]);
        cluster.init(&hooks);

        let reply = cluster.call(Request::new("Echo", "ping")).await.unwrap();
        assert_eq!(reply.into_result().unwrap(), b"42");
        assert_eq!(hooks.len(), 1);
    }

    #[tokio::test]
    async fn test_business_error_always_raised() {
        let hooks = ShutdownHooks::new();
        let (sender, _) = sender(
            9000,
            vec![Step::Fail(BusinessError::new(7, "bad input").into())],
        );
        let config = ClusterConfig::default().surface_exceptions(false);
        let cluster = cluster(Arc::new(Failover), config, vec![sender]);
        cluster.init(&hooks);

        let err = cluster.call(Request::new("Echo", "ping")).await.unwrap_err();
        assert!(matches!(err, StratoError::Business(BusinessError { code: 7, .. })));
    }

    #[tokio::test]
    async fn test_transport_error_wrapped_when_surfaced() {
        let hooks = ShutdownHooks::new();
        let (sender, _) = sender(9000, vec![refused()]);
        let cluster = cluster(Arc::new(FailFast), ClusterConfig::default(), vec![sender]);
        cluster.init(&hooks);

        let err = cluster.call(Request::new("Echo", "ping")).await.unwrap_err();
        match err {
            StratoError::Framework(FrameworkError::Invocation { interface, cause }) => {
                assert_eq!(interface, "Echo");
                assert!(matches!(
                    *cause,
                    StratoError::Transport(TransportError::ConnectionFailed(_))
                ));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_framework_error_surfaced_unchanged() {
        let hooks = ShutdownHooks::new();
        let (a, _) = sender(9000, vec![refused()]);
        let config = ClusterConfig::default().default_retries(1);
        let cluster = cluster(Arc::new(Failover), config, vec![a]);
        cluster.init(&hooks);

        let err = cluster.call(Request::new("Echo", "ping")).await.unwrap_err();
        assert!(matches!(
            err,
            StratoError::Framework(FrameworkError::RetriesExhausted { attempts: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_failure_packaged_when_not_surfaced() {
        let hooks = ShutdownHooks::new();
        let config = ClusterConfig::default().surface_exceptions(false);
        let cluster = cluster(Arc::new(FailFast), config, Vec::new());
        cluster.init(&hooks);

        let request = Request::new("Echo", "ping");
        let id = request.request_id;
        let reply = cluster.call(request).await.unwrap();
        assert_eq!(reply.request_id, id);
        assert!(matches!(
            reply.error(),
            Some(StratoError::Framework(FrameworkError::NoProviderAvailable(_)))
        ));
    }

    #[tokio::test]
    async fn test_destroy_releases_senders() {
        let hooks = ShutdownHooks::new();
        let (sender, transport) = sender(9000, vec![Step::Ok(b"1")]);
        let cluster = cluster(
            Arc::new(FailFast),
            ClusterConfig::default(),
            vec![sender.clone()],
        );
        cluster.init(&hooks);

        hooks.run();
        assert_eq!(cluster.state(), ClusterState::Destroyed);
        assert!(!sender.is_active());
        assert!(transport.closed.load(std::sync::atomic::Ordering::SeqCst));
        assert!(cluster.balancer().snapshot().is_empty());

        let err = cluster.call(Request::new("Echo", "ping")).await.unwrap_err();
        assert!(matches!(
            err,
            StratoError::Framework(FrameworkError::ServiceUnavailable(_))
        ));

        // A destroyed cluster cannot be revived.
        cluster.init(&hooks);
        assert_eq!(cluster.state(), ClusterState::Destroyed);
    }

    #[tokio::test]
    async fn test_default_options_fill_missing_request_options() {
        let hooks = ShutdownHooks::new();
        let (sender, transport) = sender(9000, vec![Step::Ok(b"1")]);
        let balancer = Arc::new(RoundRobinBalancer::new());
        balancer.refresh(vec![sender]);
        let cluster = Arc::new(
            InvokerCluster::new("Echo", balancer, Arc::new(FailFast), ClusterConfig::default())
                .with_option(strato_core::keys::TIMEOUT, "250"),
        );
        cluster.init(&hooks);

        cluster.call(Request::new("Echo", "ping")).await.unwrap();
        cluster
            .call(Request::new("Echo", "ping").with_option(strato_core::keys::TIMEOUT, "75"))
            .await
            .unwrap();
        assert_eq!(
            *transport.timeouts.lock(),
            vec![Duration::from_millis(250), Duration::from_millis(75)]
        );
    }

    #[tokio::test]
    async fn test_typed_invoke() {
        let hooks = ShutdownHooks::new();
        let (sender, _) = sender(9000, vec![Step::Ok(b"\"pong\"")]);
        let cluster = cluster(Arc::new(FailFast), ClusterConfig::default(), vec![sender]);
        cluster.init(&hooks);

        let answer: String = cluster.invoke("ping", &("hello",)).await.unwrap();
        assert_eq!(answer, "pong");
    }

    #[tokio::test]
    async fn test_typed_invoke_decodes_packaged_failure_as_error() {
        let hooks = ShutdownHooks::new();
        let config = ClusterConfig::default()
            .surface_exceptions(false)
            .slow_call_threshold(Duration::ZERO);
        let cluster = cluster(Arc::new(FailFast), config, Vec::new());
        cluster.init(&hooks);

        let result: Result<String, _> = cluster.invoke("ping", &()).await;
        assert!(matches!(
            result,
            Err(StratoError::Framework(FrameworkError::NoProviderAvailable(_)))
        ));
    }
}
