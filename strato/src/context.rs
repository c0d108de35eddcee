//! Lifecycle-scoped registry of live RPC resources.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::runtime::Handle;

use strato_cluster::{Extensions, InvokerCluster, Sender, ShutdownHooks};
use strato_codec::Serialization;
use strato_core::{FrameworkError, ServiceAddress, StratoError, keys};
use strato_discovery::{DiscoveryListener, NotifyListener, Registry, SenderFactory};
use strato_transport::{Channel, ChannelConfig, ExposerSet, ServiceRoutes};

use crate::config::RpcConfig;

/// Opens one channel per new provider address.
struct ChannelFactory {
    config: ChannelConfig,
    runtime: Handle,
    live: DashMap<ServiceAddress, Channel>,
}

impl ChannelFactory {
    fn close_all(&self) {
        for entry in self.live.iter() {
            entry.value().close();
        }
        self.live.clear();
    }
}

impl SenderFactory for ChannelFactory {
    fn create(&self, address: &ServiceAddress) -> Result<Arc<Sender>, StratoError> {
        self.live.retain(|_, channel| !channel.is_closed());

        let channel = Channel::open_in(address.clone(), self.config.clone(), &self.runtime);
        self.live.insert(address.clone(), channel.clone());

        Ok(Arc::new(Sender::new(
            address.clone(),
            Arc::new(channel),
            self.config.request_timeout,
        )))
    }
}

/// A referred interface: its cluster and the listener feeding it.
struct Reference {
    service_key: String,
    cluster: Arc<InvokerCluster>,
    listener: Arc<DiscoveryListener>,
}

/// Everything one RPC deployment keeps alive.
///
/// Consumers `refer` an interface to get an `InvokerCluster` kept in sync
/// with the registries; providers `expose` a set of routes on an address and
/// advertise it. `shutdown` (or dropping the context) withdraws advertised
/// addresses, destroys every cluster and closes every channel and socket.
///
/// Independent contexts share nothing, so tests can run several side by side.
///
/// ## Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use strato::{LocalRegistry, RpcConfig, RpcContext, ServiceAddress, ServiceRoutes, StratoError};
///
/// # async fn run() -> Result<(), StratoError> {
/// let registry = Arc::new(LocalRegistry::new("local://demo"));
/// let context = RpcContext::new(RpcConfig::default(), tokio::runtime::Handle::current())
///     .with_registry(registry);
///
/// let routes = ServiceRoutes::new("com.acme.Greeter")
///     .method("greet", |name: String| async move { Ok::<_, StratoError>(format!("hello, {name}")) });
/// context.expose(&ServiceAddress::new("127.0.0.1", 0, "com.acme.Greeter"), routes).await?;
///
/// let greeter = context.refer(&ServiceAddress::new("127.0.0.1", 0, "com.acme.Greeter"))?;
/// let reply: String = greeter.invoke("greet", &String::from("world")).await?;
/// assert_eq!(reply, "hello, world");
///
/// context.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct RpcContext {
    config: RpcConfig,
    extensions: Extensions,
    registries: Vec<Arc<dyn Registry>>,
    channels: Arc<ChannelFactory>,
    references: DashMap<String, Reference>,
    exposers: ExposerSet,
    exposed: DashMap<ServiceAddress, ServiceAddress>,
    hooks: ShutdownHooks,
    closed: AtomicBool,
}

impl RpcContext {
    /// Create a context whose background work runs on `runtime`.
    #[must_use]
    pub fn new(config: RpcConfig, runtime: Handle) -> Self {
        Self {
            channels: Arc::new(ChannelFactory {
                config: config.channel.clone(),
                runtime,
                live: DashMap::new(),
            }),
            exposers: ExposerSet::new(config.exposer.clone()),
            extensions: Extensions::default(),
            registries: Vec::new(),
            references: DashMap::new(),
            exposed: DashMap::new(),
            hooks: ShutdownHooks::new(),
            closed: AtomicBool::new(false),
            config,
        }
    }

    /// Add a registry to advertise on and subscribe to.
    #[must_use]
    pub fn with_registry(mut self, registry: Arc<dyn Registry>) -> Self {
        self.registries.push(registry);
        self
    }

    /// Replace the balancer and strategy tables.
    #[must_use]
    pub fn with_extensions(mut self, extensions: Extensions) -> Self {
        self.extensions = extensions;
        self
    }

    /// Context configuration.
    #[must_use]
    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    /// Check if the context has been shut down.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of provider channels currently open.
    #[must_use]
    pub fn open_channels(&self) -> usize {
        self.channels
            .live
            .iter()
            .filter(|entry| !entry.value().is_closed())
            .count()
    }

    /// Get the cluster for an interface, creating and subscribing it on first use.
    ///
    /// `consumer` names the interface, version and form to call; its
    /// `loadbalance`, `cluster`, `serialization` and `retries` options override
    /// the context defaults, and its `timeout` applies to every call that does
    /// not set one. Referring the same interface and form twice returns
    /// the same cluster.
    pub fn refer(&self, consumer: &ServiceAddress) -> Result<Arc<InvokerCluster>, StratoError> {
        if self.is_closed() {
            return Err(FrameworkError::ServiceUnavailable(consumer.service_key()).into());
        }

        let entry = match self.references.entry(reference_key(consumer)) {
            Entry::Occupied(entry) => return Ok(entry.get().cluster.clone()),
            Entry::Vacant(entry) => entry,
        };

        let reference = self.build_reference(consumer)?;
        let cluster = reference.cluster.clone();
        entry.insert(reference);

        tracing::info!(
            interface = consumer.interface(),
            version = consumer.version(),
            form = consumer.form(),
            "Interface referred"
        );
        Ok(cluster)
    }

    fn build_reference(&self, consumer: &ServiceAddress) -> Result<Reference, StratoError> {
        let defaults = &self.config.cluster;
        let balancer = self.extensions.balancer(
            consumer
                .option(keys::LOADBALANCE)
                .unwrap_or(defaults.balancer.as_str()),
        )?;
        let strategy = self.extensions.strategy(
            consumer
                .option(keys::CLUSTER)
                .unwrap_or(defaults.strategy.as_str()),
        )?;
        let serialization = match consumer.serialization() {
            Some(id) => Serialization::from_id(id)?,
            None => Serialization::default(),
        };

        let mut config = defaults.clone();
        if let Some(retries) = consumer.retries() {
            config.default_retries = retries;
        }

        let mut cluster =
            InvokerCluster::new(consumer.interface(), balancer.clone(), strategy, config)
                .with_version(consumer.version())
                .with_serialization(serialization);
        if let Some(timeout) = consumer.option(keys::TIMEOUT) {
            cluster = cluster.with_option(keys::TIMEOUT, timeout);
        }
        let cluster = Arc::new(cluster);
        cluster.init(&self.hooks);

        let listener = Arc::new(DiscoveryListener::new(
            consumer.interface(),
            consumer.form(),
            balancer,
            self.channels.clone(),
        ));

        let reference = Reference {
            service_key: consumer.service_key(),
            cluster,
            listener,
        };

        for (subscribed, registry) in self.registries.iter().enumerate() {
            let listener: Arc<dyn NotifyListener> = reference.listener.clone();
            if let Err(e) = registry.subscribe(&reference.service_key, listener) {
                self.release(&reference, &self.registries[..subscribed]);
                return Err(e.into());
            }
        }
        Ok(reference)
    }

    /// Unsubscribe and destroy a referred interface.
    ///
    /// Returns `false` if it was not referred.
    pub fn unrefer(&self, consumer: &ServiceAddress) -> bool {
        match self.references.remove(&reference_key(consumer)) {
            Some((_, reference)) => {
                self.release(&reference, &self.registries);
                true
            }
            None => false,
        }
    }

    fn release(&self, reference: &Reference, registries: &[Arc<dyn Registry>]) {
        let listener: Arc<dyn NotifyListener> = reference.listener.clone();
        for registry in registries {
            if let Err(e) = registry.unsubscribe(&reference.service_key, &listener) {
                tracing::debug!(
                    registry = registry.endpoint(),
                    service = %reference.service_key,
                    error = %e,
                    "Unsubscribe failed"
                );
            }
        }
        reference.listener.destroy();
        reference.cluster.destroy();
    }

    /// Expose `routes` on `address` and advertise it on every registry.
    ///
    /// Port 0 binds an ephemeral port; the returned address carries the port
    /// actually bound. Exposing the same service on the same address twice
    /// fails with `FrameworkError::DuplicateExpose`.
    pub async fn expose(
        &self,
        address: &ServiceAddress,
        routes: ServiceRoutes,
    ) -> Result<ServiceAddress, StratoError> {
        if self.is_closed() {
            return Err(FrameworkError::ServiceUnavailable(address.service_key()).into());
        }
        if routes.service_key() != address.service_key() {
            return Err(FrameworkError::InvalidAddress(format!(
                "{address} does not name service {}",
                routes.service_key()
            ))
            .into());
        }

        let bound = self.exposers.expose(address, routes).await?;
        let advertised = if address.port() == 0 {
            address.with_endpoint(address.host(), bound.port())
        } else {
            address.clone()
        };

        for (accepted, registry) in self.registries.iter().enumerate() {
            if let Err(e) = registry.register(&advertised) {
                tracing::warn!(
                    registry = registry.endpoint(),
                    address = %advertised,
                    error = %e,
                    "Register failed, hiding service"
                );
                for earlier in &self.registries[..accepted] {
                    if let Err(err) = earlier.deregister(&advertised) {
                        tracing::debug!(registry = earlier.endpoint(), error = %err, "Deregister failed");
                    }
                }
                self.exposers.hide(address).await;
                return Err(e.into());
            }
        }
        self.exposed.insert(address.clone(), advertised.clone());
        Ok(advertised)
    }

    /// Withdraw and hide a service exposed with `expose`.
    ///
    /// Accepts either the address passed to `expose` or the one it returned.
    /// The socket closes once no service is left on it. Returns `false` if the
    /// service was not exposed.
    pub async fn hide(&self, address: &ServiceAddress) -> bool {
        let requested = if self.exposed.contains_key(address) {
            Some(address.clone())
        } else {
            self.exposed
                .iter()
                .find(|entry| entry.value() == address)
                .map(|entry| entry.key().clone())
        };
        let Some((requested, advertised)) = requested.and_then(|key| self.exposed.remove(&key))
        else {
            return false;
        };

        self.withdraw(&advertised);
        self.exposers.hide(&requested).await
    }

    fn withdraw(&self, advertised: &ServiceAddress) {
        for registry in &self.registries {
            if let Err(e) = registry.deregister(advertised) {
                tracing::warn!(
                    registry = registry.endpoint(),
                    address = %advertised,
                    error = %e,
                    "Deregister failed"
                );
            }
        }
    }

    /// Addresses currently exposed and advertised.
    #[must_use]
    pub fn exposed(&self) -> Vec<ServiceAddress> {
        let mut addresses: Vec<ServiceAddress> =
            self.exposed.iter().map(|entry| entry.value().clone()).collect();
        addresses.sort();
        addresses
    }

    /// Tear down everything that does not need to wait.
    fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }

        let advertised: Vec<ServiceAddress> =
            self.exposed.iter().map(|entry| entry.value().clone()).collect();
        self.exposed.clear();
        for address in &advertised {
            self.withdraw(address);
        }

        let keys: Vec<String> = self.references.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, reference)) = self.references.remove(&key) {
                self.release(&reference, &self.registries);
            }
        }

        self.hooks.run();
        self.channels.close_all();
        true
    }

    /// Withdraw every exposed service, destroy every cluster, and close every
    /// channel and listening socket.
    pub async fn shutdown(&self) {
        if self.close() {
            self.exposers.destroy().await;
            tracing::info!("Context shut down");
        }
    }
}

impl Drop for RpcContext {
    fn drop(&mut self) {
        // exposers close themselves when the set is dropped
        self.close();
    }
}

impl std::fmt::Debug for RpcContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcContext")
            .field("registries", &self.registries.len())
            .field("references", &self.references.len())
            .field("exposed", &self.exposed.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn reference_key(consumer: &ServiceAddress) -> String {
    format!("{}#{}", consumer.service_key(), consumer.form())
}
