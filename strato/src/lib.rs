//! # Strato
//!
//! RPC runtime for internal service-to-service calls.
//!
//! Strato provides:
//! - **Binary wire protocol** with two coexisting frame layouts for rolling upgrades
//! - **Pooled channels**: fixed-size connection pools with health probing and lazy rebuild
//! - **Load balancing**: random, round-robin, and least-active selection
//! - **Fault tolerance**: failfast, failover with retry budget, and broadcast
//! - **Discovery**: registry push notifications kept in sync with the live provider set
//! - **Service exposure**: several services multiplexed behind one listening address
//!
//! ## Quick Start
//!
//! ```rust
//! use strato::{RpcConfig, ServiceAddress, ServiceRoutes, StratoError};
//!
//! // Provider side: a method registry for one interface
//! let routes = ServiceRoutes::new("com.acme.Greeter")
//!     .with_version("1.0")
//!     .method("greet", |name: String| async move {
//!         Ok::<_, StratoError>(format!("hello, {name}"))
//!     });
//! assert_eq!(routes.service_key(), "com.acme.Greeter:1.0");
//!
//! // Consumer side: addresses carry per-provider options
//! let address: ServiceAddress = "strato://127.0.0.1:9000/com.acme.Greeter?version=1.0&retries=3"
//!     .parse()
//!     .unwrap();
//! assert_eq!(address.retries(), Some(3));
//!
//! let config = RpcConfig::default();
//! assert_eq!(config.cluster.strategy, "failover");
//! ```
//!
//! ## Architecture
//!
//! Strato is composed of several crates:
//!
//! - [`strato-core`] - Error taxonomy, addresses, requests, replies, and the `Transport` trait
//! - [`strato-codec`] - Varint cursor, dual-layout frame codec, and serializers
//! - [`strato-transport`] - Connections, channel pools, method registries, and exposers
//! - [`strato-cluster`] - Senders, load balancers, fault tolerance, and invoker clusters
//! - [`strato-discovery`] - Registry contracts and discovery listeners
//!
//! `RpcContext` ties them together for one deployment.

mod config;
mod context;

pub use config::RpcConfig;
pub use context::RpcContext;

// Re-export core types
pub use strato_core::{
    BusinessError, DEFAULT_SERIALIZATION, FramingError, FrameworkError, Options, Reply, Request,
    Response, ServiceAddress, StratoError, TRACE_ID, Transport, TransportError, keys,
};

// Re-export codec
pub use strato_codec::{CodecConfig, Frame, FrameKind, FrameVersion, Serialization, WireCodec};

// Re-export transport
pub use strato_transport::{
    Channel, ChannelConfig, Connection, Exposer, ExposerConfig, ExposerSet, ServiceRoutes,
};

// Re-export cluster
pub use strato_cluster::{
    Broadcast, ClusterConfig, ClusterState, Destroyable, Extensions, FailFast, Failover,
    FaultTolerance, InvokerCluster, LeastActiveBalancer, LoadBalancer, RandomBalancer,
    RoundRobinBalancer, Sender, ShutdownHooks,
};

// Re-export discovery
pub use strato_discovery::{
    DiscoveryListener, LocalRegistry, NotifyListener, Registry, RegistryError, SenderFactory,
};

// Re-export serde for user convenience
pub use serde::{Deserialize, Serialize};

/// Prelude module for convenient imports.
///
/// ```rust
/// use strato::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        Deserialize, InvokerCluster, Registry, RpcConfig, RpcContext, Serialize, ServiceAddress,
        ServiceRoutes, StratoError,
    };

    pub use strato_core::Transport;
}

/// Version information.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
