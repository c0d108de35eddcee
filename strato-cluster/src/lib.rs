//! # strato-cluster
//!
//! Consumer-side invocation pipeline for the Strato RPC runtime.
//!
//! This crate provides:
//! - `Sender` - One provider address bound to the transport that reaches it
//! - `LoadBalancer` - Sender selection (`random`, `round_robin`, `least_active`)
//! - `FaultTolerance` - Call policies (`failfast`, `failover`, `broadcast`)
//! - `InvokerCluster` - The per-interface facade consumers call
//! - `Extensions` - Name-keyed factories for balancers and strategies
//! - `ShutdownHooks` - Destroy-on-shutdown registration
//!
//! ## Pipeline
//!
//! ```text
//! InvokerCluster::call
//!   -> FaultTolerance::invoke   (retry / fan-out policy)
//!     -> LoadBalancer::select_* (over the current snapshot)
//!       -> Sender::invoke       (transport call with timeout)
//! ```

mod balancer;
mod cluster;
mod config;
mod extensions;
mod hooks;
mod sender;
mod strategy;

pub use balancer::{LeastActiveBalancer, LoadBalancer, RandomBalancer, RoundRobinBalancer, Snapshot};
pub use cluster::{ClusterState, InvokerCluster};
pub use config::ClusterConfig;
pub use extensions::{BalancerFactory, Extensions, StrategyFactory};
pub use hooks::{Destroyable, ShutdownHooks};
pub use sender::Sender;
pub use strategy::{Broadcast, FailFast, Failover, FaultTolerance};
