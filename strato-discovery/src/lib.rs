//! # strato-discovery
//!
//! Service discovery for the Strato RPC runtime.
//!
//! This crate provides:
//! - `Registry` trait for backing registries (register, deregister, subscribe)
//! - `NotifyListener` trait for registry push notifications
//! - `LocalRegistry` for in-process discovery
//! - `DiscoveryListener` turning provider lists into load balancer refreshes

mod listener;
mod registry;

pub use listener::{DiscoveryListener, SenderFactory};
pub use registry::{LocalRegistry, NotifyListener, Registry, RegistryError};
