//! # strato-transport
//!
//! TCP transport for the Strato RPC runtime.
//!
//! This crate provides:
//! - `Multiplexer` - Request/reply correlation on one connection
//! - `Connection` - One multiplexed TCP connection with reader and writer tasks
//! - `Channel` - Fixed-size connection pool to one provider, with health probing
//! - `ServiceRoutes` - Method registry for one exposed service
//! - `Exposer` / `ExposerSet` - Listening sockets routing requests to services
//!
//! ## Threading
//!
//! Everything here is `Send + Sync` and runs on the tokio multi-threaded runtime,
//! so one `Channel` can be shared by every caller of a provider.

mod channel;
mod config;
mod connection;
mod exposer;
mod io;
mod mux;
mod router;

pub use channel::Channel;
pub use config::{ChannelConfig, ExposerConfig};
pub use connection::Connection;
pub use exposer::{Exposer, ExposerSet};
pub use mux::Multiplexer;
pub use router::{Handler, ServiceRoutes};
