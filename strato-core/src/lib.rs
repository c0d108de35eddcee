//! # strato-core
//!
//! Core types, traits, and error definitions for the Strato RPC runtime.
//!
//! This crate provides:
//! - Error taxonomy (`StratoError` and its framing/transport/business/framework parts)
//! - Provider addresses (`ServiceAddress`)
//! - Call records (`Request`, `Reply`) and the completion handle (`Response`)
//! - The `Transport` seam between the cluster layer and connection pools

mod address;
mod error;
mod message;
mod response;
mod transport;

pub use address::{DEFAULT_PROTOCOL, ServiceAddress, keys, service_key};
pub use error::{BusinessError, FramingError, FrameworkError, StratoError, TransportError};
pub use message::{
    DEFAULT_SERIALIZATION, Options, Reply, Request, TRACE_ID, next_request_id,
};
pub use response::Response;
pub use transport::Transport;
