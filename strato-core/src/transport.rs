//! Transport trait definitions.
//!
//! The `Transport` trait abstracts over whatever carries a request to one provider
//! address. The connection pool implements it; the cluster layer only sees this
//! trait, which keeps balancers and strategies testable without sockets.

use std::time::Duration;

use futures::future::BoxFuture;

use crate::error::StratoError;
use crate::message::{Reply, Request};

/// Core transport trait for RPC communication.
///
/// ```rust
/// use std::time::Duration;
/// use futures::future::BoxFuture;
/// use strato_core::{Reply, Request, StratoError, Transport};
///
/// struct Loopback;
///
/// impl Transport for Loopback {
///     fn call(&self, request: Request, _timeout: Duration) -> BoxFuture<'_, Result<Reply, StratoError>> {
///         Box::pin(async move { Ok(Reply::ok(request.request_id, request.serialization, request.args)) })
///     }
///
///     fn is_connected(&self) -> bool {
///         true
///     }
///
///     fn close(&self) {}
/// }
/// ```
pub trait Transport: Send + Sync {
    /// Send a request and wait for its correlated reply or the timeout.
    ///
    /// `Err` means the call never produced a reply (transport or framing failure);
    /// errors raised by the provider arrive inside the returned `Reply`.
    fn call(&self, request: Request, timeout: Duration)
    -> BoxFuture<'_, Result<Reply, StratoError>>;

    /// Check if the transport is connected and healthy.
    fn is_connected(&self) -> bool;

    /// Close the transport and release its connections.
    fn close(&self);
}
