//! Error types for the Strato RPC runtime.
//!
//! Failures fall into four families that drive retry and propagation:
//! framing (malformed or oversized frames), transport (refused, reset, timed out),
//! business (raised by the provider's method) and framework (invariant or
//! configuration violations).

use std::sync::Arc;
use std::time::Duration;

/// Main error type for Strato operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StratoError {
    /// Malformed frame or payload.
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    /// Connection-level failure.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Application error raised by the provider method.
    #[error("business error: {0}")]
    Business(#[from] BusinessError),

    /// Invariant or configuration violation.
    #[error("framework error: {0}")]
    Framework(#[from] FrameworkError),
}

/// Errors raised while encoding or decoding frames and bodies.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FramingError {
    /// Leading two bytes match no known header layout.
    #[error("unknown frame magic: {0:#06x}")]
    BadMagic(u16),

    /// Payload exceeds the configured maximum.
    #[error("frame too large: {size} bytes (max: {max})")]
    FrameTooLarge {
        /// Declared payload size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    /// Kind nibble outside REQUEST/RESPONSE/OTHER.
    #[error("invalid frame kind: {0}")]
    InvalidKind(u8),

    /// Varint ran past the widest encoding of its integer type.
    #[error("malformed varint: no terminator within {0} bytes")]
    MalformedVarint(usize),

    /// Body ended before a field was complete.
    #[error("unexpected end of buffer: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEof {
        /// Bytes the read required
        needed: usize,
        /// Bytes left in the buffer
        remaining: usize,
    },

    /// Serializer id is not registered.
    #[error("unknown serialization id: {0}")]
    UnknownSerialization(u8),

    /// Header cannot represent the value (e.g. request id in a legacy frame).
    #[error("header overflow: {0}")]
    HeaderOverflow(String),

    /// Value serialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Value deserialization failed.
    #[error("deserialization error: {0}")]
    Deserialization(String),
}

/// Transport-level errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// IO error from the underlying socket
    #[error("io error: {0}")]
    Io(Arc<std::io::Error>),

    /// Connection was closed unexpectedly
    #[error("connection closed")]
    ConnectionClosed,

    /// Failed to connect to the remote endpoint
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Every connection of a pool is inactive and could not be rebuilt
    #[error("no channel available for {0}")]
    NoChannelAvailable(String),

    /// No reply arrived in time
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// The pending call was cancelled locally
    #[error("request cancelled")]
    Cancelled,
}

/// Application-level error returned by a provider method.
///
/// Never retried; propagates unchanged through every fault-tolerance strategy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("[{code}] {message}")]
pub struct BusinessError {
    /// Error code for programmatic handling
    pub code: u32,
    /// Human-readable error message
    pub message: String,
}

/// Framework invariant and configuration violations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FrameworkError {
    /// The balancer has no active sender.
    #[error("no provider available for {0}")]
    NoProviderAvailable(String),

    /// The invoker cluster is not active.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// The same protocol, address and service were exposed twice.
    #[error("service already exposed: {0}")]
    DuplicateExpose(String),

    /// Failover used its whole budget.
    #[error("{attempts} attempts exhausted, last target {target}: {cause}")]
    RetriesExhausted {
        /// Sender tried on the final attempt
        target: String,
        /// Number of attempts made
        attempts: u32,
        /// Final transport failure
        cause: TransportError,
    },

    /// A transport failure surfaced through the cluster.
    #[error("invocation of {interface} failed: {cause}")]
    Invocation {
        /// Interface name of the failed call
        interface: String,
        /// Underlying failure
        cause: Box<StratoError>,
    },

    /// No route for the requested service.
    #[error("service not found: {0}")]
    ServiceNotFound(String),

    /// No invoker for the requested method and signature.
    #[error("method not found: {0}")]
    MethodNotFound(String),

    /// Address string could not be parsed.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// No extension registered under the name.
    #[error("unknown {kind}: {name}")]
    UnknownExtension {
        /// Extension family (balancer, strategy)
        kind: &'static str,
        /// Requested name
        name: String,
    },

    /// The backing registry rejected or failed an operation.
    #[error("registry error: {0}")]
    Registry(String),

    /// Error text reported by a remote provider.
    #[error("remote error: {0}")]
    Remote(String),
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

impl From<std::io::Error> for StratoError {
    fn from(e: std::io::Error) -> Self {
        Self::Transport(e.into())
    }
}

impl BusinessError {
    /// Create a business error with code and message.
    #[must_use]
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl StratoError {
    /// Create a business error with code and message.
    #[must_use]
    pub fn business(code: u32, message: impl Into<String>) -> Self {
        Self::Business(BusinessError::new(code, message))
    }

    /// Check if this is an application error from the provider.
    #[must_use]
    pub fn is_business(&self) -> bool {
        matches!(self, Self::Business(_))
    }

    /// Check if this error may succeed on another attempt.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Check if this error indicates the connection should be closed.
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Framing(_)
                | Self::Transport(TransportError::ConnectionClosed)
                | Self::Transport(TransportError::Io(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StratoError::business(404, "user not found");
        assert_eq!(err.to_string(), "business error: [404] user not found");

        let err: StratoError = FramingError::FrameTooLarge { size: 200, max: 100 }.into();
        assert_eq!(
            err.to_string(),
            "framing error: frame too large: 200 bytes (max: 100)"
        );
    }

    #[test]
    fn test_retryable() {
        assert!(StratoError::from(TransportError::Timeout(Duration::from_secs(1))).is_retryable());
        assert!(StratoError::from(TransportError::ConnectionClosed).is_retryable());
        assert!(!StratoError::business(1, "nope").is_retryable());
        assert!(!StratoError::from(FramingError::BadMagic(0)).is_retryable());
        assert!(
            !StratoError::from(FrameworkError::NoProviderAvailable("svc".into())).is_retryable()
        );
    }

    #[test]
    fn test_exhausted_names_target() {
        let err = FrameworkError::RetriesExhausted {
            target: "strato://10.0.0.1:9000/Echo".into(),
            attempts: 3,
            cause: TransportError::ConnectionClosed,
        };
        assert!(err.to_string().contains("strato://10.0.0.1:9000/Echo"));
        assert!(err.to_string().starts_with("3 attempts exhausted"));
    }
}
