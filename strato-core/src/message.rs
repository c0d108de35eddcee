//! Request and reply records.
//!
//! A `Request` names the interface, method and parameter signature of one call and
//! carries its arguments already encoded by the serializer identified by
//! `serialization`. A `Reply` carries exactly one of the encoded result or the
//! captured error.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use crate::address::{keys, service_key};
use crate::error::StratoError;

/// Global request ID counter for unique IDs.
static REQUEST_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Generate a unique request ID.
#[must_use]
pub fn next_request_id() -> u64 {
    REQUEST_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Serializer id used when neither the call nor the address picks one (json).
pub const DEFAULT_SERIALIZATION: u8 = 1;

/// Option key carrying the trace id in request and reply options.
pub const TRACE_ID: &str = "trace-id";

/// String key-value options attached to requests and replies.
pub type Options = BTreeMap<String, String>;

/// One logical call.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Correlation id; channels assign a fresh one per send.
    pub request_id: u64,
    /// Target interface name.
    pub interface: String,
    /// Target interface version, empty when unversioned.
    pub version: String,
    /// Target method name.
    pub method: String,
    /// Encoded parameter-type signature.
    pub signature: String,
    /// Serializer id of `args`.
    pub serialization: u8,
    /// Encoded argument tuple.
    pub args: Vec<u8>,
    /// Per-call options (timeout, retries, trace id, ...).
    pub options: Options,
    /// Zero-based attempt counter maintained by failover.
    pub attempt: u32,
    /// When the consumer wrote the request.
    pub sent_at: Option<SystemTime>,
    /// When the provider decoded the request.
    pub received_at: Option<SystemTime>,
}

impl Request {
    /// Create a request with a fresh id and no arguments.
    #[must_use]
    pub fn new(interface: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            request_id: next_request_id(),
            interface: interface.into(),
            version: String::new(),
            method: method.into(),
            signature: String::new(),
            serialization: DEFAULT_SERIALIZATION,
            args: Vec::new(),
            options: Options::new(),
            attempt: 0,
            sent_at: None,
            received_at: None,
        }
    }

    /// Set the interface version.
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Set the parameter signature.
    #[must_use]
    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = signature.into();
        self
    }

    /// Set the encoded arguments and their serializer id.
    #[must_use]
    pub fn with_args(mut self, serialization: u8, args: Vec<u8>) -> Self {
        self.serialization = serialization;
        self.args = args;
        self
    }

    /// Add a per-call option.
    #[must_use]
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Routing key of the target service.
    #[must_use]
    pub fn service_key(&self) -> String {
        service_key(&self.interface, &self.version)
    }

    /// Per-call timeout override.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.options
            .get(keys::TIMEOUT)
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
    }

    /// Per-call retry budget override.
    #[must_use]
    pub fn retries(&self) -> Option<u32> {
        self.options.get(keys::RETRIES).and_then(|v| v.parse().ok())
    }
}

/// Outcome of one call.
#[derive(Debug, Clone)]
pub struct Reply {
    /// Id of the request this answers.
    pub request_id: u64,
    /// Serializer id of the result bytes.
    pub serialization: u8,
    /// Encoded result or the captured error.
    pub outcome: Result<Vec<u8>, StratoError>,
    /// Reply options and trace entries.
    pub options: Options,
    /// Time spent producing the reply.
    pub elapsed: Duration,
}

impl Reply {
    /// Successful reply.
    #[must_use]
    pub fn ok(request_id: u64, serialization: u8, result: Vec<u8>) -> Self {
        Self {
            request_id,
            serialization,
            outcome: Ok(result),
            options: Options::new(),
            elapsed: Duration::ZERO,
        }
    }

    /// Reply carrying an error.
    #[must_use]
    pub fn failed(request_id: u64, error: impl Into<StratoError>) -> Self {
        Self {
            request_id,
            serialization: DEFAULT_SERIALIZATION,
            outcome: Err(error.into()),
            options: Options::new(),
            elapsed: Duration::ZERO,
        }
    }

    /// Add a reply option.
    #[must_use]
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Check whether the call succeeded.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    /// The captured error, if any.
    #[must_use]
    pub fn error(&self) -> Option<&StratoError> {
        self.outcome.as_ref().err()
    }

    /// Split into the outcome, turning a captured error into `Err`.
    pub fn into_result(self) -> Result<Vec<u8>, StratoError> {
        self.outcome
    }
}
