//! Method registry for one exposed service.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Serialize, de::DeserializeOwned};

use strato_codec::{Serialization, signature_of};
use strato_core::{FrameworkError, Request, StratoError, service_key};

/// Type-erased method invoker.
///
/// Takes the decoded request and returns the result encoded with the
/// request's serializer.
pub type Handler =
    Arc<dyn Fn(Request) -> BoxFuture<'static, Result<Vec<u8>, StratoError>> + Send + Sync>;

/// The methods of one service, keyed by name and parameter signature.
///
/// ## Example
///
/// ```rust
/// use strato_core::StratoError;
/// use strato_transport::ServiceRoutes;
///
/// let routes = ServiceRoutes::new("com.acme.Greeter")
///     .with_version("1.0")
///     .method("greet", |name: String| async move {
///         Ok::<_, StratoError>(format!("hello, {name}"))
///     });
///
/// assert_eq!(routes.service_key(), "com.acme.Greeter:1.0");
/// assert_eq!(routes.len(), 1);
/// ```
#[derive(Clone)]
pub struct ServiceRoutes {
    interface: String,
    version: String,
    methods: HashMap<String, Vec<(String, Handler)>>,
}

impl ServiceRoutes {
    /// Create an empty registry for an interface.
    #[must_use]
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            version: String::new(),
            methods: HashMap::new(),
        }
    }

    /// Set the interface version.
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Register a raw handler under an explicit signature.
    ///
    /// A later registration with the same method and signature replaces the earlier one.
    #[must_use]
    pub fn handler<F, Fut>(mut self, method: impl Into<String>, signature: impl Into<String>, f: F) -> Self
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<u8>, StratoError>> + Send + 'static,
    {
        let signature = signature.into();
        let handler: Handler = Arc::new(move |request| Box::pin(f(request)));

        let overloads = self.methods.entry(method.into()).or_default();
        overloads.retain(|(sig, _)| *sig != signature);
        overloads.push((signature, handler));
        self
    }

    /// Register a typed method.
    ///
    /// `A` is the argument tuple (or single argument); its type name is the signature.
    /// Arguments and result travel through the serializer the caller picked.
    #[must_use]
    pub fn method<A, R, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, StratoError>> + Send + 'static,
    {
        let f = Arc::new(f);
        self.handler(name, signature_of::<A>(), move |request: Request| {
            let f = f.clone();
            async move {
                let ser = Serialization::from_id(request.serialization)?;
                let args: A = ser.decode(&request.args)?;
                let result = f(args).await?;
                Ok::<_, StratoError>(ser.encode(&result)?)
            }
        })
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

    /// Number of registered (method, signature) pairs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.methods.values().map(Vec::len).sum()
    }

    /// Check if no method is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Find the handler for a method and signature.
    ///
    /// An exact signature match wins; otherwise a method with a single overload is
    /// used regardless of signature.
    pub fn resolve(&self, method: &str, signature: &str) -> Result<&Handler, FrameworkError> {
        let overloads = self.methods.get(method).ok_or_else(|| {
            FrameworkError::MethodNotFound(format!("{}.{method}", self.service_key()))
        })?;

        if let Some((_, handler)) = overloads.iter().find(|(sig, _)| sig == signature) {
            return Ok(handler);
        }

        match overloads.as_slice() {
            [(_, handler)] => Ok(handler),
            _ => Err(FrameworkError::MethodNotFound(format!(
                "{}.{method}({signature})",
                self.service_key()
            ))),
        }
    }

    /// Invoke the handler for a request.
    pub async fn invoke(&self, request: Request) -> Result<Vec<u8>, StratoError> {
        let handler = self.resolve(&request.method, &request.signature)?.clone();
        handler(request).await
    }
}

impl std::fmt::Debug for ServiceRoutes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRoutes")
            .field("service", &self.service_key())
            .field("methods", &self.methods.keys())
            .finish()
    }
}
