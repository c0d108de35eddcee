//! Server side: listening sockets that route inbound requests to services.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use async_lock::Semaphore;
use futures::FutureExt;
use ntex_bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use strato_codec::{Frame, FrameVersion, Message, WireCodec, body};
use strato_core::{
    FrameworkError, Reply, Request, ServiceAddress, StratoError, TRACE_ID, TransportError,
};

use crate::config::ExposerConfig;
use crate::io::{FrameReader, WRITE_QUEUE, encode_frame, write_loop};
use crate::router::ServiceRoutes;

type RouteTable = RwLock<HashMap<String, Arc<ServiceRoutes>>>;

/// One listening address shared by every service exposed on it.
///
/// Inbound requests are routed by service key (interface plus version). Handler
/// failures and panics become error replies; only framing or transport failures
/// close a connection.
pub struct Exposer {
    local_addr: SocketAddr,
    routes: Arc<RouteTable>,
    shutdown: watch::Sender<bool>,
    accept: Mutex<Option<JoinHandle<()>>>,
}

impl Exposer {
    /// Bind `authority` (`host:port`) and start accepting connections.
    pub async fn bind(authority: &str, config: ExposerConfig) -> Result<Arc<Self>, TransportError> {
        let listener = TcpListener::bind(authority)
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("bind {authority}: {e}")))?;
        let local_addr = listener.local_addr()?;

        let routes: Arc<RouteTable> = Arc::default();
        let (shutdown, _) = watch::channel(false);

        let accept = tokio::spawn(accept_loop(
            listener,
            routes.clone(),
            Arc::new(config),
            shutdown.subscribe(),
        ));

        tracing::info!(address = %local_addr, "Exposer listening");

        Ok(Arc::new(Self {
            local_addr,
            routes,
            shutdown,
            accept: Mutex::new(Some(accept)),
        }))
    }

    /// Bound socket address.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Add a service. Fails if its key is already routed here.
    pub fn add(&self, routes: ServiceRoutes) -> Result<(), FrameworkError> {
        let key = routes.service_key();
        let mut table = self.routes.write();
        if table.contains_key(&key) {
            return Err(FrameworkError::DuplicateExpose(format!("{key} at {}", self.local_addr)));
        }
        tracing::info!(address = %self.local_addr, service = %key, methods = routes.len(), "Service exposed");
        table.insert(key, Arc::new(routes));
        Ok(())
    }

    /// Remove a service. Returns `false` if it was not routed here.
    pub fn remove(&self, service_key: &str) -> bool {
        let removed = self.routes.write().remove(service_key).is_some();
        if removed {
            tracing::info!(address = %self.local_addr, service = %service_key, "Service hidden");
        }
        removed
    }

    /// Keys of the routed services.
    #[must_use]
    pub fn services(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.routes.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Check if no service is routed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.read().is_empty()
    }

    /// Check if the socket has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Stop accepting, close every connection, and drop all routes.
    pub fn close(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        if let Some(accept) = self.accept.lock().take() {
            accept.abort();
        }
        self.routes.write().clear();
        tracing::info!(address = %self.local_addr, "Exposer closed");
    }

    /// Close and wait until the listening socket is released.
    pub async fn shutdown(&self) {
        let accept = self.accept.lock().take();
        self.close();
        if let Some(accept) = accept {
            accept.abort();
            let _ = accept.await;
        }
    }
}

impl Drop for Exposer {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Exposer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exposer")
            .field("local_addr", &self.local_addr)
            .field("services", &self.services())
            .finish()
    }
}

/// Every exposer of a process, keyed by protocol and listen address.
///
/// ## Example
///
/// ```rust,no_run
/// use strato_core::{ServiceAddress, StratoError};
/// use strato_transport::{ExposerConfig, ExposerSet, ServiceRoutes};
///
/// # async fn run() -> Result<(), StratoError> {
/// let set = ExposerSet::new(ExposerConfig::default());
/// let address = ServiceAddress::new("127.0.0.1", 9000, "com.acme.Echo");
///
/// let routes = ServiceRoutes::new("com.acme.Echo")
///     .method("echo", |s: String| async move { Ok::<_, StratoError>(s) });
/// set.expose(&address, routes).await?;
///
/// set.hide(&address).await;
/// # Ok(())
/// # }
/// ```
pub struct ExposerSet {
    config: ExposerConfig,
    exposers: tokio::sync::Mutex<HashMap<String, Arc<Exposer>>>,
}

impl ExposerSet {
    /// Create an empty set.
    #[must_use]
    pub fn new(config: ExposerConfig) -> Self {
        Self {
            config,
            exposers: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    fn key(address: &ServiceAddress) -> String {
        format!("{}://{}", address.protocol(), address.authority())
    }

    /// Expose a service at an address, binding the address on first use.
    ///
    /// Exposing the same protocol, address and service twice without hiding it
    /// first fails with `FrameworkError::DuplicateExpose`. Returns the bound
    /// socket address.
    pub async fn expose(
        &self,
        address: &ServiceAddress,
        routes: ServiceRoutes,
    ) -> Result<SocketAddr, StratoError> {
        let key = Self::key(address);
        let mut exposers = self.exposers.lock().await;

        let exposer = match exposers.get(&key) {
            Some(exposer) if !exposer.is_closed() => exposer.clone(),
            _ => {
                let exposer = Exposer::bind(&address.authority(), self.config.clone()).await?;
                exposers.insert(key, exposer.clone());
                exposer
            }
        };

        exposer.add(routes).map_err(|e| match e {
            FrameworkError::DuplicateExpose(_) => {
                FrameworkError::DuplicateExpose(address.to_string())
            }
            other => other,
        })?;
        Ok(exposer.local_addr())
    }

    /// Hide a service; closes the socket once nothing is exposed on it.
    ///
    /// Returns `false` if the service was not exposed at that address.
    pub async fn hide(&self, address: &ServiceAddress) -> bool {
        let key = Self::key(address);
        let mut exposers = self.exposers.lock().await;

        let Some(exposer) = exposers.get(&key).cloned() else {
            return false;
        };
        let removed = exposer.remove(&address.service_key());
        if exposer.is_empty() {
            exposers.remove(&key);
            exposer.shutdown().await;
        }
        removed
    }

    /// Exposer bound for an address, if any.
    pub async fn get(&self, address: &ServiceAddress) -> Option<Arc<Exposer>> {
        self.exposers.lock().await.get(&Self::key(address)).cloned()
    }

    /// Close every exposer.
    pub async fn destroy(&self) {
        let mut exposers = self.exposers.lock().await;
        for (_, exposer) in exposers.drain() {
            exposer.shutdown().await;
        }
    }
}

impl std::fmt::Debug for ExposerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExposerSet").finish_non_exhaustive()
    }
}

async fn accept_loop(
    listener: TcpListener,
    routes: Arc<RouteTable>,
    config: Arc<ExposerConfig>,
    shutdown: watch::Receiver<bool>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                if config.nodelay {
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                    }
                }
                tokio::spawn(serve_connection(
                    stream,
                    peer,
                    routes.clone(),
                    config.clone(),
                    shutdown.clone(),
                ));
            }
            Err(e) => {
                tracing::warn!(error = %e, "Accept failed");
            }
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    routes: Arc<RouteTable>,
    config: Arc<ExposerConfig>,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::debug!(peer = %peer, "Connection accepted");

    let codec = WireCodec::with_config(config.codec.clone());
    let (read_half, write_half) = stream.into_split();
    let (queue, rx) = mpsc::channel::<Bytes>(WRITE_QUEUE);
    let writer = tokio::spawn(write_loop(write_half, rx));
    let limit = Arc::new(Semaphore::new(config.max_in_flight_per_connection.max(1)));
    let mut reader = FrameReader::new(read_half, codec.clone());

    loop {
        let next = tokio::select! {
            _ = shutdown.changed() => break,
            next = reader.next() => next,
        };

        let frame = match next {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                tracing::debug!(peer = %peer, "Connection closed by peer");
                break;
            }
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "Closing connection after read failure");
                break;
            }
        };

        let message = match body::decode(&frame) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "Closing connection after malformed body");
                break;
            }
        };

        match message {
            Message::Heartbeat(id) => {
                let echo = body::encode_heartbeat(id, frame.version);
                if !enqueue(&codec, &queue, echo).await {
                    break;
                }
            }
            Message::Request(request) => {
                let permit = limit.acquire_arc().await;
                let routes = routes.clone();
                let codec = codec.clone();
                let queue = queue.clone();
                let version = frame.version;
                tokio::spawn(async move {
                    let reply = handle_request(&routes, request).await;
                    let frame = encode_reply_or_error(&reply, version);
                    enqueue(&codec, &queue, frame).await;
                    drop(permit);
                });
            }
            Message::Reply(reply) => {
                tracing::debug!(peer = %peer, request_id = reply.request_id, "Ignoring reply frame");
            }
        }
    }

    drop(queue);
    if *shutdown.borrow() {
        writer.abort();
    }
}

async fn enqueue(codec: &WireCodec, queue: &mpsc::Sender<Bytes>, frame: Frame) -> bool {
    match encode_frame(codec, frame) {
        Ok(bytes) => queue.send(bytes).await.is_ok(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode outbound frame");
            true
        }
    }
}

fn encode_reply_or_error(reply: &Reply, version: FrameVersion) -> Frame {
    match body::encode_reply(reply, version) {
        Ok(frame) => frame,
        Err(e) => {
            let fallback = Reply::failed(reply.request_id, e);
            match body::encode_reply(&fallback, version) {
                Ok(frame) => frame,
                // an error reply only fails to frame when the id overflows the layout
                Err(_) => body::encode_heartbeat(reply.request_id, version),
            }
        }
    }
}

async fn handle_request(routes: &RouteTable, request: Request) -> Reply {
    let started = Instant::now();
    let request_id = request.request_id;
    let serialization = request.serialization;
    let trace_id = request.options.get(TRACE_ID).cloned();
    let key = request.service_key();

    let target = routes.read().get(&key).cloned();
    let outcome = match target {
        None => Err(FrameworkError::ServiceNotFound(key.clone()).into()),
        Some(service) => {
            let method = request.method.clone();
            match AssertUnwindSafe(service.invoke(request)).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(panic) => {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| (*s).to_owned())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "handler panicked".to_owned());
                    tracing::error!(service = %key, method = %method, panic = %message, "Handler panicked");
                    Err(StratoError::Framework(FrameworkError::Remote(format!(
                        "{key}.{method} panicked: {message}"
                    ))))
                }
            }
        }
    };

    if let Err(e) = &outcome {
        if !e.is_business() {
            tracing::debug!(service = %key, request_id, error = %e, "Request failed");
        }
    }

    let mut reply = Reply {
        request_id,
        serialization,
        outcome,
        options: Default::default(),
        elapsed: started.elapsed(),
    };
    if let Some(trace_id) = trace_id {
        reply.options.insert(TRACE_ID.to_owned(), trace_id);
    }
    reply
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use strato_codec::{Serialization, signature_of};
    use strato_core::BusinessError;

    use crate::channel::Channel;
    use crate::config::ChannelConfig;

    fn echo_routes() -> ServiceRoutes {
        ServiceRoutes::new("Echo")
            .method("echo", |s: String| async move { Ok::<_, StratoError>(s) })
            .method("fail", |(): ()| async move {
                Err::<(), StratoError>(BusinessError::new(42, "nope").into())
            })
            .method("panic", |(): ()| async move {
                if true {
                    panic!("kaboom");
                }
                Ok::<(), StratoError>(())
            })
    }

    fn echo_request(text: &str) -> Request {
        Request::new("Echo", "echo")
            .with_signature(signature_of::<String>())
            .with_args(1, Serialization::Json.encode(text).unwrap())
    }

    async fn channel_to(addr: SocketAddr, interface: &str) -> Channel {
        Channel::open(
            ServiceAddress::new("127.0.0.1", addr.port(), interface),
            ChannelConfig::default().connections(1),
        )
        .await
    }

    #[tokio::test]
    async fn test_routes_requests_and_errors() {
        let exposer = Exposer::bind("127.0.0.1:0", ExposerConfig::default())
            .await
            .unwrap();
        exposer.add(echo_routes()).unwrap();
        let channel = channel_to(exposer.local_addr(), "Echo").await;
        let timeout = Duration::from_secs(2);

        let reply = channel
            .call(echo_request("hi").with_option(TRACE_ID, "t-9"), timeout)
            .await
            .unwrap();
        assert_eq!(
            Serialization::Json.decode::<String>(&reply.outcome.clone().unwrap()).unwrap(),
            "hi"
        );
        assert_eq!(reply.options.get(TRACE_ID).map(String::as_str), Some("t-9"));

        let reply = channel
            .call(Request::new("Echo", "fail").with_args(1, b"null".to_vec()), timeout)
            .await
            .unwrap();
        assert!(matches!(reply.error(), Some(StratoError::Business(e)) if e.code == 42));

        // a panicking handler answers with an error and keeps the connection
        let reply = channel
            .call(Request::new("Echo", "panic").with_args(1, b"null".to_vec()), timeout)
            .await
            .unwrap();
        assert!(matches!(
            reply.error(),
            Some(StratoError::Framework(FrameworkError::Remote(m))) if m.contains("kaboom")
        ));

        let reply = channel
            .call(Request::new("Missing", "echo"), timeout)
            .await
            .unwrap();
        assert!(matches!(
            reply.error(),
            Some(StratoError::Framework(FrameworkError::Remote(m))) if m.contains("service not found")
        ));

        assert!(channel.call(echo_request("still here"), timeout).await.unwrap().is_ok());
        assert_eq!(channel.active_connections(), 1);
    }

    #[tokio::test]
    async fn test_heartbeat_echo() {
        let exposer = Exposer::bind("127.0.0.1:0", ExposerConfig::default())
            .await
            .unwrap();
        exposer.add(echo_routes()).unwrap();
        let channel = channel_to(exposer.local_addr(), "Echo").await;

        channel.check_health().await;
        assert_eq!(channel.active_connections(), 1);
    }

    #[tokio::test]
    async fn test_several_services_share_a_port() {
        let exposer = Exposer::bind("127.0.0.1:0", ExposerConfig::default())
            .await
            .unwrap();
        exposer.add(echo_routes()).unwrap();
        exposer
            .add(
                ServiceRoutes::new("Echo")
                    .with_version("2")
                    .method("echo", |s: String| async move {
                        Ok::<_, StratoError>(s.to_uppercase())
                    }),
            )
            .unwrap();
        assert_eq!(exposer.services(), vec!["Echo", "Echo:2"]);

        let channel = channel_to(exposer.local_addr(), "Echo").await;
        let reply = channel
            .call(echo_request("abc").with_version("2"), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(reply.outcome.unwrap(), b"\"ABC\"".to_vec());
    }

    #[tokio::test]
    async fn test_framing_error_closes_connection() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let exposer = Exposer::bind("127.0.0.1:0", ExposerConfig::default())
            .await
            .unwrap();
        exposer.add(echo_routes()).unwrap();

        let mut stream = TcpStream::connect(exposer.local_addr()).await.unwrap();
        stream.write_all(&[0x12, 0x34, 0, 0, 0]).await.unwrap();

        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_expose_duplicate_and_hide() {
        let set = ExposerSet::new(ExposerConfig::default());
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let address = ServiceAddress::new("127.0.0.1", port, "Echo");
        let bound = set.expose(&address, echo_routes()).await.unwrap();
        assert_eq!(bound.port(), port);

        let duplicate = set.expose(&address, echo_routes()).await;
        assert!(matches!(
            duplicate,
            Err(StratoError::Framework(FrameworkError::DuplicateExpose(_)))
        ));

        let v2 = address.with_version("2");
        set.expose(&v2, echo_routes().with_version("2")).await.unwrap();

        assert!(set.hide(&address).await);
        let exposer = set.get(&address).await.unwrap();
        assert!(!exposer.is_closed());

        assert!(set.hide(&v2).await);
        assert!(exposer.is_closed());
        assert!(set.get(&address).await.is_none());
        assert!(!set.hide(&address).await);

        // the address can be exposed again once hidden
        set.expose(&address, echo_routes()).await.unwrap();
        set.destroy().await;
    }
}
