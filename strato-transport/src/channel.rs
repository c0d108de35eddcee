//! Fixed-size connection pool to one provider address.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use strato_core::{Reply, Request, Response, ServiceAddress, StratoError, Transport, TransportError};

use crate::config::ChannelConfig;
use crate::connection::Connection;

struct Slot {
    conn: RwLock<Option<Arc<Connection>>>,
    rebuild: tokio::sync::Mutex<()>,
}

impl Slot {
    fn new() -> Self {
        Self {
            conn: RwLock::new(None),
            rebuild: tokio::sync::Mutex::new(()),
        }
    }

    fn active(&self) -> Option<Arc<Connection>> {
        self.conn.read().as_ref().filter(|c| c.is_active()).cloned()
    }

    fn replace(&self, conn: Option<Arc<Connection>>) {
        let old = std::mem::replace(&mut *self.conn.write(), conn);
        if let Some(old) = old {
            old.close();
        }
    }
}

struct ChannelInner {
    address: ServiceAddress,
    authority: String,
    config: ChannelConfig,
    slots: Vec<Slot>,
    next: AtomicUsize,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ChannelInner {
    fn new(address: ServiceAddress, config: ChannelConfig) -> Arc<Self> {
        let size = address.connections().unwrap_or(config.connections).max(1);
        Arc::new(Self {
            authority: address.authority(),
            address,
            slots: (0..size).map(|_| Slot::new()).collect(),
            next: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            config,
        })
    }

    async fn rebuild(&self, slot: &Slot) -> Result<Arc<Connection>, TransportError> {
        let _guard = slot.rebuild.lock().await;

        // another caller may have rebuilt it while we waited
        if let Some(conn) = slot.active() {
            return Ok(conn);
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::ConnectionClosed);
        }

        let conn = Arc::new(Connection::connect(&self.authority, &self.config).await?);
        slot.replace(Some(conn.clone()));

        // close() may have run while connecting; it sets the flag before clearing slots.
        if self.closed.load(Ordering::Acquire) {
            slot.replace(None);
            return Err(TransportError::ConnectionClosed);
        }
        Ok(conn)
    }

    async fn select(&self) -> Result<Arc<Connection>, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::ConnectionClosed);
        }

        let n = self.slots.len();
        let start = self.next.fetch_add(1, Ordering::Relaxed) & (usize::MAX >> 1);

        for offset in 0..n {
            let slot = &self.slots[(start + offset) % n];
            if let Some(conn) = slot.active() {
                return Ok(conn);
            }
            match self.rebuild(slot).await {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    tracing::debug!(address = %self.address, error = %e, "Connection rebuild failed");
                }
            }
        }

        Err(TransportError::NoChannelAvailable(self.address.to_string()))
    }

    async fn connect_all(&self) {
        for slot in &self.slots {
            if let Err(e) = self.rebuild(slot).await {
                tracing::warn!(address = %self.address, error = %e, "Initial connect failed");
            }
        }
    }

    async fn probe(&self) {
        for slot in &self.slots {
            let Some(conn) = slot.active() else {
                continue;
            };
            if let Err(e) = conn.heartbeat(self.config.heartbeat_timeout).await {
                tracing::warn!(
                    address = %self.address,
                    peer = conn.peer(),
                    error = %e,
                    "Health probe failed, marking connection inactive"
                );
                conn.close();
            }
        }
    }
}

/// Pool of connections to one provider address.
///
/// Connections are selected round-robin. An inactive connection is rebuilt on
/// selection; if no slot can be rebuilt the call fails with
/// `TransportError::NoChannelAvailable`. A background task probes every
/// connection with heartbeats and closes those that fail.
///
/// Cloning is cheap and shares the pool.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    /// Create the pool and its health task.
    ///
    /// Connects every slot before returning unless `lazy_connect` is set, in which
    /// case connecting happens in the background. Slots that fail to connect stay
    /// empty and are retried on selection.
    pub async fn open(address: ServiceAddress, config: ChannelConfig) -> Self {
        let inner = ChannelInner::new(address, config);
        if inner.config.lazy_connect {
            spawn_connect(&inner, &Handle::current());
        } else {
            inner.connect_all().await;
        }
        Self::start(inner, &Handle::current())
    }

    /// Create the pool without waiting, connecting on the given runtime.
    ///
    /// Used from synchronous callbacks (discovery notifications) that may run
    /// outside any runtime. Slots connect in the background regardless of
    /// `lazy_connect`.
    #[must_use]
    pub fn open_in(address: ServiceAddress, config: ChannelConfig, runtime: &Handle) -> Self {
        let inner = ChannelInner::new(address, config);
        spawn_connect(&inner, runtime);
        Self::start(inner, runtime)
    }

    fn start(inner: Arc<ChannelInner>, runtime: &Handle) -> Self {
        let health = runtime.spawn(health_loop(
            Arc::downgrade(&inner),
            inner.config.heartbeat_interval,
        ));
        inner.tasks.lock().push(health);

        tracing::debug!(
            address = %inner.address,
            connections = inner.slots.len(),
            "Channel opened"
        );

        Self { inner }
    }

    /// Provider address this pool serves.
    #[must_use]
    pub fn address(&self) -> &ServiceAddress {
        &self.inner.address
    }

    /// Pool configuration.
    #[must_use]
    pub fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }

    /// Number of connection slots.
    #[must_use]
    pub fn size(&self) -> usize {
        self.inner.slots.len()
    }

    /// Number of currently active connections.
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.inner
            .slots
            .iter()
            .filter(|s| s.active().is_some())
            .count()
    }

    /// Check if the pool has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Send a request and return its pending response.
    ///
    /// The response fails with `TransportError::Timeout` if no reply arrives in time.
    pub async fn send(&self, request: Request, timeout: Duration) -> Result<Response, StratoError> {
        let conn = self.inner.select().await?;
        conn.send_with_timeout(request, timeout).await
    }

    /// Send a request and wait for the reply.
    pub async fn call(&self, request: Request, timeout: Duration) -> Result<Reply, StratoError> {
        let conn = self.inner.select().await?;
        conn.call(request, timeout).await
    }

    /// Probe every active connection once.
    pub async fn check_health(&self) {
        self.inner.probe().await;
    }

    /// Close every connection and stop background tasks.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        for slot in &self.inner.slots {
            slot.replace(None);
        }
        tracing::debug!(address = %self.inner.address, "Channel closed");
    }
}

impl Transport for Channel {
    fn call(&self, request: Request, timeout: Duration) -> BoxFuture<'_, Result<Reply, StratoError>> {
        Box::pin(Channel::call(self, request, timeout))
    }

    fn is_connected(&self) -> bool {
        !self.is_closed() && self.active_connections() > 0
    }

    fn close(&self) {
        Channel::close(self);
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("address", &self.inner.address)
            .field("size", &self.size())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn spawn_connect(inner: &Arc<ChannelInner>, runtime: &Handle) {
    let weak = Arc::downgrade(inner);
    let task = runtime.spawn(async move {
        if let Some(inner) = weak.upgrade() {
            inner.connect_all().await;
        }
    });
    inner.tasks.lock().push(task);
}

async fn health_loop(inner: Weak<ChannelInner>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if inner.closed.load(Ordering::Acquire) {
            return;
        }
        inner.probe().await;
    }
}
