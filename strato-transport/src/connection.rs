//! A single multiplexed TCP connection to a provider.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use ntex_bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use strato_codec::{Message, WireCodec, body};
use strato_core::{Reply, Request, Response, StratoError, TransportError};

use crate::config::ChannelConfig;
use crate::io::{FrameReader, WRITE_QUEUE, encode_frame, write_loop};
use crate::mux::Multiplexer;

/// One physical connection.
///
/// A reader task decodes frames and completes pending responses through the
/// multiplexer; a writer task drains the outbound queue. Either task failing
/// marks the connection inactive and fails every pending call.
pub struct Connection {
    peer: String,
    codec: WireCodec,
    queue: mpsc::Sender<Bytes>,
    mux: Arc<Multiplexer>,
    active: Arc<AtomicBool>,
    tasks: [JoinHandle<()>; 2],
}

impl Connection {
    /// Connect to `authority` (`host:port`).
    pub async fn connect(authority: &str, config: &ChannelConfig) -> Result<Self, TransportError> {
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(authority))
            .await
            .map_err(|_| {
                TransportError::ConnectionFailed(format!(
                    "{authority}: connect timed out after {:?}",
                    config.connect_timeout
                ))
            })?
            .map_err(|e| TransportError::ConnectionFailed(format!("{authority}: {e}")))?;

        if config.nodelay {
            stream.set_nodelay(true)?;
        }

        Ok(Self::from_stream(
            stream,
            authority.to_owned(),
            WireCodec::with_config(config.codec.clone()),
        ))
    }

    /// Wrap an established stream and start its reader and writer tasks.
    pub fn from_stream(stream: TcpStream, peer: String, codec: WireCodec) -> Self {
        let (read_half, write_half) = stream.into_split();
        let (queue, rx) = mpsc::channel(WRITE_QUEUE);
        let mux = Arc::new(Multiplexer::new());
        let active = Arc::new(AtomicBool::new(true));

        let writer = tokio::spawn({
            let mux = mux.clone();
            let active = active.clone();
            let peer = peer.clone();
            async move {
                if let Err(e) = write_loop(write_half, rx).await {
                    tracing::warn!(peer = %peer, error = %e, "Connection write failed");
                }
                active.store(false, Ordering::Release);
                mux.close();
            }
        });

        let reader = tokio::spawn({
            let mux = mux.clone();
            let active = active.clone();
            let peer = peer.clone();
            let reader = FrameReader::new(read_half, codec.clone());
            async move {
                match read_loop(reader, &mux).await {
                    Ok(()) => tracing::debug!(peer = %peer, "Connection closed by peer"),
                    Err(e) => tracing::warn!(peer = %peer, error = %e, "Connection read failed"),
                }
                active.store(false, Ordering::Release);
                mux.close();
            }
        });

        tracing::debug!(peer = %peer, "Connection established");

        Self {
            peer,
            codec,
            queue,
            mux,
            active,
            tasks: [writer, reader],
        }
    }

    /// Remote `host:port`.
    #[must_use]
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Check if the connection is still usable.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire) && !self.queue.is_closed()
    }

    /// Number of calls awaiting a reply.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.mux.in_flight()
    }

    /// Write a request and return its pending response.
    ///
    /// The request gets a connection-scoped id; the caller's id is replaced.
    pub async fn send(&self, mut request: Request) -> Result<Response, StratoError> {
        if !self.is_active() {
            return Err(TransportError::ConnectionClosed.into());
        }

        let (id, response) = self.mux.register();
        request.request_id = id;
        request.sent_at = Some(SystemTime::now());

        let bytes = match body::encode_request(&request, self.codec.encode_version())
            .and_then(|frame| encode_frame(&self.codec, frame))
        {
            Ok(bytes) => bytes,
            Err(e) => {
                self.mux.forget(id);
                return Err(e.into());
            }
        };

        self.enqueue(id, bytes).await?;
        Ok(response)
    }

    /// Write a request and fail its response with a timeout if no reply arrives in time.
    pub async fn send_with_timeout(
        &self,
        request: Request,
        timeout: Duration,
    ) -> Result<Response, StratoError> {
        let response = self.send(request).await?;

        let id = response.request_id();
        let mux = Arc::downgrade(&self.mux);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(mux) = mux.upgrade() {
                mux.fail(id, TransportError::Timeout(timeout));
            }
        });

        Ok(response)
    }

    /// Send a request and wait for the reply.
    ///
    /// Transport failures are returned as `Err`; provider errors arrive in the reply.
    pub async fn call(&self, request: Request, timeout: Duration) -> Result<Reply, StratoError> {
        let response = self.send(request).await?;

        match response.wait_timeout(timeout).await {
            Ok(reply) => {
                let reply = Arc::try_unwrap(reply).unwrap_or_else(|shared| (*shared).clone());
                match reply.outcome {
                    Err(StratoError::Transport(e)) => Err(e.into()),
                    _ => Ok(reply),
                }
            }
            Err(e) => {
                self.mux.forget(response.request_id());
                Err(e.into())
            }
        }
    }

    /// Send a heartbeat and wait for its echo.
    pub async fn heartbeat(&self, timeout: Duration) -> Result<(), TransportError> {
        if !self.is_active() {
            return Err(TransportError::ConnectionClosed);
        }

        let (id, response) = self.mux.register();
        let frame = body::encode_heartbeat(id, self.codec.encode_version());
        let bytes = encode_frame(&self.codec, frame).map_err(|e| {
            self.mux.forget(id);
            TransportError::ConnectionFailed(e.to_string())
        })?;
        self.enqueue(id, bytes).await?;

        match response.wait_timeout(timeout).await {
            Ok(reply) => match reply.error() {
                None => Ok(()),
                Some(StratoError::Transport(e)) => Err(e.clone()),
                Some(other) => Err(TransportError::ConnectionFailed(other.to_string())),
            },
            Err(e) => {
                self.mux.forget(id);
                Err(e)
            }
        }
    }

    /// Mark inactive, fail pending calls, and stop both tasks.
    pub fn close(&self) {
        self.active.store(false, Ordering::Release);
        self.mux.close();
        for task in &self.tasks {
            task.abort();
        }
    }

    async fn enqueue(&self, id: u64, bytes: Bytes) -> Result<(), TransportError> {
        if self.queue.send(bytes).await.is_err() {
            self.mux.forget(id);
            self.active.store(false, Ordering::Release);
            return Err(TransportError::ConnectionClosed);
        }
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("active", &self.is_active())
            .field("pending", &self.pending())
            .finish()
    }
}

async fn read_loop(mut reader: FrameReader, mux: &Multiplexer) -> Result<(), StratoError> {
    while let Some(frame) = reader.next().await? {
        match body::decode(&frame)? {
            Message::Reply(reply) => {
                mux.deliver(reply);
            }
            Message::Heartbeat(id) => {
                mux.deliver(Reply::ok(id, frame.serialization, Vec::new()));
            }
            Message::Request(request) => {
                tracing::warn!(
                    request_id = request.request_id,
                    "Ignoring request frame on a client connection"
                );
            }
        }
    }
    Ok(())
}
