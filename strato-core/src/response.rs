//! Future-like completion handle for in-flight calls.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::watch;

use crate::error::{StratoError, TransportError};
use crate::message::Reply;

type Callback = Box<dyn FnOnce(&Reply) + Send + 'static>;

enum State {
    Pending(Vec<Callback>),
    Done(Arc<Reply>),
}

struct Inner {
    request_id: u64,
    started: Instant,
    state: Mutex<State>,
    done: watch::Sender<bool>,
}

/// Completion handle for one in-flight request.
///
/// The first `complete` wins; later ones are ignored. Every callback attached with
/// `on_complete` fires exactly once: on the completing thread if attached before
/// completion, on the attaching thread otherwise.
///
/// ## Example
///
/// ```rust
/// use strato_core::{Reply, Response};
///
/// let response = Response::new(1);
/// response.on_complete(|reply| assert!(reply.is_ok()));
///
/// assert!(response.complete(Reply::ok(1, 1, b"done".to_vec())));
/// assert!(!response.complete(Reply::ok(1, 1, b"again".to_vec())));
/// ```
#[derive(Clone)]
pub struct Response {
    inner: Arc<Inner>,
}

impl Response {
    /// Create a pending response for a request id.
    #[must_use]
    pub fn new(request_id: u64) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                request_id,
                started: Instant::now(),
                state: Mutex::new(State::Pending(Vec::new())),
                done,
            }),
        }
    }

    /// Id of the request this completes.
    #[must_use]
    pub fn request_id(&self) -> u64 {
        self.inner.request_id
    }

    /// Time since the response was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.inner.started.elapsed()
    }

    /// Check if the response has completed.
    #[must_use]
    pub fn is_done(&self) -> bool {
        matches!(*self.inner.state.lock(), State::Done(_))
    }

    /// The reply, once completed.
    #[must_use]
    pub fn reply(&self) -> Option<Arc<Reply>> {
        match &*self.inner.state.lock() {
            State::Done(reply) => Some(reply.clone()),
            State::Pending(_) => None,
        }
    }

    /// Complete with a reply. Returns `false` if already completed.
    ///
    /// A reply without an elapsed time gets the time since creation.
    pub fn complete(&self, mut reply: Reply) -> bool {
        if reply.elapsed.is_zero() {
            reply.elapsed = self.elapsed();
        }
        let reply = Arc::new(reply);

        let callbacks = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                State::Done(_) => return false,
                State::Pending(callbacks) => {
                    let callbacks = std::mem::take(callbacks);
                    *state = State::Done(reply.clone());
                    callbacks
                }
            }
        };

        self.inner.done.send_replace(true);
        for callback in callbacks {
            run_callback(self.inner.request_id, callback, &reply);
        }
        true
    }

    /// Complete with an error. Returns `false` if already completed.
    pub fn fail(&self, error: impl Into<StratoError>) -> bool {
        self.complete(Reply::failed(self.inner.request_id, error))
    }

    /// Attach a callback that fires exactly once with the reply.
    pub fn on_complete<F>(&self, callback: F)
    where
        F: FnOnce(&Reply) + Send + 'static,
    {
        let reply = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                State::Pending(callbacks) => {
                    callbacks.push(Box::new(callback));
                    return;
                }
                State::Done(reply) => reply.clone(),
            }
        };
        run_callback(self.inner.request_id, Box::new(callback), &reply);
    }

    /// Attach a callback that runs on the given runtime's blocking pool.
    pub fn on_complete_in<F>(&self, executor: &Handle, callback: F)
    where
        F: FnOnce(Reply) + Send + 'static,
    {
        let executor = executor.clone();
        self.on_complete(move |reply| {
            let reply = reply.clone();
            executor.spawn_blocking(move || callback(reply));
        });
    }

    /// Wait for completion.
    pub async fn wait(&self) -> Arc<Reply> {
        let mut done = self.inner.done.subscribe();
        loop {
            if let Some(reply) = self.reply() {
                return reply;
            }
            if done.changed().await.is_err() {
                return Arc::new(Reply::failed(
                    self.inner.request_id,
                    TransportError::Cancelled,
                ));
            }
        }
    }

    /// Wait for completion, giving up after `timeout`.
    pub async fn wait_timeout(&self, timeout: Duration) -> Result<Arc<Reply>, TransportError> {
        tokio::time::timeout(timeout, self.wait())
            .await
            .map_err(|_| TransportError::Timeout(timeout))
    }
}

/// A panicking callback must not unwind into the thread that completed the response.
fn run_callback(request_id: u64, callback: Callback, reply: &Reply) {
    if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| callback(reply))) {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        tracing::error!(request_id, panic = %message, "Completion callback panicked");
    }
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("request_id", &self.inner.request_id)
            .field("done", &self.is_done())
            .finish()
    }
}
