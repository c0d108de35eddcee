//! Client-side handle bound to one provider address.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use strato_core::{Reply, Request, ServiceAddress, StratoError, Transport, TransportError};

/// Binds one provider address to the transport that reaches it.
///
/// The unit a load balancer selects. `destroy` clears the active flag before
/// the transport is closed, so a concurrent selection either sees the sender
/// as inactive or gets a transport that still works.
pub struct Sender {
    address: ServiceAddress,
    transport: Arc<dyn Transport>,
    default_timeout: Duration,
    active: AtomicBool,
    pending: AtomicUsize,
}

struct PendingGuard<'a>(&'a AtomicUsize);

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Sender {
    /// Create an active sender.
    pub fn new(
        address: ServiceAddress,
        transport: Arc<dyn Transport>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            address,
            transport,
            default_timeout,
            active: AtomicBool::new(true),
            pending: AtomicUsize::new(0),
        }
    }

    /// Provider address.
    #[must_use]
    pub fn address(&self) -> &ServiceAddress {
        &self.address
    }

    /// Check if the sender may be selected.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Calls currently in flight through this sender.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Timeout for a request: the request's `timeout` option, then the address's,
    /// then the default.
    #[must_use]
    pub fn timeout_for(&self, request: &Request) -> Duration {
        request
            .timeout()
            .or_else(|| self.address.timeout())
            .unwrap_or(self.default_timeout)
    }

    /// Send a request and wait for the reply.
    ///
    /// Errors raised by the provider are returned as `Err` along with transport
    /// failures.
    pub async fn invoke(&self, request: Request) -> Result<Reply, StratoError> {
        if !self.is_active() {
            return Err(TransportError::ConnectionClosed.into());
        }

        let timeout = self.timeout_for(&request);
        self.pending.fetch_add(1, Ordering::AcqRel);
        let _guard = PendingGuard(&self.pending);

        let reply = self.transport.call(request, timeout).await?;
        match reply.outcome {
            Err(e) => Err(e),
            Ok(_) => Ok(reply),
        }
    }

    /// Deactivate and close the transport. Later calls fail as closed.
    pub fn destroy(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            self.transport.close();
            tracing::debug!(address = %self.address, "Sender destroyed");
        }
    }
}

impl std::fmt::Debug for Sender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sender")
            .field("address", &self.address)
            .field("active", &self.is_active())
            .field("pending", &self.pending())
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use strato_core::{BusinessError, keys};

    #[tokio::test]
    async fn test_invoke_returns_reply() {
        let (sender, transport) = sender(1, vec![Step::Ok(b"1")]);
        let reply = sender.invoke(Request::new("Echo", "echo")).await.unwrap();
        assert_eq!(reply.outcome.unwrap(), b"1".to_vec());
        assert_eq!(transport.calls(), 1);
        assert_eq!(sender.pending(), 0);
    }

    #[tokio::test]
    async fn test_provider_errors_become_err() {
        let (sender, _) = sender(
            1,
            vec![Step::Fail(BusinessError::new(3, "bad").into())],
        );
        let result = sender.invoke(Request::new("Echo", "echo")).await;
        assert!(matches!(result, Err(StratoError::Business(_))));
    }

    #[tokio::test]
    async fn test_timeout_precedence() {
        let transport = ScriptedTransport::new(vec![]);
        let sender = Sender::new(
            address(1).with_option(keys::TIMEOUT, "500"),
            transport.clone(),
            Duration::from_secs(3),
        );

        sender.invoke(Request::new("Echo", "a")).await.unwrap();
        sender
            .invoke(Request::new("Echo", "b").with_option(keys::TIMEOUT, "50"))
            .await
            .unwrap();

        let plain = Sender::new(address(2), transport.clone(), Duration::from_secs(3));
        plain.invoke(Request::new("Echo", "c")).await.unwrap();

        assert_eq!(
            *transport.timeouts.lock(),
            vec![
                Duration::from_millis(500),
                Duration::from_millis(50),
                Duration::from_secs(3)
            ]
        );
    }

    #[tokio::test]
    async fn test_destroy_deactivates_before_close() {
        let (sender, transport) = sender(1, vec![]);
        sender.destroy();
        assert!(!sender.is_active());
        assert!(transport.closed.load(Ordering::SeqCst));

        let result = sender.invoke(Request::new("Echo", "echo")).await;
        assert!(matches!(
            result,
            Err(StratoError::Transport(TransportError::ConnectionClosed))
        ));
        assert_eq!(transport.calls(), 0);
    }
}
