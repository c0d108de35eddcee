//! In-flight call table for one connection.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;

use strato_core::{Reply, Response, StratoError, TransportError};

/// Correlates connection-scoped request ids with the `Response`s waiting on them.
///
/// Once closed, every waiting call is failed with `ConnectionClosed` and later
/// registrations come back already failed.
///
/// ```rust
/// use strato_core::Reply;
/// use strato_transport::Multiplexer;
///
/// let mux = Multiplexer::new();
/// let (id, response) = mux.register();
///
/// assert!(mux.deliver(Reply::ok(id, 1, b"null".to_vec())));
/// assert!(response.is_done());
/// assert_eq!(mux.in_flight(), 0);
/// ```
pub struct Multiplexer {
    waiting: DashMap<u64, Response>,
    ids: AtomicU64,
    closed: AtomicBool,
}

impl Multiplexer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            waiting: DashMap::new(),
            ids: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Allocate an id and the response it will complete.
    pub fn register(&self) -> (u64, Response) {
        let id = self.ids.fetch_add(1, Ordering::Relaxed);
        let response = Response::new(id);

        if self.closed.load(Ordering::Acquire) {
            response.fail(TransportError::ConnectionClosed);
            return (id, response);
        }

        self.waiting.insert(id, response.clone());

        // close() may have drained the table between the check and the insert.
        if self.closed.load(Ordering::Acquire) {
            self.fail(id, TransportError::ConnectionClosed);
        }

        (id, response)
    }

    /// Drop a waiting call without completing it.
    pub fn forget(&self, request_id: u64) -> Option<Response> {
        self.waiting.remove(&request_id).map(|(_, response)| response)
    }

    /// Complete the call a reply belongs to.
    ///
    /// Returns `false` for replies nobody waits for anymore, e.g. after a timeout.
    pub fn deliver(&self, reply: Reply) -> bool {
        match self.waiting.remove(&reply.request_id) {
            Some((_, response)) => response.complete(reply),
            None => {
                tracing::debug!(request_id = reply.request_id, "Dropping late reply");
                false
            }
        }
    }

    /// Fail one waiting call.
    pub fn fail(&self, request_id: u64, error: impl Into<StratoError>) -> bool {
        self.waiting
            .remove(&request_id)
            .is_some_and(|(_, response)| response.fail(error))
    }

    /// Fail every waiting call and refuse new ones.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);

        let ids: Vec<u64> = self.waiting.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            self.fail(id, TransportError::ConnectionClosed);
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of calls awaiting a reply.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.waiting.len()
    }
}

impl Default for Multiplexer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport_error(response: &Response) -> Option<TransportError> {
        match response.reply()?.error() {
            Some(StratoError::Transport(e)) => Some(e.clone()),
            _ => None,
        }
    }

    #[test]
    fn test_reply_completes_waiting_call() {
        let mux = Multiplexer::new();
        let (id, response) = mux.register();
        assert_eq!(mux.in_flight(), 1);

        assert!(mux.deliver(Reply::ok(id, 1, b"42".to_vec())));
        assert_eq!(mux.in_flight(), 0);

        let reply = response.reply().unwrap();
        assert_eq!(reply.outcome.as_deref().unwrap(), b"42");
    }

    #[test]
    fn test_reply_for_unknown_id_is_dropped() {
        let mux = Multiplexer::new();
        assert!(!mux.deliver(Reply::ok(999, 1, Vec::new())));
    }

    #[test]
    fn test_timed_out_call_ignores_late_reply() {
        let mux = Multiplexer::new();
        let (id, response) = mux.register();

        assert!(mux.fail(id, TransportError::Timeout(std::time::Duration::from_millis(5))));
        assert!(!mux.deliver(Reply::ok(id, 1, Vec::new())));
        assert!(matches!(transport_error(&response), Some(TransportError::Timeout(_))));
    }

    #[test]
    fn test_close_fails_everything_waiting() {
        let mux = Multiplexer::new();
        let responses: Vec<_> = (0..3).map(|_| mux.register().1).collect();

        mux.close();

        assert_eq!(mux.in_flight(), 0);
        assert!(mux.is_closed());
        for response in &responses {
            assert!(matches!(
                transport_error(response),
                Some(TransportError::ConnectionClosed)
            ));
        }
    }

    #[test]
    fn test_register_after_close_fails_at_once() {
        let mux = Multiplexer::new();
        mux.close();

        let (_, response) = mux.register();
        assert!(response.is_done());
        assert_eq!(mux.in_flight(), 0);
        assert!(matches!(
            transport_error(&response),
            Some(TransportError::ConnectionClosed)
        ));
    }

    #[test]
    fn test_forget_leaves_response_pending() {
        let mux = Multiplexer::new();
        let (id, response) = mux.register();

        assert!(mux.forget(id).is_some());
        assert!(!response.is_done());
        assert!(mux.forget(id).is_none());
    }

    #[test]
    fn test_ids_increase() {
        let mux = Multiplexer::new();
        let first = mux.register().0;
        let second = mux.register().0;
        assert!(second > first);
    }
}
