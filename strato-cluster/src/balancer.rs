//! Sender selection over an atomically replaced snapshot.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;

use strato_core::{FrameworkError, Request};

use crate::sender::Sender;

/// Immutable list of candidate senders.
pub type Snapshot = Arc<Vec<Arc<Sender>>>;

/// Selects live senders for a call.
///
/// `refresh` swaps in a whole new candidate list; readers see either the old
/// or the new list, never a mix. Selection filters to active senders and fails
/// with `FrameworkError::NoProviderAvailable` instead of returning nothing.
pub trait LoadBalancer: Send + Sync {
    /// Policy name as registered in `Extensions`.
    fn name(&self) -> &'static str;

    /// Replace the candidate list.
    fn refresh(&self, senders: Vec<Arc<Sender>>);

    /// Current candidate list, active or not.
    fn snapshot(&self) -> Snapshot;

    /// Pick one active sender for the request.
    fn select_one(&self, request: &Request) -> Result<Arc<Sender>, FrameworkError>;

    /// Every active sender, in snapshot order.
    fn select_all(&self, request: &Request) -> Result<Vec<Arc<Sender>>, FrameworkError> {
        let active: Vec<Arc<Sender>> = self
            .snapshot()
            .iter()
            .filter(|s| s.is_active())
            .cloned()
            .collect();
        if active.is_empty() {
            return Err(FrameworkError::NoProviderAvailable(request.service_key()));
        }
        Ok(active)
    }

    /// Drop every candidate.
    fn destroy(&self) {
        self.refresh(Vec::new());
    }
}

/// Shared snapshot holder used by the built-in policies.
#[derive(Default)]
struct Candidates {
    senders: RwLock<Snapshot>,
}

impl Candidates {
    fn load(&self) -> Snapshot {
        self.senders.read().clone()
    }

    fn store(&self, senders: Vec<Arc<Sender>>) {
        *self.senders.write() = Arc::new(senders);
    }
}

/// Spread request ids uniformly; deterministic for a given id.
fn mix(request_id: u64) -> u64 {
    let mut z = request_id.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

fn pick(active: &[Arc<Sender>], request_id: u64) -> Arc<Sender> {
    let index = (mix(request_id) % active.len() as u64) as usize;
    active[index].clone()
}

/// Picks a pseudo-random sender derived from the request id.
///
/// The same snapshot and request always select the same sender.
#[derive(Default)]
pub struct RandomBalancer {
    candidates: Candidates,
}

impl RandomBalancer {
    /// Create an empty balancer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RandomBalancer {
    fn name(&self) -> &'static str {
        "random"
    }

    fn refresh(&self, senders: Vec<Arc<Sender>>) {
        self.candidates.store(senders);
    }

    fn snapshot(&self) -> Snapshot {
        self.candidates.load()
    }

    fn select_one(&self, request: &Request) -> Result<Arc<Sender>, FrameworkError> {
        let active = self.select_all(request)?;
        Ok(pick(&active, request.request_id))
    }
}

/// Cycles through active senders.
#[derive(Default)]
pub struct RoundRobinBalancer {
    candidates: Candidates,
    next: AtomicUsize,
}

impl RoundRobinBalancer {
    /// Create an empty balancer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RoundRobinBalancer {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn refresh(&self, senders: Vec<Arc<Sender>>) {
        self.candidates.store(senders);
    }

    fn snapshot(&self) -> Snapshot {
        self.candidates.load()
    }

    fn select_one(&self, request: &Request) -> Result<Arc<Sender>, FrameworkError> {
        let active = self.select_all(request)?;
        let index = (self.next.fetch_add(1, Ordering::Relaxed) & (usize::MAX >> 1)) % active.len();
        Ok(active[index].clone())
    }
}

/// Prefers the sender with the fewest calls in flight.
///
/// Ties are broken by request id.
#[derive(Default)]
pub struct LeastActiveBalancer {
    candidates: Candidates,
}

impl LeastActiveBalancer {
    /// Create an empty balancer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for LeastActiveBalancer {
    fn name(&self) -> &'static str {
        "least_active"
    }

    fn refresh(&self, senders: Vec<Arc<Sender>>) {
        self.candidates.store(senders);
    }

    fn snapshot(&self) -> Snapshot {
        self.candidates.load()
    }

    fn select_one(&self, request: &Request) -> Result<Arc<Sender>, FrameworkError> {
        let active = self.select_all(request)?;
        let least = active.iter().map(|s| s.pending()).min().unwrap_or(0);
        let idle: Vec<Arc<Sender>> = active
            .into_iter()
            .filter(|s| s.pending() == least)
            .collect();
        if idle.is_empty() {
            return Err(FrameworkError::NoProviderAvailable(request.service_key()));
        }
        Ok(pick(&idle, request.request_id))
    }
}
