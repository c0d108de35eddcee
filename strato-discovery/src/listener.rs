//! Keeps a load balancer in sync with registry notifications.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;

use strato_cluster::{LoadBalancer, Sender};
use strato_core::{ServiceAddress, StratoError};

use crate::registry::NotifyListener;

/// Creates senders for newly advertised providers.
pub trait SenderFactory: Send + Sync {
    /// Build an active sender for a provider address.
    fn create(&self, address: &ServiceAddress) -> Result<Arc<Sender>, StratoError>;
}

/// Live providers contributed by one registry.
type LiveSet = BTreeMap<ServiceAddress, Arc<Sender>>;

#[derive(Default)]
struct ListenerState {
    registries: HashMap<String, LiveSet>,
    closed: bool,
}

impl ListenerState {
    fn find(&self, address: &ServiceAddress) -> Option<Arc<Sender>> {
        self.registries
            .values()
            .find_map(|set| set.get(address))
            .cloned()
    }

    fn contains(&self, address: &ServiceAddress) -> bool {
        self.registries.values().any(|set| set.contains_key(address))
    }

    /// Union of every registry's set, one sender per address.
    fn flatten(&self) -> Vec<Arc<Sender>> {
        let mut all: BTreeMap<&ServiceAddress, &Arc<Sender>> = BTreeMap::new();
        for set in self.registries.values() {
            all.extend(set.iter());
        }
        all.into_values().cloned().collect()
    }
}

/// Bridges registry pushes for one interface to its load balancer.
///
/// Each notification carries the complete provider list of one registry. The
/// listener keeps a live set per registry so that an empty list from one
/// registry only drops what that registry contributed. Senders are reused by
/// address across notifications and registries; a sender is destroyed once no
/// registry advertises its address any more.
///
/// Notifications are handled one at a time, even when registries call in
/// concurrently.
pub struct DiscoveryListener {
    interface: String,
    form: String,
    balancer: Arc<dyn LoadBalancer>,
    factory: Arc<dyn SenderFactory>,
    state: Mutex<ListenerState>,
}

impl DiscoveryListener {
    /// Create a listener feeding `balancer`.
    ///
    /// Only providers whose form equals `form` are used.
    pub fn new(
        interface: impl Into<String>,
        form: impl Into<String>,
        balancer: Arc<dyn LoadBalancer>,
        factory: Arc<dyn SenderFactory>,
    ) -> Self {
        Self {
            interface: interface.into(),
            form: form.into(),
            balancer,
            factory,
            state: Mutex::new(ListenerState::default()),
        }
    }

    /// Interface this listener tracks.
    #[must_use]
    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Form providers must belong to.
    #[must_use]
    pub fn form(&self) -> &str {
        &self.form
    }

    /// Addresses currently live across every registry, sorted.
    #[must_use]
    pub fn providers(&self) -> Vec<ServiceAddress> {
        self.state
            .lock()
            .flatten()
            .iter()
            .map(|s| s.address().clone())
            .collect()
    }

    /// Registries that currently contribute at least one provider.
    #[must_use]
    pub fn registries(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .state
            .lock()
            .registries
            .iter()
            .filter(|(_, set)| !set.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort_unstable();
        names
    }

    /// Apply one registry's complete provider list.
    pub fn update(&self, registry: &str, providers: Vec<ServiceAddress>) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }

        let mut next = LiveSet::new();
        for address in providers {
            if address.form() != self.form || address.interface() != self.interface {
                continue;
            }
            if next.contains_key(&address) {
                continue;
            }
            let sender = match state.find(&address) {
                Some(sender) => sender,
                None => match self.factory.create(&address) {
                    Ok(sender) => {
                        tracing::info!(
                            interface = %self.interface,
                            registry,
                            %address,
                            "Provider added"
                        );
                        sender
                    }
                    Err(e) => {
                        tracing::warn!(
                            interface = %self.interface,
                            registry,
                            %address,
                            error = %e,
                            "Failed to create sender"
                        );
                        continue;
                    }
                },
            };
            next.insert(address, sender);
        }

        let previous = if next.is_empty() {
            state.registries.remove(registry)
        } else {
            state.registries.insert(registry.to_owned(), next)
        };

        let dropped: Vec<Arc<Sender>> = previous
            .into_iter()
            .flatten()
            .filter(|(address, _)| !state.contains(address))
            .map(|(_, sender)| sender)
            .collect();

        let live = state.flatten();
        let count = live.len();
        self.balancer.refresh(live);

        for sender in dropped {
            tracing::info!(
                interface = %self.interface,
                registry,
                address = %sender.address(),
                "Provider removed"
            );
            sender.destroy();
        }

        tracing::debug!(
            interface = %self.interface,
            registry,
            providers = count,
            "Provider list refreshed"
        );
    }

    /// Destroy every sender and stop accepting notifications.
    pub fn destroy(&self) {
        let senders = {
            let mut state = self.state.lock();
            state.closed = true;
            let senders = state.flatten();
            state.registries.clear();
            senders
        };
        self.balancer.refresh(Vec::new());
        for sender in senders {
            sender.destroy();
        }
    }
}

impl NotifyListener for DiscoveryListener {
    fn on_notify(&self, registry: &str, interface: &str, providers: Vec<ServiceAddress>) {
        if interface != self.interface {
            tracing::debug!(
                expected = %self.interface,
                interface,
                "Ignoring notification for another interface"
            );
            return;
        }
        self.update(registry, providers);
    }
}

impl std::fmt::Debug for DiscoveryListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryListener")
            .field("interface", &self.interface)
            .field("form", &self.form)
            .field("providers", &self.providers().len())
            .finish()
    }
}
