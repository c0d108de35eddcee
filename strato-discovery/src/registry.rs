//! Registry contract and the in-process registry.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;

use strato_core::{FrameworkError, ServiceAddress, StratoError};

/// Error type for registry operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    /// Deregistering an address that was never registered.
    #[error("address not registered: {0}")]
    NotRegistered(String),

    /// Unsubscribing a listener that was never subscribed.
    #[error("listener not subscribed to {0}")]
    NotSubscribed(String),

    /// The backing registry could not be reached.
    #[error("registry unavailable: {0}")]
    Unavailable(String),
}

impl From<RegistryError> for StratoError {
    fn from(e: RegistryError) -> Self {
        FrameworkError::Registry(e.to_string()).into()
    }
}

/// Receives provider lists pushed by a registry.
pub trait NotifyListener: Send + Sync {
    /// Called with the complete current provider list of one service.
    ///
    /// An empty list means the registry advertises no provider at all.
    fn on_notify(&self, registry: &str, interface: &str, providers: Vec<ServiceAddress>);
}

/// A backing service registry.
///
/// Subscriptions are keyed by service key (`interface` or `interface:version`).
/// A subscriber is notified once with the current snapshot as soon as it
/// subscribes, then again on every change.
pub trait Registry: Send + Sync {
    /// Identity of this registry, passed to every notification.
    fn endpoint(&self) -> &str;

    /// Advertise a provider address.
    fn register(&self, address: &ServiceAddress) -> Result<(), RegistryError>;

    /// Withdraw a provider address.
    fn deregister(&self, address: &ServiceAddress) -> Result<(), RegistryError>;

    /// Subscribe to the providers of a service.
    fn subscribe(
        &self,
        service_key: &str,
        listener: Arc<dyn NotifyListener>,
    ) -> Result<(), RegistryError>;

    /// Remove a subscription made with `subscribe`.
    fn unsubscribe(
        &self,
        service_key: &str,
        listener: &Arc<dyn NotifyListener>,
    ) -> Result<(), RegistryError>;
}

#[derive(Default)]
struct LocalState {
    providers: HashMap<String, BTreeSet<ServiceAddress>>,
    listeners: HashMap<String, Vec<Arc<dyn NotifyListener>>>,
}

impl LocalState {
    fn snapshot(&self, service_key: &str) -> Vec<ServiceAddress> {
        self.providers
            .get(service_key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn listeners(&self, service_key: &str) -> Vec<Arc<dyn NotifyListener>> {
        self.listeners.get(service_key).cloned().unwrap_or_default()
    }
}

/// In-process registry.
///
/// Listeners are called on the thread making the change, after the state lock
/// is released. Notifications are serialized, so every listener sees changes
/// in order. A listener must not call back into the same registry.
///
/// ## Example
///
/// ```rust
/// use strato_core::ServiceAddress;
/// use strato_discovery::{LocalRegistry, Registry};
///
/// let registry = LocalRegistry::new("local://test");
/// let address = ServiceAddress::new("127.0.0.1", 9000, "com.acme.Greeter");
/// registry.register(&address).unwrap();
///
/// assert_eq!(registry.providers("com.acme.Greeter"), vec![address]);
/// ```
pub struct LocalRegistry {
    endpoint: String,
    state: Mutex<LocalState>,
    notify: Mutex<()>,
}

impl LocalRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            state: Mutex::new(LocalState::default()),
            notify: Mutex::new(()),
        }
    }

    /// Providers currently advertised for a service key, sorted.
    #[must_use]
    pub fn providers(&self, service_key: &str) -> Vec<ServiceAddress> {
        self.state.lock().snapshot(service_key)
    }

    /// Number of listeners subscribed to a service key.
    #[must_use]
    pub fn subscribers(&self, service_key: &str) -> usize {
        self.state
            .lock()
            .listeners
            .get(service_key)
            .map_or(0, Vec::len)
    }

    fn publish(&self, service_key: &str, interface: &str) {
        let _order = self.notify.lock();
        let (providers, listeners) = {
            let state = self.state.lock();
            (state.snapshot(service_key), state.listeners(service_key))
        };
        for listener in listeners {
            listener.on_notify(&self.endpoint, interface, providers.clone());
        }
    }
}

impl Registry for LocalRegistry {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn register(&self, address: &ServiceAddress) -> Result<(), RegistryError> {
        let key = address.service_key();
        let added = self
            .state
            .lock()
            .providers
            .entry(key.clone())
            .or_default()
            .insert(address.clone());

        if added {
            tracing::debug!(registry = %self.endpoint, %address, "Provider registered");
            self.publish(&key, address.interface());
        }
        Ok(())
    }

    fn deregister(&self, address: &ServiceAddress) -> Result<(), RegistryError> {
        let key = address.service_key();
        let removed = {
            let mut state = self.state.lock();
            let removed = state
                .providers
                .get_mut(&key)
                .is_some_and(|set| set.remove(address));
            if state.providers.get(&key).is_some_and(BTreeSet::is_empty) {
                state.providers.remove(&key);
            }
            removed
        };

        if !removed {
            return Err(RegistryError::NotRegistered(address.to_string()));
        }
        tracing::debug!(registry = %self.endpoint, %address, "Provider deregistered");
        self.publish(&key, address.interface());
        Ok(())
    }

    fn subscribe(
        &self,
        service_key: &str,
        listener: Arc<dyn NotifyListener>,
    ) -> Result<(), RegistryError> {
        let _order = self.notify.lock();
        let providers = {
            let mut state = self.state.lock();
            state
                .listeners
                .entry(service_key.to_owned())
                .or_default()
                .push(listener.clone());
            state.snapshot(service_key)
        };

        let interface = service_key.split(':').next().unwrap_or(service_key);
        listener.on_notify(&self.endpoint, interface, providers);
        Ok(())
    }

    fn unsubscribe(
        &self,
        service_key: &str,
        listener: &Arc<dyn NotifyListener>,
    ) -> Result<(), RegistryError> {
        let mut state = self.state.lock();
        let Some(listeners) = state.listeners.get_mut(service_key) else {
            return Err(RegistryError::NotSubscribed(service_key.to_owned()));
        };
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        if listeners.len() == before {
            return Err(RegistryError::NotSubscribed(service_key.to_owned()));
        }
        if listeners.is_empty() {
            state.listeners.remove(service_key);
        }
        Ok(())
    }
}

impl std::fmt::Debug for LocalRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("LocalRegistry")
            .field("endpoint", &self.endpoint)
            .field("services", &state.providers.len())
            .field("subscriptions", &state.listeners.len())
            .finish()
    }
}
