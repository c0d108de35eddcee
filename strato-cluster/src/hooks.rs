//! Shutdown hooks for lifecycle-scoped resources.

use std::sync::Weak;

use parking_lot::Mutex;

/// Something torn down at shutdown.
pub trait Destroyable: Send + Sync {
    /// Release resources. Must be idempotent.
    fn destroy(&self);
}

/// Hooks run once when the owning context shuts down.
///
/// Holds weak references, so registering does not keep a resource alive.
#[derive(Default)]
pub struct ShutdownHooks {
    hooks: Mutex<Vec<Weak<dyn Destroyable>>>,
}

impl ShutdownHooks {
    /// Create an empty hook list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a resource.
    pub fn register(&self, hook: Weak<dyn Destroyable>) {
        let mut hooks = self.hooks.lock();
        hooks.retain(|h| h.strong_count() > 0);
        hooks.push(hook);
    }

    /// Number of registered resources still alive.
    #[must_use]
    pub fn len(&self) -> usize {
        self.hooks.lock().iter().filter(|h| h.strong_count() > 0).count()
    }

    /// Check if no live resource is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Destroy every live resource, in registration order, and clear the list.
    pub fn run(&self) {
        let hooks = std::mem::take(&mut *self.hooks.lock());
        for hook in hooks {
            if let Some(resource) = hook.upgrade() {
                resource.destroy();
            }
        }
    }
}

impl std::fmt::Debug for ShutdownHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownHooks")
            .field("live", &self.len())
            .finish()
    }
}
