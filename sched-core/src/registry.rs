//! Plugin registry: a process-wide, weak-valued id-to-object table used
//! to route messages across a worker/main-process boundary (spec §4.G).
//!
//! Grounded on `original_source/buildstream/plugin.py`'s
//! `_plugin_register`/`_plugin_lookup`/`_plugin_unregister` counter+table
//! shape, with the redesign fix from spec §9: the original's
//! `_plugin_unregister` passes `str(unique_id)` as the key while
//! `_plugin_register` stored an `int`, which is a latent bug (the
//! unregister never actually removes anything). This registry keys
//! strictly on `u64`, never a string form, so that bug class can't
//! recur; a lookup miss is a [`SchedError::PluginLookupMiss`], not an
//! `undefined e` panic.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::{Result, SchedError};

/// An id returned by [`PluginRegistry::register`]. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PluginId(u64);

impl PluginId {
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for PluginId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process-wide weak-valued id→object table. Registering does not
/// extend an object's lifetime past whatever else holds a strong
/// reference to it; once every strong `Arc` is dropped, `lookup` starts
/// returning `None` and the caller must tolerate that (spec §9).
pub struct PluginRegistry {
    next_id: AtomicU64,
    table: Mutex<HashMap<u64, Weak<dyn Any + Send + Sync>>>,
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            table: Mutex::new(HashMap::new()),
        }
    }

    /// Register `plugin` and return its id. The counter is bumped
    /// first, so ids are never reused even across registry churn.
    pub fn register(&self, plugin: &Arc<dyn Any + Send + Sync>) -> PluginId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.table.lock().insert(id, Arc::downgrade(plugin));
        PluginId(id)
    }

    /// Remove `id` from the table. Idempotent: unregistering an id that
    /// isn't present (or was already unregistered) is a no-op.
    pub fn unregister(&self, id: PluginId) {
        self.table.lock().remove(&id.0);
    }

    /// Look up `id`, upgrading its weak handle. Returns
    /// `Err(PluginLookupMiss)` if the id was never registered, was
    /// unregistered, or its referent has already been dropped.
    pub fn lookup(&self, id: PluginId) -> Result<Arc<dyn Any + Send + Sync>> {
        self.table
            .lock()
            .get(&id.0)
            .and_then(Weak::upgrade)
            .ok_or(SchedError::PluginLookupMiss(id.0))
    }

    /// Number of entries still in the table, including ones whose
    /// referent has been dropped but never explicitly unregistered.
    /// Exposed for tests/diagnostics only.
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_lookup_returns_the_same_object() {
        let registry = PluginRegistry::new();
        let plugin: Arc<dyn Any + Send + Sync> = Arc::new(42u32);
        let id = registry.register(&plugin);

        let looked_up = registry.lookup(id).unwrap();
        assert_eq!(*looked_up.downcast_ref::<u32>().unwrap(), 42);
    }

    #[test]
    fn ids_are_never_reused() {
        let registry = PluginRegistry::new();
        let a: Arc<dyn Any + Send + Sync> = Arc::new(1u32);
        let b: Arc<dyn Any + Send + Sync> = Arc::new(2u32);

        let id_a = registry.register(&a);
        registry.unregister(id_a);
        let id_b = registry.register(&b);

        assert_ne!(id_a, id_b);
    }

    #[test]
    fn lookup_miss_on_unknown_id_is_an_error_not_a_panic() {
        let registry = PluginRegistry::new();
        let err = registry.lookup(PluginId(999)).unwrap_err();
        assert!(matches!(err, SchedError::PluginLookupMiss(999)));
    }

    #[test]
    fn dropping_every_strong_reference_makes_lookup_fail() {
        let registry = PluginRegistry::new();
        let plugin: Arc<dyn Any + Send + Sync> = Arc::new(7u32);
        let id = registry.register(&plugin);

        drop(plugin);

        assert!(registry.lookup(id).is_err());
    }

    #[test]
    fn unregister_is_idempotent() {
        let registry = PluginRegistry::new();
        let plugin: Arc<dyn Any + Send + Sync> = Arc::new(7u32);
        let id = registry.register(&plugin);

        registry.unregister(id);
        registry.unregister(id);
        assert!(registry.is_empty());
    }
}
