//! Resource manager: bounds concurrency per resource kind and arbitrates
//! exclusive access for cache maintenance.
//!
//! See the scheduler's cache-maintenance module for the primary consumer
//! of the exclusive-interest protocol: [`crate::cache`].

use std::collections::HashMap;

/// A named, count-quota-based resource kind.
///
/// The set is closed and fixed at compile time: builders consume
/// [`ResourceKind::Process`], fetchers consume [`ResourceKind::Download`],
/// pushers consume [`ResourceKind::Upload`], and [`ResourceKind::Cache`]
/// is shared by ordinary jobs that touch on-disk cache state and by the
/// cache-maintenance jobs that need it exclusively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Cache,
    Download,
    Upload,
    Process,
}

impl ResourceKind {
    /// All resource kinds, in a stable order.
    pub const ALL: [ResourceKind; 4] = [
        ResourceKind::Cache,
        ResourceKind::Download,
        ResourceKind::Upload,
        ResourceKind::Process,
    ];
}

#[derive(Debug, Default)]
struct KindState {
    max: u32,
    in_use: u32,
    /// interest_tag -> pending_count. Non-empty means only reservations
    /// whose `exclusive` set contains this kind may reserve it.
    exclusive_interest: HashMap<String, u32>,
}

/// Tracks per-kind quotas and in-flight reservations, and arbitrates
/// exclusive-interest escalation (see spec §4.A).
#[derive(Debug)]
pub struct ResourceManager {
    state: HashMap<ResourceKind, KindState>,
}

impl ResourceManager {
    /// Build a manager from per-kind quotas. `cache_quota` of `None` is
    /// represented internally as `u32::MAX` (see DESIGN.md Open Question 1):
    /// CACHE concurrency is then bounded solely by the exclusive-interest
    /// protocol, never by a count.
    pub fn new(builders: u32, fetchers: u32, pushers: u32, cache_quota: Option<u32>) -> Self {
        let mut state = HashMap::new();
        state.insert(
            ResourceKind::Process,
            KindState {
                max: builders.max(1),
                ..Default::default()
            },
        );
        state.insert(
            ResourceKind::Download,
            KindState {
                max: fetchers.max(1),
                ..Default::default()
            },
        );
        state.insert(
            ResourceKind::Upload,
            KindState {
                max: pushers.max(1),
                ..Default::default()
            },
        );
        state.insert(
            ResourceKind::Cache,
            KindState {
                max: cache_quota.unwrap_or(u32::MAX),
                ..Default::default()
            },
        );
        Self { state }
    }

    fn kind_state(&self, kind: ResourceKind) -> &KindState {
        self.state
            .get(&kind)
            .expect("ResourceKind::ALL is exhaustively initialized in ResourceManager::new")
    }

    fn kind_state_mut(&mut self, kind: ResourceKind) -> &mut KindState {
        self.state
            .get_mut(&kind)
            .expect("ResourceKind::ALL is exhaustively initialized in ResourceManager::new")
    }

    /// Current reservation count for a kind, for observability/tests.
    pub fn in_use(&self, kind: ResourceKind) -> u32 {
        self.kind_state(kind).in_use
    }

    /// Whether `kind` currently has any exclusive interest registered.
    pub fn has_exclusive_interest(&self, kind: ResourceKind) -> bool {
        !self.kind_state(kind).exclusive_interest.is_empty()
    }

    /// Attempt to reserve every kind in `requested` atomically.
    ///
    /// Succeeds only if, for every requested kind, there is spare quota
    /// *and* either no exclusive interest is registered on it or the
    /// caller's own `exclusive` set names it (so the exclusive holder can
    /// reserve its own resource). On success, `in_use` is incremented for
    /// every requested kind; on failure nothing changes.
    pub fn reserve(&mut self, requested: &[ResourceKind], exclusive: &[ResourceKind]) -> bool {
        for &kind in requested {
            let state = self.kind_state(kind);
            if state.in_use >= state.max {
                return false;
            }
            if !state.exclusive_interest.is_empty() && !exclusive.contains(&kind) {
                return false;
            }
        }

        for &kind in requested {
            self.kind_state_mut(kind).in_use += 1;
        }
        true
    }

    /// Release a prior reservation. Releasing a kind more times than it
    /// was reserved is a caller bug.
    pub fn release(&mut self, kinds: &[ResourceKind]) {
        for &kind in kinds {
            let state = self.kind_state_mut(kind);
            debug_assert!(state.in_use > 0, "released {kind:?} more times than reserved");
            state.in_use = state.in_use.saturating_sub(1);
        }
    }

    /// Register exclusive interest in `kinds` under `tag`. Idempotent per
    /// distinct `(tag, kind)` pair in the sense that repeated registration
    /// increments a counter; callers must pair each call with an
    /// `unregister_exclusive_interest` for the same tag and kinds.
    pub fn register_exclusive_interest(&mut self, kinds: &[ResourceKind], tag: &str) {
        for &kind in kinds {
            let counter = self
                .kind_state_mut(kind)
                .exclusive_interest
                .entry(tag.to_string())
                .or_insert(0);
            *counter += 1;
        }
    }

    /// Undo a prior `register_exclusive_interest` call for `tag`. The
    /// entry is removed once its counter reaches zero.
    pub fn unregister_exclusive_interest(&mut self, kinds: &[ResourceKind], tag: &str) {
        for &kind in kinds {
            let state = self.kind_state_mut(kind);
            if let Some(counter) = state.exclusive_interest.get_mut(tag) {
                *counter -= 1;
                if *counter == 0 {
                    state.exclusive_interest.remove(tag);
                }
            }
        }
    }
}
