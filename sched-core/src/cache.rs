//! Cache maintenance: the two singleton jobs (cache-size recomputation,
//! cleanup) and the scheduling/gating logic that ties them to the
//! resource manager's exclusive-interest protocol.
//!
//! The scheduling decisions here (when to (re)register exclusive
//! interest, when a completion should or shouldn't trigger the next
//! step) are grounded directly on `_sched_cleanup_job`/
//! `_sched_cache_size_job`/`_cache_size_job_complete`/
//! `_cleanup_job_complete` in the BuildStream scheduler this crate's
//! scheduler module generalizes.

use std::sync::Arc;

use tracing::warn;

use crate::error::Result;
use crate::job::{FnJob, Job, JobOutcome, JobStatus};
use crate::resource::{ResourceKind, ResourceManager};

const ACTION_CACHE_SIZE: &str = "size";
const ACTION_CLEANUP: &str = "clean";
const INTEREST_CACHE_SIZE: &str = "cache-size";
const INTEREST_CLEANUP: &str = "cache-cleanup";

/// The artifact cache collaborator (spec's `context.artifactcache`):
/// recomputes its own real on-disk size, evicts down to quota, and
/// reports whether it is currently over quota. Business logic for "how
/// big is too big" lives entirely on the implementor; this crate only
/// orchestrates *when* these operations run relative to other jobs.
pub trait ArtifactCache: Send + Sync + 'static {
    /// Whether the cache is currently estimated to be over quota.
    fn full(&self) -> bool;

    /// Recompute the real, current on-disk cache size in bytes.
    fn compute_size(&self) -> Result<u64>;

    /// Evict cache entries until under quota; returns the resulting size.
    fn cleanup(&self) -> Result<u64>;
}

fn cache_size_job(cache: Arc<dyn ArtifactCache>) -> Arc<dyn Job> {
    Arc::new(FnJob::new(
        ACTION_CACHE_SIZE,
        "cache_size/cache_size",
        vec![ResourceKind::Cache, ResourceKind::Process],
        move |_token, _gate| {
            Box::pin(async move {
                match tokio::task::spawn_blocking(move || cache.compute_size()).await {
                    Ok(Ok(size)) => JobOutcome::succeeded().with_cache_size(size),
                    Ok(Err(err)) => {
                        warn!(error = %err, "cache size computation failed");
                        JobOutcome::failed()
                    }
                    Err(join_err) => {
                        warn!(error = %join_err, "cache size task panicked");
                        JobOutcome::failed()
                    }
                }
            })
        },
    ))
}

fn cleanup_job(cache: Arc<dyn ArtifactCache>) -> Arc<dyn Job> {
    Arc::new(
        FnJob::new(
            ACTION_CLEANUP,
            "cleanup/cleanup",
            vec![ResourceKind::Cache, ResourceKind::Process],
            move |_token, _gate| {
                Box::pin(async move {
                    match tokio::task::spawn_blocking(move || cache.cleanup()).await {
                        Ok(Ok(size)) => JobOutcome::succeeded().with_cache_size(size),
                        Ok(Err(err)) => {
                            warn!(error = %err, "cache cleanup failed");
                            JobOutcome::failed()
                        }
                        Err(join_err) => {
                            warn!(error = %join_err, "cache cleanup task panicked");
                            JobOutcome::failed()
                        }
                    }
                })
            },
        )
        .with_exclusive(vec![ResourceKind::Cache]),
    )
}

/// Owns the cache-maintenance flags and running-job bookkeeping
/// (spec.md §4.D); the scheduler consults it every `_sched()` tick.
///
/// All mutation happens from the scheduler's single loop thread, so no
/// internal locking is needed (spec.md §5: "all mutable scheduler state
/// is touched only from the loop thread").
#[derive(Debug, Default)]
pub struct CacheMaintenance {
    cache_size_scheduled: bool,
    cache_size_running: bool,
    cache_size_exclusive: bool,
    cleanup_scheduled: bool,
    cleanup_running: bool,
    cleanup_interest_registered: bool,
}

impl CacheMaintenance {
    pub fn new() -> Self {
        Self::default()
    }

    /// External hint that cache usage may have changed (normally raised
    /// after an ordinary job completes); corresponds to the owner-facing
    /// `Scheduler::check_cache_size()`.
    pub fn request_cache_size_check(&mut self) {
        self.cache_size_scheduled = true;
    }

    /// Startup condition (spec.md §4.D): the quota is already estimated
    /// to be over budget before any queue has run. Schedules an
    /// *exclusive* cache-size job. Caller must ensure no jobs are active
    /// yet; that invariant belongs to the scheduler (see DESIGN.md Open
    /// Question 2), not this type.
    pub fn schedule_startup_cache_size_job(&mut self, resources: &mut ResourceManager) {
        debug_assert!(!self.cache_size_scheduled);
        debug_assert!(!self.cache_size_running);
        self.cache_size_scheduled = true;
        self.cache_size_exclusive = true;
        resources.register_exclusive_interest(&[ResourceKind::Cache], INTEREST_CACHE_SIZE);
    }

    /// Whether a cache-size or cleanup job is currently running (used by
    /// the scheduler to decide whether `_sched` still has pending work).
    pub fn has_running_job(&self) -> bool {
        self.cache_size_running || self.cleanup_running
    }

    /// Attempt to launch the cache-size job if one is scheduled and none
    /// is already running. Returns the job to start on success.
    pub fn sched_cache_size_job(
        &mut self,
        resources: &mut ResourceManager,
        cache: &Arc<dyn ArtifactCache>,
    ) -> Option<Arc<dyn Job>> {
        if !self.cache_size_scheduled || self.cache_size_running {
            return None;
        }

        let exclusive: &[ResourceKind] = if self.cache_size_exclusive {
            &[ResourceKind::Cache]
        } else {
            &[]
        };

        if resources.reserve(&[ResourceKind::Cache, ResourceKind::Process], exclusive) {
            self.cache_size_scheduled = false;
            self.cache_size_running = true;
            Some(cache_size_job(cache.clone()))
        } else {
            None
        }
    }

    /// Attempt to launch the cleanup job if one is scheduled and none is
    /// already running. Registers exclusive interest in CACHE the first
    /// time a cleanup is scheduled (spec.md §4.D: "the scheduler first
    /// `register_exclusive_interest`, then attempts reservation each
    /// round until it succeeds") and keeps retrying on subsequent ticks
    /// without re-registering.
    pub fn sched_cleanup_job(
        &mut self,
        resources: &mut ResourceManager,
        cache: &Arc<dyn ArtifactCache>,
    ) -> Option<Arc<dyn Job>> {
        if !self.cleanup_scheduled || self.cleanup_running {
            return None;
        }

        if !self.cleanup_interest_registered {
            resources.register_exclusive_interest(&[ResourceKind::Cache], INTEREST_CLEANUP);
            self.cleanup_interest_registered = true;
        }

        if resources.reserve(
            &[ResourceKind::Cache, ResourceKind::Process],
            &[ResourceKind::Cache],
        ) {
            self.cleanup_scheduled = false;
            self.cleanup_running = true;
            Some(cleanup_job(cache.clone()))
        } else {
            None
        }
    }

    /// Report that the cache-size job finished. The scheduler has already
    /// released its `{CACHE, PROCESS}` reservation generically (the same
    /// way it does for any job, §4.E); this unregisters any exclusive
    /// interest the job held and — only on success, per the original's
    /// success-gate (spec.md EXPANSION §E.2.3) — schedules a cleanup if
    /// the cache is still over quota afterward.
    pub fn cache_size_job_complete(
        &mut self,
        resources: &mut ResourceManager,
        outcome: &JobOutcome,
        cache: &Arc<dyn ArtifactCache>,
    ) {
        self.cache_size_running = false;
        resources.unregister_exclusive_interest(&[ResourceKind::Cache], INTEREST_CACHE_SIZE);
        self.cache_size_exclusive = false;

        if outcome.status != JobStatus::Succeeded {
            return;
        }
        if cache.full() {
            self.cleanup_scheduled = true;
        }
    }

    /// Report that the cleanup job finished. As with the cache-size job,
    /// resource release already happened generically; this only
    /// unregisters exclusive interest, and only if no further cleanup
    /// got (re-)scheduled before this callback ran (spec.md EXPANSION
    /// §E.2.4).
    pub fn cleanup_job_complete(&mut self, resources: &mut ResourceManager) {
        self.cleanup_running = false;
        if !self.cleanup_scheduled {
            resources.unregister_exclusive_interest(&[ResourceKind::Cache], INTEREST_CLEANUP);
            self.cleanup_interest_registered = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakeCache {
        full: AtomicBool,
    }

    impl ArtifactCache for FakeCache {
        fn full(&self) -> bool {
            self.full.load(Ordering::SeqCst)
        }
        fn compute_size(&self) -> Result<u64> {
            Ok(0)
        }
        fn cleanup(&self) -> Result<u64> {
            Ok(0)
        }
    }

    fn fake_cache(full: bool) -> Arc<dyn ArtifactCache> {
        Arc::new(FakeCache {
            full: AtomicBool::new(full),
        })
    }

    #[test]
    fn cache_size_job_is_only_scheduled_once_requested() {
        let mut mgr = ResourceManager::new(4, 4, 4, None);
        let mut maint = CacheMaintenance::new();
        let cache = fake_cache(false);

        assert!(maint.sched_cache_size_job(&mut mgr, &cache).is_none());
        maint.request_cache_size_check();
        assert!(maint.sched_cache_size_job(&mut mgr, &cache).is_some());
        // Already running: a second attempt this tick does nothing.
        assert!(maint.sched_cache_size_job(&mut mgr, &cache).is_none());
    }

    #[test]
    fn cache_size_completion_schedules_cleanup_only_on_success_and_full() {
        let mut mgr = ResourceManager::new(4, 4, 4, None);
        let mut maint = CacheMaintenance::new();
        let cache = fake_cache(true);

        maint.request_cache_size_check();
        maint.sched_cache_size_job(&mut mgr, &cache).unwrap();
        maint.cache_size_job_complete(&mut mgr, &JobOutcome::succeeded(), &cache);
        assert!(maint.cleanup_scheduled);
    }

    #[test]
    fn failed_cache_size_job_does_not_schedule_cleanup_even_if_full() {
        let mut mgr = ResourceManager::new(4, 4, 4, None);
        let mut maint = CacheMaintenance::new();
        let cache = fake_cache(true);

        maint.request_cache_size_check();
        maint.sched_cache_size_job(&mut mgr, &cache).unwrap();
        maint.cache_size_job_complete(&mut mgr, &JobOutcome::failed(), &cache);
        assert!(!maint.cleanup_scheduled);
    }

    #[test]
    fn cleanup_registers_exclusive_interest_and_blocks_other_cache_reservations() {
        let mut mgr = ResourceManager::new(4, 4, 4, None);
        let mut maint = CacheMaintenance::new();
        let cache = fake_cache(true);

        maint.cleanup_scheduled = true;
        // Some other CACHE reservation is outstanding, so the cleanup
        // can't get in yet, but exclusive interest is registered anyway.
        assert!(mgr.reserve(&[ResourceKind::Cache], &[]));
        assert!(maint.sched_cleanup_job(&mut mgr, &cache).is_none());
        assert!(mgr.has_exclusive_interest(ResourceKind::Cache));
        assert!(!mgr.reserve(&[ResourceKind::Cache], &[]));
    }

    #[test]
    fn cleanup_unregisters_only_if_not_rescheduled() {
        let mut mgr = ResourceManager::new(4, 4, 4, None);
        let mut maint = CacheMaintenance::new();
        let cache = fake_cache(false);

        maint.cleanup_scheduled = true;
        maint.sched_cleanup_job(&mut mgr, &cache).unwrap();

        // A fresh cleanup got queued again before completion fired.
        maint.cleanup_scheduled = true;
        maint.cleanup_job_complete(&mut mgr);
        assert!(mgr.has_exclusive_interest(ResourceKind::Cache));

        maint.cleanup_scheduled = false;
        maint.cleanup_job_complete(&mut mgr);
        assert!(!mgr.has_exclusive_interest(ResourceKind::Cache));
    }
}
