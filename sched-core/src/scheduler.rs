//! Scheduler: drives the queue pipeline, owns the event loop, and
//! answers operator signals.
//!
//! The driver algorithm (`sched`/`sched_queue_jobs`/`sched_cleanup_job`/
//! `sched_cache_size_job`/`job_completed`) is a direct port of
//! `_sched`/`_sched_queue_jobs`/`_sched_cleanup_job`/
//! `_sched_cache_size_job`/`job_completed` in
//! `original_source/.../scheduler.py`; the actor-handle/event-channel
//! shape around it is grounded on
//! `rust-srec/src/scheduler/actor/supervisor.rs`.

use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tracing::warn;

use crate::cache::{ArtifactCache, CacheMaintenance};
use crate::job::{Job, JobOutcome, JobStatus};
use crate::queue::{HarvestedJob, Queue};
use crate::resource::{ResourceKind, ResourceManager};

/// Fires once when a job reaches a terminal status, keyed to a job id
/// only the scheduler knows about; see [`Scheduler::start_job`].
pub type InterruptCallback = Box<dyn Fn() + Send + Sync>;
pub type TickCallback = Box<dyn Fn() + Send + Sync>;
pub type JobStartCallback = Box<dyn Fn(&str) + Send + Sync>;
pub type JobCompleteCallback = Box<dyn Fn(&str, JobStatus) + Send + Sync>;

/// `run()`'s return value (spec's `SchedStatus`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedStatus {
    Success,
    Error,
    Terminated,
}

/// Construction parameters for a [`Scheduler`]. Mirrors
/// `SupervisorConfig`'s plain-struct-plus-`Default` shape
/// (`rust-srec/src/scheduler/actor/supervisor.rs`); the four callbacks
/// are optional because most callers only need a subset.
pub struct SchedulerConfig {
    pub builders: u32,
    pub fetchers: u32,
    pub pushers: u32,
    pub cache_quota: Option<u32>,
    pub tick_interval: Duration,
    pub job_termination_budget: Duration,
    pub interrupt_callback: Option<InterruptCallback>,
    pub tick_callback: Option<TickCallback>,
    pub job_start_callback: Option<JobStartCallback>,
    pub job_complete_callback: Option<JobCompleteCallback>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            builders: 4,
            fetchers: 4,
            pushers: 4,
            cache_quota: None,
            tick_interval: Duration::from_secs(1),
            job_termination_budget: Duration::from_secs(20),
            interrupt_callback: None,
            tick_callback: None,
            job_start_callback: None,
            job_complete_callback: None,
        }
    }
}

impl std::fmt::Debug for SchedulerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerConfig")
            .field("builders", &self.builders)
            .field("fetchers", &self.fetchers)
            .field("pushers", &self.pushers)
            .field("cache_quota", &self.cache_quota)
            .field("tick_interval", &self.tick_interval)
            .field("job_termination_budget", &self.job_termination_budget)
            .finish_non_exhaustive()
    }
}

/// What an active job's id tracks back to, so [`Scheduler::job_completed`]
/// knows which queue (if any) to report the outcome to.
enum ActiveJobKind<E> {
    Queue { queue_index: usize, element: E },
    CacheSize,
    Cleanup,
}

struct ActiveJob<E> {
    id: u64,
    job: Arc<dyn Job>,
    kind: ActiveJobKind<E>,
}

/// Requests that don't need `&mut Scheduler` at the call site: raised by
/// an interrupt callback, an owning task holding only a
/// [`SchedulerHandle`], or (for job completion) the job's own completion
/// closure running on a `tokio::spawn`ed task.
enum Event {
    JobComplete(u64, JobOutcome),
    Terminate,
    StopQueueing,
    CheckCacheSize,
}

/// Cloneable handle for requesting scheduler actions from outside the
/// `run()` call — e.g. from a signal handler closure or another task —
/// without holding `&mut Scheduler`. Grounded on the `ActorHandle<M>`
/// pattern in `rust-srec/src/scheduler/actor/supervisor.rs`.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<Event>,
}

impl SchedulerHandle {
    /// Request graceful termination of all active jobs; see
    /// [`Scheduler::terminate_jobs`].
    pub fn terminate_jobs(&self) {
        let _ = self.tx.send(Event::Terminate);
    }

    /// Stop admitting new queue jobs; the active set drains normally.
    pub fn stop_queueing(&self) {
        let _ = self.tx.send(Event::StopQueueing);
    }

    /// Raise the cache-size-scheduled flag for the next scheduling round.
    pub fn check_cache_size(&self) {
        let _ = self.tx.send(Event::CheckCacheSize);
    }
}

/// Drives a pipeline of [`Queue`]s to completion, dispatching jobs under
/// a shared [`ResourceManager`] and coordinating cache maintenance.
///
/// All mutable state is touched only from within [`Scheduler::run`]'s
/// loop (spec §5); external requests arrive only through the `Event`
/// channel a [`SchedulerHandle`] writes to.
pub struct Scheduler<E> {
    queues: Vec<Box<dyn Queue<Element = E>>>,
    resources: ResourceManager,
    cache: Arc<dyn ArtifactCache>,
    maintenance: CacheMaintenance,
    active: Vec<ActiveJob<E>>,
    terminated: bool,
    suspended: bool,
    queue_jobs: bool,
    start: Instant,
    start_wall: chrono::DateTime<chrono::Utc>,
    suspended_since: Option<Instant>,
    suspended_total: Duration,
    /// Counts self-raised SIGSTOPs still expected to echo back as a
    /// spurious SIGTSTP (spec §5). `SuspendGuard` and the SIGTSTP signal
    /// handler can never run concurrently in this port — `run()` holds
    /// `&mut self` for its whole duration, so `jobs_suspended()` cannot
    /// be called while the event loop is live — and `libc::raise`
    /// delivers a real, uncatchable `SIGSTOP` rather than the
    /// process-group `SIGTSTP` the original re-observes, so this stays
    /// at zero in practice; kept for fidelity with the original
    /// algorithm and as a guard should either assumption change.
    internal_stops: i64,
    next_job_id: u64,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
    config: SchedulerConfig,
}

impl<E> Scheduler<E>
where
    E: Clone + Eq + Hash + Send + Sync + 'static,
{
    /// Build a scheduler over `queues`, returning it paired with a
    /// [`SchedulerHandle`] for out-of-band requests. `queues` are
    /// consumed for exactly one `run()`.
    pub fn new(
        queues: Vec<Box<dyn Queue<Element = E>>>,
        cache: Arc<dyn ArtifactCache>,
        config: SchedulerConfig,
    ) -> (Self, SchedulerHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let resources = ResourceManager::new(config.builders, config.fetchers, config.pushers, config.cache_quota);
        let handle = SchedulerHandle { tx: tx.clone() };
        let scheduler = Self {
            queues,
            resources,
            cache,
            maintenance: CacheMaintenance::new(),
            active: Vec::new(),
            terminated: false,
            suspended: false,
            queue_jobs: true,
            start: Instant::now(),
            start_wall: chrono::Utc::now(),
            suspended_since: None,
            suspended_total: Duration::ZERO,
            internal_stops: 0,
            next_job_id: 0,
            events_tx: tx,
            events_rx: rx,
            config,
        };
        (scheduler, handle)
    }

    /// Wall-clock session start time, for display purposes only (see
    /// DESIGN.md Open Question 3). Use [`Scheduler::elapsed_time`] for
    /// any arithmetic.
    pub fn start_time(&self) -> chrono::DateTime<chrono::Utc> {
        self.start_wall
    }

    /// Time elapsed since the session started, minus any time spent
    /// suspended. Monotonic: built from [`Instant`], never from
    /// `start_wall`.
    pub fn elapsed_time(&self) -> Duration {
        let mut elapsed = self.start.elapsed().saturating_sub(self.suspended_total);
        if let Some(since) = self.suspended_since {
            elapsed = elapsed.saturating_sub(since.elapsed());
        }
        elapsed
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Push the initial elements into queue 0, run the scheduling loop
    /// until no jobs remain active, and report the overall outcome.
    pub async fn run(mut self, elements: Vec<E>) -> SchedStatus {
        if let Some(first) = self.queues.first_mut() {
            first.enqueue(elements);
        }

        let any_queue_wants_cache = self.queues.iter().any(|q| q.resources().contains(&ResourceKind::Cache));
        if any_queue_wants_cache && self.cache.full() {
            self.maintenance.schedule_startup_cache_size_job(&mut self.resources);
        }

        self.sched();

        if !self.active.is_empty() {
            self.event_loop().await;
        }

        self.finish()
    }

    async fn event_loop(&mut self) {
        #[cfg(unix)]
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        #[cfg(unix)]
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        #[cfg(unix)]
        let mut sigtstp = signal(SignalKind::from_raw(libc::SIGTSTP)).expect("failed to install SIGTSTP handler");

        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.tick().await; // the first tick fires immediately; consume it

        loop {
            #[cfg(unix)]
            tokio::select! {
                _ = sigint.recv() => self.on_sigint(),
                _ = sigterm.recv() => self.terminate_jobs(),
                _ = sigtstp.recv() => self.on_sigtstp(),
                _ = ticker.tick() => self.on_tick(),
                Some(event) = self.events_rx.recv() => self.on_event(event),
                else => break,
            }
            #[cfg(not(unix))]
            tokio::select! {
                _ = ticker.tick() => self.on_tick(),
                Some(event) = self.events_rx.recv() => self.on_event(event),
                else => break,
            }

            if self.active.is_empty() {
                break;
            }
        }
    }

    fn on_event(&mut self, event: Event) {
        match event {
            Event::JobComplete(id, outcome) => self.job_completed(id, outcome),
            Event::Terminate => self.terminate_jobs(),
            Event::StopQueueing => self.stop_queueing(),
            Event::CheckCacheSize => self.check_cache_size(),
        }
    }

    fn on_tick(&self) {
        if let Some(cb) = &self.config.tick_callback {
            cb();
        }
    }

    fn on_sigint(&mut self) {
        if self.terminated {
            return;
        }
        if let Some(cb) = &self.config.interrupt_callback {
            cb();
        } else {
            self.terminate_jobs();
        }
    }

    fn on_sigtstp(&mut self) {
        if self.internal_stops > 0 {
            self.internal_stops -= 1;
            return;
        }
        self.suspend_jobs();
        #[cfg(unix)]
        unsafe {
            libc::raise(libc::SIGSTOP);
        }
        self.resume_jobs();
    }

    fn suspend_jobs(&mut self) {
        self.suspended = true;
        self.suspended_since = Some(Instant::now());
        for active in &self.active {
            active.job.suspend();
        }
    }

    fn resume_jobs(&mut self) {
        if let Some(since) = self.suspended_since.take() {
            self.suspended_total += since.elapsed();
        }
        self.suspended = false;
        for active in &self.active {
            active.job.resume();
        }
    }

    /// Stop admitting new queue jobs; `sched_queue_jobs`'s inner loop
    /// checks this flag on every iteration so the active set still
    /// drains to completion normally.
    pub fn stop_queueing(&mut self) {
        self.queue_jobs = false;
    }

    /// Raise `cache_size_scheduled` for the next scheduling round.
    /// Deliberately does not call `sched()` itself — the flag is picked
    /// up the next time a job completes or `run()`'s own driver ticks.
    pub fn check_cache_size(&mut self) {
        self.maintenance.request_cache_size_check();
    }

    /// Request cooperative shutdown of every active job. Blocks SIGINT
    /// on the calling thread so a repeated interrupt during shutdown
    /// can't disrupt it, then hands the actual termination ladder to a
    /// background task so this call (and the loop that invoked it) never
    /// blocks.
    pub fn terminate_jobs(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        block_sigint();

        let active: Vec<Arc<dyn Job>> = self.active.iter().map(|a| a.job.clone()).collect();
        let budget = self.config.job_termination_budget;
        tokio::spawn(terminate_jobs_real(active, budget));
    }

    /// Suspend all active jobs for the duration of the returned guard,
    /// resuming them (even across an early return or panic unwind) when
    /// it drops. Can only be called between `run()` invocations: `run()`
    /// holds `&mut self` for its entire duration, so this type can never
    /// be constructed while the event loop (and its own SIGTSTP
    /// handling) is live.
    pub fn jobs_suspended(&mut self) -> SuspendGuard<'_, E> {
        self.suspend_jobs();
        SuspendGuard { scheduler: self }
    }

    fn sched(&mut self) {
        if !self.terminated {
            self.sched_cleanup_job();
            self.sched_cache_size_job();
            self.sched_queue_jobs();
        }
    }

    fn sched_cleanup_job(&mut self) {
        if let Some(job) = self.maintenance.sched_cleanup_job(&mut self.resources, &self.cache) {
            self.start_job(ActiveJobKind::Cleanup, job);
        }
    }

    fn sched_cache_size_job(&mut self) {
        if let Some(job) = self.maintenance.sched_cache_size_job(&mut self.resources, &self.cache) {
            self.start_job(ActiveJobKind::CacheSize, job);
        }
    }

    fn sched_queue_jobs(&mut self) {
        let mut ready_jobs: Vec<(usize, HarvestedJob<E>)> = Vec::new();

        loop {
            if !self.queue_jobs {
                break;
            }

            let mut carry: Vec<E> = Vec::new();
            for queue in self.queues.iter_mut() {
                if !carry.is_empty() {
                    queue.enqueue(std::mem::take(&mut carry));
                }
                carry = queue.dequeue();
            }
            // Anything still in `carry` fell off the last queue: those
            // elements have finished the whole pipeline.

            for index in (0..self.queues.len()).rev() {
                for harvested in self.queues[index].harvest_jobs(&mut self.resources) {
                    ready_jobs.push((index, harvested));
                }
            }

            // Every queue's `dequeue_ready()` must run this round, even
            // once one has reported progress — an iterator `.any()`
            // would short-circuit and skip calling it on later queues.
            let mut progressed = false;
            for queue in self.queues.iter_mut() {
                if queue.dequeue_ready() {
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }

        for (index, harvested) in ready_jobs {
            self.start_job(
                ActiveJobKind::Queue {
                    queue_index: index,
                    element: harvested.element,
                },
                harvested.job,
            );
        }
    }

    fn start_job(&mut self, kind: ActiveJobKind<E>, job: Arc<dyn Job>) {
        let id = self.next_job_id;
        self.next_job_id += 1;

        if let Some(cb) = &self.config.job_start_callback {
            cb(&job.display_name());
        }

        let tx = self.events_tx.clone();
        job.clone().start(Box::new(move |outcome| {
            let _ = tx.send(Event::JobComplete(id, outcome));
        }));

        self.active.push(ActiveJob { id, job, kind });
    }

    fn job_completed(&mut self, id: u64, outcome: JobOutcome) {
        let Some(pos) = self.active.iter().position(|a| a.id == id) else {
            warn!(job_id = id, "job_completed for an unknown job id; ignoring");
            return;
        };
        let active = self.active.remove(pos);

        // Generic release for every job, ahead of queue/cache-specific
        // completion logic (DESIGN.md Open Question 6).
        self.resources.release(&active.job.resources());

        if let Some(cb) = &self.config.job_complete_callback {
            cb(&active.job.display_name(), outcome.status);
        }

        match active.kind {
            ActiveJobKind::Queue { queue_index, element } => {
                let touched_cache = active.job.resources().contains(&ResourceKind::Cache);
                self.queues[queue_index].job_completed(&element, outcome.status);
                if touched_cache && outcome.status == JobStatus::Succeeded {
                    self.maintenance.request_cache_size_check();
                }
            }
            ActiveJobKind::CacheSize => {
                self.maintenance.cache_size_job_complete(&mut self.resources, &outcome, &self.cache);
            }
            ActiveJobKind::Cleanup => {
                self.maintenance.cleanup_job_complete(&mut self.resources);
            }
        }

        self.sched();
    }

    fn finish(&self) -> SchedStatus {
        let any_failed = self.queues.iter().any(|q| !q.failed_elements().is_empty());
        if any_failed {
            SchedStatus::Error
        } else if self.terminated {
            SchedStatus::Terminated
        } else {
            SchedStatus::Success
        }
    }
}

async fn terminate_jobs_real(active: Vec<Arc<dyn Job>>, budget: Duration) {
    for job in &active {
        job.terminate();
    }

    let deadline = Instant::now() + budget;
    for job in &active {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if !job.terminate_wait(remaining).await {
            job.kill();
        }
    }
}

#[cfg(unix)]
fn block_sigint() {
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGINT);
        libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut());
    }
}

#[cfg(not(unix))]
fn block_sigint() {}

/// RAII guard returned by [`Scheduler::jobs_suspended`]; resumes all
/// jobs on drop, including on an early return or panic unwind (the
/// "context manager scoped resources" redesign hint in the original
/// design notes).
pub struct SuspendGuard<'a, E> {
    scheduler: &'a mut Scheduler<E>,
}

impl<E> Drop for SuspendGuard<'_, E> {
    fn drop(&mut self) {
        self.scheduler.resume_jobs();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{FnJob, JobOutcome as Outcome};
    use crate::queue::{Admission, InMemoryQueue, QueuePolicy};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration as StdDuration;

    struct FakeCache {
        full: AtomicBool,
    }

    impl ArtifactCache for FakeCache {
        fn full(&self) -> bool {
            self.full.load(Ordering::SeqCst)
        }
        fn compute_size(&self) -> crate::error::Result<u64> {
            Ok(0)
        }
        fn cleanup(&self) -> crate::error::Result<u64> {
            Ok(0)
        }
    }

    fn fake_cache(full: bool) -> Arc<dyn ArtifactCache> {
        Arc::new(FakeCache { full: AtomicBool::new(full) })
    }

    struct AlwaysSucceed;

    impl QueuePolicy<u32> for AlwaysSucceed {
        fn admit(&self, element: &u32) -> Admission {
            let display = format!("test/{element}");
            Admission::Dispatch(Arc::new(FnJob::new("test", display, Vec::new(), |_token, _gate| {
                Box::pin(async { Outcome::succeeded() })
            })))
        }
    }

    struct FailOne(u32);

    impl QueuePolicy<u32> for FailOne {
        fn admit(&self, element: &u32) -> Admission {
            let display = format!("test/{element}");
            let should_fail = *element == self.0;
            Admission::Dispatch(Arc::new(FnJob::new("test", display, Vec::new(), move |_token, _gate| {
                Box::pin(async move {
                    if should_fail {
                        Outcome::failed()
                    } else {
                        Outcome::succeeded()
                    }
                })
            })))
        }
    }

    fn config_with_fast_tick() -> SchedulerConfig {
        SchedulerConfig {
            tick_interval: StdDuration::from_millis(20),
            ..SchedulerConfig::default()
        }
    }

    #[tokio::test]
    async fn empty_queue_list_returns_success_immediately() {
        let (scheduler, _handle) = Scheduler::<u32>::new(Vec::new(), fake_cache(false), config_with_fast_tick());
        let status = scheduler.run(vec![1, 2, 3]).await;
        assert_eq!(status, SchedStatus::Success);
    }

    #[tokio::test]
    async fn linear_progress_through_two_queues_succeeds() {
        let q0: Box<dyn Queue<Element = u32>> =
            Box::new(InMemoryQueue::new("fetch", vec![ResourceKind::Download], AlwaysSucceed));
        let q1: Box<dyn Queue<Element = u32>> =
            Box::new(InMemoryQueue::new("build", vec![ResourceKind::Process], AlwaysSucceed));

        let (scheduler, _handle) = Scheduler::new(vec![q0, q1], fake_cache(false), config_with_fast_tick());
        let status = scheduler.run(vec![1, 2, 3, 4]).await;
        assert_eq!(status, SchedStatus::Success);
    }

    #[tokio::test]
    async fn failure_in_a_queue_yields_error_status() {
        let q0: Box<dyn Queue<Element = u32>> = Box::new(InMemoryQueue::new("fetch", vec![], AlwaysSucceed));
        let q1: Box<dyn Queue<Element = u32>> = Box::new(InMemoryQueue::new("build", vec![], FailOne(2)));

        let (scheduler, _handle) = Scheduler::new(vec![q0, q1], fake_cache(false), config_with_fast_tick());
        let status = scheduler.run(vec![1, 2, 3]).await;
        assert_eq!(status, SchedStatus::Error);
    }

    #[tokio::test]
    async fn job_complete_callback_observes_every_job() {
        use std::sync::Mutex;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = seen.clone();
        let mut config = config_with_fast_tick();
        config.job_complete_callback = Some(Box::new(move |name, status| {
            seen_cb.lock().unwrap().push((name.to_string(), status));
        }));

        let q0: Box<dyn Queue<Element = u32>> = Box::new(InMemoryQueue::new("fetch", vec![], AlwaysSucceed));
        let (scheduler, _handle) = Scheduler::new(vec![q0], fake_cache(false), config);
        let status = scheduler.run(vec![1, 2]).await;

        assert_eq!(status, SchedStatus::Success);
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn quota_of_one_serializes_jobs_across_a_single_queue() {
        let mut config = config_with_fast_tick();
        config.builders = 1;

        let q0: Box<dyn Queue<Element = u32>> =
            Box::new(InMemoryQueue::new("build", vec![ResourceKind::Process], AlwaysSucceed));
        let (scheduler, _handle) = Scheduler::new(vec![q0], fake_cache(false), config);
        let status = scheduler.run(vec![1, 2, 3, 4, 5]).await;
        assert_eq!(status, SchedStatus::Success);
    }
}
