//! Job: a unit of work dispatched by the scheduler.
//!
//! See `crates/pipeline-common/src/channel_pipeline.rs` in the teacher
//! repo for the "spawn a task, report completion" shape this is
//! generalized from, and `rust-srec/src/scheduler/task.rs` for the
//! `TaskStatus`-shaped state machine this mirrors.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::resource::ResourceKind;

/// Terminal and non-terminal states of a [`Job`].
///
/// `Pending -> Running -> {Succeeded, Failed, Skipped, Terminated}`.
/// Terminal states are absorbing: a job never transitions out of one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Terminated,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Pending | JobStatus::Running)
    }
}

/// The outcome reported through a job's completion callback.
///
/// `cache_size` is only populated by the cache-maintenance jobs (see
/// [`crate::cache`]); ordinary queue jobs leave it `None`.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub status: JobStatus,
    pub cache_size: Option<u64>,
}

impl JobOutcome {
    pub fn succeeded() -> Self {
        Self {
            status: JobStatus::Succeeded,
            cache_size: None,
        }
    }

    pub fn failed() -> Self {
        Self {
            status: JobStatus::Failed,
            cache_size: None,
        }
    }

    pub fn skipped() -> Self {
        Self {
            status: JobStatus::Skipped,
            cache_size: None,
        }
    }

    pub fn terminated() -> Self {
        Self {
            status: JobStatus::Terminated,
            cache_size: None,
        }
    }

    pub fn with_cache_size(mut self, size: u64) -> Self {
        self.cache_size = Some(size);
        self
    }
}

/// Invoked exactly once when a job reaches a terminal status.
pub type CompletionCallback = Box<dyn FnOnce(JobOutcome) + Send>;

/// A unit of work the scheduler dispatches.
///
/// Jobs are held as `Arc<dyn Job>` so that the scheduler can retain a
/// handle for `suspend`/`terminate`/`kill` while a clone of the same
/// `Arc` has been moved into the task `start` spawned. Each job is
/// expected to hand out interior-mutable state (a `CancellationToken`,
/// an `AtomicBool`, a child process handle behind a `Mutex`) to make
/// this sound.
#[async_trait]
pub trait Job: Send + Sync + 'static {
    /// Stable action name for the queue/stage this job belongs to
    /// (e.g. `"fetch"`, `"build"`, or the cache-maintenance action
    /// names `"size"`/`"clean"`).
    fn action_name(&self) -> &'static str;

    /// Human-readable display name, usually `"{action}/{element}"`.
    fn display_name(&self) -> String;

    /// Resource kinds this job needs reserved before it may start.
    fn resources(&self) -> Vec<ResourceKind>;

    /// Resource kinds this job needs to hold *exclusively* (see
    /// [`crate::resource::ResourceManager::reserve`]). Empty for
    /// ordinary jobs; the cleanup job requests `{Cache}` here.
    fn exclusive(&self) -> Vec<ResourceKind> {
        Vec::new()
    }

    /// Begin executing. Must invoke `on_complete` exactly once, when the
    /// job reaches a terminal [`JobStatus`]. Returns immediately;
    /// completion is reported asynchronously.
    fn start(self: Arc<Self>, on_complete: CompletionCallback);

    /// Best-effort: stop making progress without losing state, if the
    /// underlying worker supports it.
    fn suspend(&self);

    /// Best-effort: resume a previously suspended worker.
    fn resume(&self);

    /// Request cooperative shutdown.
    fn terminate(&self);

    /// Block up to `timeout` waiting for the job to reach a terminal
    /// state; returns whether it did.
    async fn terminate_wait(&self, timeout: Duration) -> bool;

    /// Forcibly end the worker.
    fn kill(&self);
}

/// Cooperative suspend/resume signal a [`FnJob`] body can poll between
/// checkpoints. Suspension of a plain `Future` can't be imposed from the
/// outside, so this is the best a generic job can offer; jobs backed by
/// a child process should send it `SIGSTOP`/`SIGCONT` directly instead.
#[derive(Debug, Default)]
pub struct SuspendGate {
    suspended: AtomicBool,
    notify: Notify,
}

impl SuspendGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn suspend(&self) {
        self.suspended.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.suspended.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Await until resumed, if currently suspended; otherwise returns
    /// immediately.
    pub async fn checkpoint(&self) {
        loop {
            // Register as a waiter before re-checking the flag, so a
            // `resume()` racing with this check can never be missed
            // between the load and the await (Notify::notified() alone
            // does not buffer a wakeup the way `notify_one` does).
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.suspended.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }
}

/// Internal done/not-done latch used by [`FnJob::terminate_wait`].
#[derive(Debug, Default)]
struct DoneSignal {
    done: AtomicBool,
    notify: Notify,
}

impl DoneSignal {
    fn mark_done(&self) {
        self.done.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    async fn wait(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.done.load(Ordering::SeqCst) {
            return;
        }
        notified.await;
    }
}

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// A [`Job`] built from an async closure, for queues that don't need a
/// bespoke `Job` impl (e.g. no real external process to suspend).
///
/// `terminate`/`kill` both cancel the same [`CancellationToken`]; the
/// closure is expected to observe it via [`FnJob::cancellation`] or by
/// racing it with its own work.
pub struct FnJob<F> {
    action_name: &'static str,
    display_name: String,
    resources: Vec<ResourceKind>,
    exclusive: Vec<ResourceKind>,
    token: CancellationToken,
    gate: Arc<SuspendGate>,
    done: Arc<DoneSignal>,
    run: parking_lot::Mutex<Option<F>>,
}

impl<F> FnJob<F>
where
    F: FnOnce(CancellationToken, Arc<SuspendGate>) -> BoxFuture<JobOutcome> + Send + 'static,
{
    pub fn new(
        action_name: &'static str,
        display_name: impl Into<String>,
        resources: Vec<ResourceKind>,
        run: F,
    ) -> Self {
        Self {
            action_name,
            display_name: display_name.into(),
            resources,
            exclusive: Vec::new(),
            token: CancellationToken::new(),
            gate: Arc::new(SuspendGate::new()),
            done: Arc::new(DoneSignal::default()),
            run: parking_lot::Mutex::new(Some(run)),
        }
    }

    pub fn with_exclusive(mut self, exclusive: Vec<ResourceKind>) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.token.clone()
    }
}

#[async_trait]
impl<F> Job for FnJob<F>
where
    F: FnOnce(CancellationToken, Arc<SuspendGate>) -> BoxFuture<JobOutcome> + Send + 'static,
{
    fn action_name(&self) -> &'static str {
        self.action_name
    }

    fn display_name(&self) -> String {
        self.display_name.clone()
    }

    fn resources(&self) -> Vec<ResourceKind> {
        self.resources.clone()
    }

    fn exclusive(&self) -> Vec<ResourceKind> {
        self.exclusive.clone()
    }

    fn start(self: Arc<Self>, on_complete: CompletionCallback) {
        let Some(run) = self.run.lock().take() else {
            warn!(job = self.display_name, "FnJob started twice; ignoring");
            return;
        };
        let token = self.token.clone();
        let gate = self.gate.clone();
        let done = self.done.clone();
        tokio::spawn(async move {
            let outcome = run(token, gate).await;
            debug!(status = ?outcome.status, "job finished");
            on_complete(outcome);
            done.mark_done();
        });
    }

    fn suspend(&self) {
        self.gate.suspend();
    }

    fn resume(&self) {
        self.gate.resume();
    }

    fn terminate(&self) {
        self.token.cancel();
    }

    async fn terminate_wait(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.done.wait()).await.is_ok()
    }

    fn kill(&self) {
        self.token.cancel();
    }
}
