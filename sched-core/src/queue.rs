//! Queue: an ordered pipeline stage that elements flow through.
//!
//! Mirrors the spawn-per-stage / callback-on-completion shape of the
//! teacher's `crates/pipeline-common` pipeline, generalized from a fixed
//! processor chain to the scheduler's pending/ready/in-flight/done model
//! (see [`crate::scheduler`] for the driver that walks a collection of
//! these).

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;

use tracing::warn;

use crate::job::{Job, JobStatus};
use crate::resource::{ResourceKind, ResourceManager};

/// A job harvested for dispatch, paired with the element it was raised
/// for so the caller can report completion back via
/// [`Queue::job_completed`].
pub struct HarvestedJob<E> {
    pub element: E,
    pub job: Arc<dyn Job>,
}

/// A pipeline stage. `Element` is opaque to the stage beyond identity
/// (`Clone + Eq + Hash`): the stage never inspects it, only tracks which
/// of its internal sets an element currently belongs to.
pub trait Queue: Send + Sync {
    type Element: Clone + Eq + Hash + Send + Sync + 'static;

    /// Stable action name, e.g. `"fetch"` or `"build"`.
    fn action_name(&self) -> &'static str;

    /// Resource kinds every job this stage harvests will request.
    fn resources(&self) -> &[ResourceKind];

    /// Accept new elements into `pending`.
    fn enqueue(&mut self, elements: Vec<Self::Element>);

    /// Drain and return the elements promoted to `done` this round, for
    /// hand-off to the next stage's `enqueue`.
    fn dequeue(&mut self) -> Vec<Self::Element>;

    /// Promote admissible `pending` elements to `ready`. Returns whether
    /// any promotion happened, so the scheduler's multi-round loop knows
    /// whether to run another pass.
    fn dequeue_ready(&mut self) -> bool;

    /// For every `ready` element the stage's policy admits, reserve this
    /// stage's declared [`resources`](Queue::resources) against
    /// `resources` and, if that succeeds, allocate a job and move the
    /// element to in-flight. Elements the policy skips are marked done
    /// (success) without consuming a reservation. Stops (leaving
    /// whatever is left in `ready`) as soon as a reservation fails, since
    /// every ready element in a stage wants the same resource set.
    /// Returns the jobs dispatched this call.
    fn harvest_jobs(&mut self, resources: &mut ResourceManager) -> Vec<HarvestedJob<Self::Element>>;

    /// Report that `element`'s job reached a terminal status. Moves the
    /// element out of in-flight into `done` (on success or skip) or the
    /// failed set (on failure or termination). The reservation taken for
    /// it in `harvest_jobs` is released by the caller (the scheduler),
    /// not here.
    fn job_completed(&mut self, element: &Self::Element, status: JobStatus);

    /// Elements whose jobs in this stage failed (or were terminated).
    fn failed_elements(&self) -> &[Self::Element];
}

/// What a [`QueuePolicy`] decides to do with a ready element.
pub enum Admission {
    /// Dispatch this job for the element.
    Dispatch(Arc<dyn Job>),
    /// Mark the element done without running a job.
    Skip,
}

/// Per-queue admission policy: decides whether a ready element gets a job
/// or is skipped, and builds that job. The "what does fetch/build
/// actually do" business logic the core treats as an external
/// collaborator (spec.md §1) lives entirely behind this trait.
pub trait QueuePolicy<E>: Send + Sync {
    fn admit(&self, element: &E) -> Admission;
}

/// Default [`Queue`] implementation: plain in-memory pending/ready/
/// in-flight/done sets driven by a [`QueuePolicy`]. Suffices for callers
/// who don't need bespoke set bookkeeping (e.g. priority reordering).
pub struct InMemoryQueue<E, P> {
    action_name: &'static str,
    resources: Vec<ResourceKind>,
    policy: P,
    pending: VecDeque<E>,
    ready: VecDeque<E>,
    in_flight: HashSet<E>,
    done: Vec<E>,
    failed: Vec<E>,
}

impl<E, P> InMemoryQueue<E, P>
where
    E: Clone + Eq + Hash + Send + Sync + 'static,
    P: QueuePolicy<E>,
{
    pub fn new(action_name: &'static str, resources: Vec<ResourceKind>, policy: P) -> Self {
        Self {
            action_name,
            resources,
            policy,
            pending: VecDeque::new(),
            ready: VecDeque::new(),
            in_flight: HashSet::new(),
            done: Vec::new(),
            failed: Vec::new(),
        }
    }

    /// Elements currently admitted but not yet dispatched.
    pub fn ready_count(&self) -> usize {
        self.ready.len()
    }

    /// Elements with a job currently running.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }
}

impl<E, P> Queue for InMemoryQueue<E, P>
where
    E: Clone + Eq + Hash + Send + Sync + 'static,
    P: QueuePolicy<E> + Send + Sync,
{
    type Element = E;

    fn action_name(&self) -> &'static str {
        self.action_name
    }

    fn resources(&self) -> &[ResourceKind] {
        &self.resources
    }

    fn enqueue(&mut self, elements: Vec<E>) {
        self.pending.extend(elements);
    }

    fn dequeue(&mut self) -> Vec<E> {
        std::mem::take(&mut self.done)
    }

    fn dequeue_ready(&mut self) -> bool {
        if self.pending.is_empty() {
            return false;
        }
        self.ready.extend(self.pending.drain(..));
        true
    }

    fn harvest_jobs(&mut self, resources: &mut ResourceManager) -> Vec<HarvestedJob<E>> {
        let mut harvested = Vec::new();
        while let Some(element) = self.ready.pop_front() {
            match self.policy.admit(&element) {
                Admission::Skip => self.done.push(element),
                Admission::Dispatch(job) => {
                    if resources.reserve(&self.resources, &[]) {
                        self.in_flight.insert(element.clone());
                        harvested.push(HarvestedJob { element, job });
                    } else {
                        self.ready.push_front(element);
                        break;
                    }
                }
            }
        }
        harvested
    }

    fn job_completed(&mut self, element: &E, status: JobStatus) {
        if !self.in_flight.remove(element) {
            warn!(
                queue = self.action_name,
                "job_completed reported for an element that wasn't in flight; ignoring"
            );
            return;
        }
        match status {
            JobStatus::Succeeded | JobStatus::Skipped => self.done.push(element.clone()),
            JobStatus::Failed | JobStatus::Terminated => self.failed.push(element.clone()),
            JobStatus::Pending | JobStatus::Running => {
                debug_assert!(false, "job_completed called with a non-terminal status");
            }
        }
    }

    fn failed_elements(&self) -> &[E] {
        &self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysDispatch;

    impl QueuePolicy<u32> for AlwaysDispatch {
        fn admit(&self, element: &u32) -> Admission {
            Admission::Dispatch(Arc::new(crate::job::FnJob::new(
                "test",
                format!("test/{element}"),
                Vec::new(),
                |_token, _gate| Box::pin(async { crate::job::JobOutcome::succeeded() }),
            )))
        }
    }

    struct SkipEven;

    impl QueuePolicy<u32> for SkipEven {
        fn admit(&self, element: &u32) -> Admission {
            if element % 2 == 0 {
                Admission::Skip
            } else {
                Admission::Dispatch(Arc::new(crate::job::FnJob::new(
                    "test",
                    format!("test/{element}"),
                    Vec::new(),
                    |_token, _gate| Box::pin(async { crate::job::JobOutcome::succeeded() }),
                )))
            }
        }
    }

    #[test]
    fn enqueue_then_ready_then_harvest_dispatches_one_job_per_element() {
        let mut resources = ResourceManager::new(4, 4, 4, None);
        let mut q = InMemoryQueue::new("fetch", vec![ResourceKind::Download], AlwaysDispatch);
        q.enqueue(vec![1, 2, 3]);
        assert!(q.dequeue_ready());
        assert_eq!(q.ready_count(), 3);

        let jobs = q.harvest_jobs(&mut resources);
        assert_eq!(jobs.len(), 3);
        assert_eq!(q.in_flight_count(), 3);
        assert_eq!(q.ready_count(), 0);
        assert_eq!(resources.in_use(ResourceKind::Download), 3);
    }

    #[test]
    fn dequeue_ready_is_false_on_empty_pending() {
        let mut q = InMemoryQueue::new("fetch", vec![], AlwaysDispatch);
        assert!(!q.dequeue_ready());
    }

    #[test]
    fn skipped_elements_are_done_without_a_job() {
        let mut resources = ResourceManager::new(4, 4, 4, None);
        let mut q = InMemoryQueue::new("fetch", vec![], SkipEven);
        q.enqueue(vec![1, 2, 3, 4]);
        q.dequeue_ready();
        let jobs = q.harvest_jobs(&mut resources);
        // 1 and 3 dispatch; 2 and 4 are skipped straight to done.
        assert_eq!(jobs.len(), 2);
        let done = q.dequeue();
        assert_eq!(done, vec![2, 4]);
    }

    #[test]
    fn harvest_stops_and_leaves_element_ready_once_quota_is_exhausted() {
        let mut resources = ResourceManager::new(4, 4, 4, None);
        // Pre-exhaust PROCESS so this stage can't reserve anything.
        resources.reserve(&[ResourceKind::Process; 4], &[]);

        let mut q = InMemoryQueue::new("build", vec![ResourceKind::Process], AlwaysDispatch);
        q.enqueue(vec![1, 2]);
        q.dequeue_ready();

        let jobs = q.harvest_jobs(&mut resources);
        assert!(jobs.is_empty());
        assert_eq!(q.ready_count(), 2);
        assert_eq!(q.in_flight_count(), 0);
    }

    #[test]
    fn job_completed_routes_success_to_done_and_failure_to_failed() {
        let mut resources = ResourceManager::new(4, 4, 4, None);
        let mut q = InMemoryQueue::new("build", vec![], AlwaysDispatch);
        q.enqueue(vec![1, 2]);
        q.dequeue_ready();
        q.harvest_jobs(&mut resources);

        q.job_completed(&1, JobStatus::Succeeded);
        q.job_completed(&2, JobStatus::Failed);

        assert_eq!(q.dequeue(), vec![1]);
        assert_eq!(q.failed_elements(), &[2]);
    }

    #[test]
    fn job_completed_for_unknown_element_is_ignored() {
        let mut q = InMemoryQueue::new("build", vec![], AlwaysDispatch);
        // Never enqueued/harvested; should warn and no-op, not panic.
        q.job_completed(&99, JobStatus::Succeeded);
        assert!(q.dequeue().is_empty());
        assert!(q.failed_elements().is_empty());
    }
}
