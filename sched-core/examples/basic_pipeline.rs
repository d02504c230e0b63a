//! Minimal three-stage pipeline example.
//!
//! Run:
//!   cargo run -p sched-core --example basic_pipeline

use std::sync::Arc;

use sched_core::cache::ArtifactCache;
use sched_core::job::{FnJob, JobOutcome};
use sched_core::queue::{Admission, InMemoryQueue, Queue, QueuePolicy};
use sched_core::resource::ResourceKind;
use sched_core::scheduler::{SchedStatus, Scheduler, SchedulerConfig};

/// An `ArtifactCache` that never reports itself full, so this example
/// never triggers cache maintenance.
struct NoCache;

impl ArtifactCache for NoCache {
    fn full(&self) -> bool {
        false
    }
    fn compute_size(&self) -> sched_core::Result<u64> {
        Ok(0)
    }
    fn cleanup(&self) -> sched_core::Result<u64> {
        Ok(0)
    }
}

/// Dispatches a job that just sleeps briefly and reports success, for
/// every element it is handed.
struct EchoStage {
    action: &'static str,
}

impl QueuePolicy<u32> for EchoStage {
    fn admit(&self, element: &u32) -> Admission {
        let action = self.action;
        let display = format!("{action}/{element}");
        Admission::Dispatch(Arc::new(FnJob::new(action, display, Vec::new(), move |_token, _gate| {
            Box::pin(async move {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                JobOutcome::succeeded()
            })
        })))
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let fetch: Box<dyn Queue<Element = u32>> =
        Box::new(InMemoryQueue::new("fetch", vec![ResourceKind::Download], EchoStage { action: "fetch" }));
    let build: Box<dyn Queue<Element = u32>> =
        Box::new(InMemoryQueue::new("build", vec![ResourceKind::Process], EchoStage { action: "build" }));
    let push: Box<dyn Queue<Element = u32>> =
        Box::new(InMemoryQueue::new("push", vec![ResourceKind::Upload], EchoStage { action: "push" }));

    let config = SchedulerConfig {
        builders: 2,
        fetchers: 2,
        pushers: 2,
        job_start_callback: Some(Box::new(|name| tracing::info!(job = name, "starting"))),
        job_complete_callback: Some(Box::new(|name, status| tracing::info!(job = name, ?status, "finished"))),
        ..SchedulerConfig::default()
    };

    let (scheduler, _handle) = Scheduler::new(vec![fetch, build, push], Arc::new(NoCache), config);
    let elements: Vec<u32> = (1..=8).collect();
    let status = scheduler.run(elements).await;

    match status {
        SchedStatus::Success => println!("all elements completed successfully"),
        SchedStatus::Error => println!("at least one element failed"),
        SchedStatus::Terminated => println!("run was terminated"),
    }
}
