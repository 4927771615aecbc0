use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{debug, error, warn};

use super::PoolShared;
use crate::jobs::{FailureKind, Job, JobResult, TaskOutput};
use crate::ring::JobRing;

/// Runs one job, turning a panic inside the task into `failed{executor_error}`.
pub(crate) async fn execute(job: &Job) -> JobResult {
    let started = Instant::now();
    let output = AssertUnwindSafe(job.task.execute())
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| {
            let message = panic_message(panic.as_ref());
            error!(
                monitor = %job.monitor,
                pipeline = %job.pipeline,
                task = ?job.task,
                "Task panicked: {}", message
            );
            TaskOutput::failed(FailureKind::ExecutorError, format!("task panicked: {message}"))
        });
    JobResult::from_job(job, output, started.elapsed())
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

struct ResultBatch {
    results: Vec<JobResult>,
    last_flush: Instant,
}

impl ResultBatch {
    fn new(capacity: usize) -> Self {
        Self {
            results: Vec::with_capacity(capacity),
            last_flush: Instant::now(),
        }
    }

    fn due(&self, batch_size: usize, flush_interval: Duration) -> bool {
        self.results.len() >= batch_size
            || (!self.results.is_empty() && self.last_flush.elapsed() >= flush_interval)
    }
}

/// Worker loop. Exits when asked to retire, when the pool stops, or when a
/// draining pool finds its ring closed and empty.
pub(crate) async fn run(shared: Arc<PoolShared>, worker_id: usize) {
    let cfg = &shared.config;
    let mut batch = ResultBatch::new(cfg.result_batch.min(1024));
    let mut backoff = cfg.idle_backoff_min;
    debug!(pipeline = %shared.pipeline, worker_id, "Worker started.");

    loop {
        if shared.stop_now.load(Ordering::Acquire) {
            break;
        }
        if shared.try_retire() {
            flush(&shared, &mut batch).await;
            debug!(pipeline = %shared.pipeline, worker_id, "Worker retired after scale-down.");
            return;
        }
        if shared.paused.load(Ordering::Acquire) {
            flush(&shared, &mut batch).await;
            sleep(cfg.idle_backoff_min).await;
            continue;
        }

        let jobs = shared.ring.load().dequeue_batch(cfg.dequeue_batch);
        if jobs.is_empty() {
            flush(&shared, &mut batch).await;
            if shared.draining.load(Ordering::Acquire) && shared.ring.load().is_closed() {
                break;
            }
            sleep(backoff).await;
            backoff = (backoff * 2).min(cfg.idle_backoff_max);
            continue;
        }
        backoff = cfg.idle_backoff_min;

        shared.busy.fetch_add(1, Ordering::AcqRel);
        for job in jobs {
            if shared.stop_now.load(Ordering::Acquire) {
                shared.ring.load().record_dropped(1);
                continue;
            }
            let result = execute(&job).await;
            shared.record_execution(&result);
            batch.results.push(result);
            if batch.results.len() >= cfg.result_batch {
                flush(&shared, &mut batch).await;
            }
        }
        shared.busy.fetch_sub(1, Ordering::AcqRel);

        if batch.due(cfg.result_batch, cfg.flush_interval) {
            flush(&shared, &mut batch).await;
        }
    }

    flush(&shared, &mut batch).await;
    shared.running.fetch_sub(1, Ordering::AcqRel);
    debug!(pipeline = %shared.pipeline, worker_id, "Worker stopped.");
}

async fn flush(shared: &PoolShared, batch: &mut ResultBatch) {
    batch.last_flush = Instant::now();
    if batch.results.is_empty() {
        return;
    }
    let results = std::mem::take(&mut batch.results);
    let n = results.len();
    if let Err(e) = shared.results_tx.send(results).await {
        warn!(
            pipeline = %shared.pipeline,
            lost = n,
            "Result router is gone, discarding results: {}", e
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enums::Pipeline;
    use crate::jobs::testing::{PanicTask, noop};
    use crate::jobs::Outcome;
    use crate::monitor::MonitorId;

    #[tokio::test]
    async fn panic_becomes_executor_error() {
        let job = Job::new(MonitorId(3), Pipeline::Intervention, Arc::new(PanicTask));
        let result = execute(&job).await;
        assert_eq!(result.monitor, MonitorId(3));
        match result.outcome {
            Outcome::Failed { kind, message } => {
                assert_eq!(kind, FailureKind::ExecutorError);
                assert!(message.contains("probe blew up"));
            }
            Outcome::Ok => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn ok_task_reports_duration() {
        let job = Job::new(MonitorId(0), Pipeline::Pulse, noop());
        let result = execute(&job).await;
        assert!(result.is_ok());
        assert_eq!(result.pipeline, Pipeline::Pulse);
    }
}
