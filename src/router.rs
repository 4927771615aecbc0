//! Fans worker result batches out to one bounded channel per pipeline.
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::enums::{Pipeline, Pipelines};
use crate::jobs::JobResult;

pub const DEFAULT_RESULT_BUFFER: usize = 2048;

#[derive(Debug, Default)]
pub struct RouterStats {
    routed: Pipelines<AtomicU64>,
    dropped: Pipelines<AtomicU64>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct RouterSnapshot {
    pub routed: Pipelines<u64>,
    pub dropped: Pipelines<u64>,
}

impl RouterStats {
    pub fn snapshot(&self) -> RouterSnapshot {
        RouterSnapshot {
            routed: self.routed.map(|_, c| c.load(Ordering::Relaxed)),
            dropped: self.dropped.map(|_, c| c.load(Ordering::Relaxed)),
        }
    }

    pub fn dropped(&self, pipeline: Pipeline) -> u64 {
        self.dropped[pipeline].load(Ordering::Relaxed)
    }
}

/// Receiving ends handed to the controller.
#[derive(Debug)]
pub struct ResultChannels {
    pub pulse: mpsc::Receiver<JobResult>,
    pub intervention: mpsc::Receiver<JobResult>,
    pub code: mpsc::Receiver<JobResult>,
}

impl ResultChannels {
    pub fn get_mut(&mut self, pipeline: Pipeline) -> &mut mpsc::Receiver<JobResult> {
        match pipeline {
            Pipeline::Pulse => &mut self.pulse,
            Pipeline::Intervention => &mut self.intervention,
            Pipeline::Code => &mut self.code,
        }
    }
}

pub struct ResultRouter {
    input: mpsc::Sender<Vec<JobResult>>,
    stats: Arc<RouterStats>,
    handle: JoinHandle<()>,
}

impl ResultRouter {
    /// Starts the routing task. Each output channel holds `buffer` results; when
    /// one is full the newest result is dropped and counted rather than blocking
    /// the workers.
    pub fn spawn(buffer: usize) -> (Self, ResultChannels) {
        let buffer = buffer.max(1);
        let (input, mut rx) = mpsc::channel::<Vec<JobResult>>(buffer);
        let (pulse_tx, pulse) = mpsc::channel(buffer);
        let (intervention_tx, intervention) = mpsc::channel(buffer);
        let (code_tx, code) = mpsc::channel(buffer);
        let outputs = Pipelines {
            pulse: pulse_tx,
            intervention: intervention_tx,
            code: code_tx,
        };
        let stats = Arc::new(RouterStats::default());
        let task_stats = Arc::clone(&stats);

        let handle = tokio::spawn(async move {
            debug!("Result router started.");
            while let Some(batch) = rx.recv().await {
                for result in batch {
                    route(&outputs, &task_stats, result);
                }
            }
            info!("Result router stopped: all workers are gone.");
        });

        (
            Self {
                input,
                stats,
                handle,
            },
            ResultChannels {
                pulse,
                intervention,
                code,
            },
        )
    }

    /// Sender cloned into every worker pool.
    pub fn sender(&self) -> mpsc::Sender<Vec<JobResult>> {
        self.input.clone()
    }

    pub fn stats(&self) -> Arc<RouterStats> {
        Arc::clone(&self.stats)
    }

    /// Drops the router's own sender and waits for the task to drain. The task
    /// finishes once every pool has dropped its sender too.
    pub async fn join(self) {
        drop(self.input);
        if let Err(e) = self.handle.await {
            warn!("Result router task failed: {}", e);
        }
    }
}

fn route(outputs: &Pipelines<mpsc::Sender<JobResult>>, stats: &RouterStats, result: JobResult) {
    let pipeline = result.pipeline;
    match outputs[pipeline].try_send(result) {
        Ok(()) => {
            stats.routed[pipeline].fetch_add(1, Ordering::Relaxed);
        }
        Err(TrySendError::Full(dropped)) => {
            let total = stats.dropped[pipeline].fetch_add(1, Ordering::Relaxed) + 1;
            if total.is_power_of_two() {
                warn!(
                    pipeline = %pipeline,
                    monitor = %dropped.monitor,
                    dropped_total = total,
                    "Result channel full, dropping newest result."
                );
            }
        }
        Err(TrySendError::Closed(_)) => {
            stats.dropped[pipeline].fetch_add(1, Ordering::Relaxed);
            debug!(pipeline = %pipeline, "Result channel closed, discarding result.");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{Job, TaskOutput};
    use crate::jobs::testing::noop;
    use crate::monitor::MonitorId;
    use std::time::Duration;

    fn result(pipeline: Pipeline, id: u32) -> JobResult {
        let job = Job::new(MonitorId(id), pipeline, noop());
        JobResult::from_job(&job, TaskOutput::ok(), Duration::ZERO)
    }

    #[tokio::test]
    async fn splits_batches_by_pipeline() {
        let (router, mut channels) = ResultRouter::spawn(16);
        let tx = router.sender();
        tx.send(vec![
            result(Pipeline::Pulse, 1),
            result(Pipeline::Code, 2),
            result(Pipeline::Pulse, 3),
            result(Pipeline::Intervention, 4),
        ])
        .await
        .unwrap();
        drop(tx);
        let stats = router.stats();
        router.join().await;

        assert_eq!(channels.pulse.recv().await.unwrap().monitor, MonitorId(1));
        assert_eq!(channels.pulse.recv().await.unwrap().monitor, MonitorId(3));
        assert_eq!(channels.intervention.recv().await.unwrap().monitor, MonitorId(4));
        assert_eq!(channels.get_mut(Pipeline::Code).recv().await.unwrap().monitor, MonitorId(2));
        let snap = stats.snapshot();
        assert_eq!(snap.routed.pulse, 2);
        assert_eq!(snap.dropped, Pipelines::default());
    }

    #[tokio::test]
    async fn full_channel_drops_newest() {
        let (router, mut channels) = ResultRouter::spawn(2);
        let tx = router.sender();
        tx.send((0..5).map(|i| result(Pipeline::Pulse, i)).collect())
            .await
            .unwrap();
        drop(tx);
        let stats = router.stats();
        router.join().await;

        assert_eq!(stats.dropped(Pipeline::Pulse), 3);
        assert_eq!(channels.pulse.recv().await.unwrap().monitor, MonitorId(0));
        assert_eq!(channels.pulse.recv().await.unwrap().monitor, MonitorId(1));
        assert!(channels.pulse.try_recv().is_err());
    }
}
