//! Job and result records that flow between the controller and the worker pools.
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::enums::{Color, Pipeline};
use crate::monitor::MonitorId;

pub mod templates;
#[cfg(test)]
pub(crate) mod testing;

/// Something a worker can run: a probe, a remediation action or a notifier.
///
/// Implementations carry every piece of configuration they need, so a worker
/// never has to look at the monitor store. A task that can hang must enforce
/// its own timeout and report [`FailureKind::Timeout`].
#[async_trait]
pub trait Task: Send + Sync + fmt::Debug {
    async fn execute(&self) -> TaskOutput;

    /// Short human-readable label for logs.
    fn describe(&self) -> String {
        format!("{self:?}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    Network,
    Status,
    Privilege,
    Action,
    Notify,
    ExecutorError,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Timeout => "timeout",
            FailureKind::Network => "network",
            FailureKind::Status => "status",
            FailureKind::Privilege => "privilege",
            FailureKind::Action => "action",
            FailureKind::Notify => "notify",
            FailureKind::ExecutorError => "executor_error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    Failed { kind: FailureKind, message: String },
}

impl Outcome {
    pub fn failed(kind: FailureKind, message: impl Into<String>) -> Self {
        Outcome::Failed {
            kind,
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Ok)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOutput {
    pub outcome: Outcome,
    pub status_code: Option<u16>,
}

impl TaskOutput {
    pub fn ok() -> Self {
        Self {
            outcome: Outcome::Ok,
            status_code: None,
        }
    }

    pub fn failed(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::failed(kind, message),
            status_code: None,
        }
    }

    pub fn with_status(mut self, code: u16) -> Self {
        self.status_code = Some(code);
        self
    }
}

/// A unit of queued work. Cheap to build: the task is a shared template.
#[derive(Debug, Clone)]
pub struct Job {
    pub monitor: MonitorId,
    pub pipeline: Pipeline,
    pub color: Option<Color>,
    pub task: Arc<dyn Task>,
    /// The monitor's dispatch generation for `pipeline` when this job was sent.
    pub generation: u32,
    pub enqueued_at: Option<Instant>,
    pub started_at: Option<Instant>,
}

impl Job {
    pub fn new(monitor: MonitorId, pipeline: Pipeline, task: Arc<dyn Task>) -> Self {
        Self {
            monitor,
            pipeline,
            color: None,
            task,
            generation: 0,
            enqueued_at: None,
            started_at: None,
        }
    }

    pub fn code(monitor: MonitorId, color: Color, task: Arc<dyn Task>) -> Self {
        Self {
            color: Some(color),
            ..Self::new(monitor, Pipeline::Code, task)
        }
    }

    pub fn with_generation(mut self, generation: u32) -> Self {
        self.generation = generation;
        self
    }

    /// Time spent in the ring, once both timestamps are known.
    pub fn queue_wait(&self) -> Option<Duration> {
        match (self.enqueued_at, self.started_at) {
            (Some(enq), Some(start)) => Some(start.saturating_duration_since(enq)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobResult {
    pub monitor: MonitorId,
    pub pipeline: Pipeline,
    pub color: Option<Color>,
    pub generation: u32,
    pub outcome: Outcome,
    pub status_code: Option<u16>,
    pub duration: Duration,
    pub queue_wait: Option<Duration>,
}

impl JobResult {
    pub fn from_job(job: &Job, output: TaskOutput, duration: Duration) -> Self {
        Self {
            monitor: job.monitor,
            pipeline: job.pipeline,
            color: job.color,
            generation: job.generation,
            outcome: output.outcome,
            status_code: output.status_code,
            duration,
            queue_wait: job.queue_wait(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }
}
