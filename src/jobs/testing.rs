//! Scripted tasks shared by unit tests across the crate.
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::{FailureKind, Task, TaskOutput};

#[derive(Debug, Default)]
pub(crate) struct NoopTask;

#[async_trait]
impl Task for NoopTask {
    async fn execute(&self) -> TaskOutput {
        TaskOutput::ok()
    }
}

pub(crate) fn noop() -> Arc<dyn Task> {
    Arc::new(NoopTask)
}

/// Plays back a queue of outcomes, then repeats `fallback` forever.
#[derive(Debug)]
pub(crate) struct ScriptedTask {
    script: Mutex<VecDeque<bool>>,
    fallback: AtomicBool,
    calls: AtomicUsize,
}

impl ScriptedTask {
    pub(crate) fn new(script: impl IntoIterator<Item = bool>, fallback: bool) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into_iter().collect()),
            fallback: AtomicBool::new(fallback),
            calls: AtomicUsize::new(0),
        })
    }

    pub(crate) fn always(ok: bool) -> Arc<Self> {
        Self::new([], ok)
    }

    pub(crate) fn set_fallback(&self, ok: bool) {
        self.fallback.store(ok, Ordering::SeqCst);
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Task for ScriptedTask {
    async fn execute(&self) -> TaskOutput {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let ok = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.load(Ordering::SeqCst));
        if ok {
            TaskOutput::ok()
        } else {
            TaskOutput::failed(FailureKind::Network, "scripted failure")
        }
    }
}

#[derive(Debug)]
pub(crate) struct PanicTask;

#[async_trait]
impl Task for PanicTask {
    async fn execute(&self) -> TaskOutput {
        panic!("probe blew up");
    }
}
