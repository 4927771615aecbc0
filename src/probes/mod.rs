//! Pulse probes: one health check against one target.
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tracing::trace;

use crate::jobs::{FailureKind, Task, TaskOutput};

pub mod http;
pub mod icmp;
pub mod tcp;

pub use http::HttpProbeConfig;
pub use icmp::IcmpProbeConfig;
pub use tcp::TcpProbeConfig;

/// Pause between attempts of the same check.
pub const RETRY_PAUSE: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("check timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("unexpected status {0}")]
    Status(u16),
    #[error("insufficient privilege: {0}")]
    Privilege(String),
    #[error("invalid target: {0}")]
    InvalidTarget(String),
}

impl ProbeError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ProbeError::Timeout(_) => FailureKind::Timeout,
            ProbeError::Network(_) | ProbeError::InvalidTarget(_) => FailureKind::Network,
            ProbeError::Status(_) => FailureKind::Status,
            ProbeError::Privilege(_) => FailureKind::Privilege,
        }
    }

    fn status_code(&self) -> Option<u16> {
        match self {
            ProbeError::Status(code) => Some(*code),
            _ => None,
        }
    }
}

/// Kind-specific probe settings, selected by `pulse_check.type`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProbeConfig {
    Http(HttpProbeConfig),
    Tcp(TcpProbeConfig),
    Icmp(IcmpProbeConfig),
}

/// Ready-to-run pulse task. Built once per monitor and shared by every job.
#[derive(Debug)]
pub struct ProbeTask {
    config: ProbeConfig,
    timeout: Duration,
    retries: u32,
}

impl ProbeTask {
    pub fn new(config: ProbeConfig, timeout: Duration, retries: u32) -> Self {
        Self {
            config,
            timeout,
            retries,
        }
    }

    /// One attempt. Returns the HTTP status when there is one.
    async fn attempt(&self) -> Result<Option<u16>, ProbeError> {
        match &self.config {
            ProbeConfig::Http(cfg) => http::check(cfg, self.timeout).await.map(Some),
            ProbeConfig::Tcp(cfg) => tcp::check(cfg).await.map(|_| None),
            ProbeConfig::Icmp(cfg) => icmp::check(cfg, self.timeout).await.map(|_| None),
        }
    }

    fn target(&self) -> String {
        match &self.config {
            ProbeConfig::Http(cfg) => cfg.url.clone(),
            ProbeConfig::Tcp(cfg) => format!("{}:{}", cfg.host, cfg.port),
            ProbeConfig::Icmp(cfg) => cfg.host.clone(),
        }
    }
}

#[async_trait]
impl Task for ProbeTask {
    async fn execute(&self) -> TaskOutput {
        let mut last = ProbeError::Timeout(self.timeout);
        for attempt in 0..=self.retries {
            if attempt > 0 {
                sleep(RETRY_PAUSE).await;
            }
            match timeout(self.timeout, self.attempt()).await {
                Ok(Ok(status)) => {
                    let output = TaskOutput::ok();
                    return match status {
                        Some(code) => output.with_status(code),
                        None => output,
                    };
                }
                Ok(Err(e)) => last = e,
                Err(_) => last = ProbeError::Timeout(self.timeout),
            }
            trace!(target = %self.target(), attempt, "Probe attempt failed: {}", last);
        }
        let output = TaskOutput::failed(last.kind(), last.to_string());
        match last.status_code() {
            Some(code) => output.with_status(code),
            None => output,
        }
    }

    fn describe(&self) -> String {
        let kind = match &self.config {
            ProbeConfig::Http(_) => "http",
            ProbeConfig::Tcp(_) => "tcp",
            ProbeConfig::Icmp(_) => "icmp",
        };
        format!("{kind} probe {}", self.target())
    }
}
