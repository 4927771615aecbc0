//! Remediation actions run when a monitor turns unhealthy.
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tracing::debug;

use crate::jobs::{FailureKind, Task, TaskOutput};

pub mod docker;
pub mod script;
pub mod webhook;

pub use docker::DockerActionConfig;
pub use script::ScriptActionConfig;
pub use webhook::WebhookActionConfig;

pub const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum ActionError {
    #[error("action timed out after {0:?}")]
    Timeout(Duration),
    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("'{program}' exited with {status}: {stderr}")]
    ExitStatus {
        program: String,
        status: String,
        stderr: String,
    },
    #[error("webhook returned status {0}")]
    Status(u16),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid action configuration: {0}")]
    InvalidConfiguration(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ActionError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ActionError::Timeout(_) => FailureKind::Timeout,
            ActionError::Request(_) => FailureKind::Network,
            _ => FailureKind::Action,
        }
    }
}

/// Action settings, selected by `intervention.action`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ActionConfig {
    Script(ScriptActionConfig),
    Docker(DockerActionConfig),
    Webhook(WebhookActionConfig),
}

impl ActionConfig {
    fn timeout(&self) -> Duration {
        let configured = match self {
            ActionConfig::Script(cfg) => cfg.timeout,
            ActionConfig::Docker(cfg) => cfg.timeout.map(|t| t + Duration::from_secs(10)),
            ActionConfig::Webhook(cfg) => cfg.timeout,
        };
        configured.unwrap_or(DEFAULT_ACTION_TIMEOUT)
    }
}

#[derive(Debug)]
pub struct ActionTask {
    monitor: String,
    config: ActionConfig,
}

impl ActionTask {
    pub fn new(monitor: impl Into<String>, config: ActionConfig) -> Self {
        Self {
            monitor: monitor.into(),
            config,
        }
    }

    async fn run(&self) -> Result<Option<u16>, ActionError> {
        match &self.config {
            ActionConfig::Script(cfg) => script::run(cfg, &self.monitor).await.map(|_| None),
            ActionConfig::Docker(cfg) => docker::run(cfg).await.map(|_| None),
            ActionConfig::Webhook(cfg) => webhook::run(cfg, &self.monitor).await.map(Some),
        }
    }
}

#[async_trait]
impl Task for ActionTask {
    async fn execute(&self) -> TaskOutput {
        let limit = self.config.timeout();
        let result = match timeout(limit, self.run()).await {
            Ok(result) => result,
            Err(_) => Err(ActionError::Timeout(limit)),
        };
        match result {
            Ok(status) => {
                debug!(monitor = %self.monitor, "Intervention action completed.");
                let output = TaskOutput::ok();
                match status {
                    Some(code) => output.with_status(code),
                    None => output,
                }
            }
            Err(e) => TaskOutput::failed(e.kind(), e.to_string()),
        }
    }

    fn describe(&self) -> String {
        match &self.config {
            ActionConfig::Script(_) => format!("script action for {}", self.monitor),
            ActionConfig::Docker(cfg) => format!("docker restart {}", cfg.container),
            ActionConfig::Webhook(cfg) => format!("webhook action {}", cfg.url),
        }
    }
}
