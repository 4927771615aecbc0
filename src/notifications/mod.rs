//! Alert delivery for code jobs.
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tracing::debug;

use crate::enums::Color;
use crate::jobs::{FailureKind, Task, TaskOutput};

pub mod alert;
pub mod senders;

pub use alert::Alert;
use senders::{
    EmailConfig, EmailSender, LogConfig, LogSender, PagerDutyConfig, PagerDutySender, SlackConfig, SlackSender,
    WebhookConfig, WebhookSender,
};

pub const DEFAULT_NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum SenderError {
    #[error("Notification timed out after {0:?}")]
    Timeout(Duration),
    #[error("Failed to send notification: {0}")]
    SendFailed(String),
    #[error("Invalid configuration for sender: {0}")]
    InvalidConfiguration(String),
    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),
    #[error("Templating error: {0}")]
    TemplatingError(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SenderError {
    pub fn kind(&self) -> FailureKind {
        match self {
            SenderError::Timeout(_) => FailureKind::Timeout,
            SenderError::NetworkError(e) if e.is_timeout() => FailureKind::Timeout,
            SenderError::NetworkError(_) => FailureKind::Network,
            _ => FailureKind::Notify,
        }
    }
}

/// Notifier settings, selected by `codes.<color>.notify`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChannelConfig {
    Log(LogConfig),
    Webhook(WebhookConfig),
    Email(EmailConfig),
    Slack(SlackConfig),
    Pagerduty(PagerDutyConfig),
}

impl ChannelConfig {
    fn timeout(&self) -> Duration {
        let configured = match self {
            ChannelConfig::Log(cfg) => cfg.timeout,
            ChannelConfig::Webhook(cfg) => cfg.timeout,
            ChannelConfig::Email(cfg) => cfg.timeout,
            ChannelConfig::Slack(cfg) => cfg.timeout,
            ChannelConfig::Pagerduty(cfg) => cfg.timeout,
        };
        configured.unwrap_or(DEFAULT_NOTIFY_TIMEOUT)
    }
}

/// A channel type that can deliver an [`Alert`].
#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send(&self, config: &ChannelConfig, alert: &Alert) -> Result<(), SenderError>;
}

static LOG: LogSender = LogSender;
static WEBHOOK: WebhookSender = WebhookSender;
static EMAIL: EmailSender = EmailSender;
static SLACK: SlackSender = SlackSender;
static PAGERDUTY: PagerDutySender = PagerDutySender;

pub fn sender_for(config: &ChannelConfig) -> &'static dyn NotificationSender {
    match config {
        ChannelConfig::Log(_) => &LOG,
        ChannelConfig::Webhook(_) => &WEBHOOK,
        ChannelConfig::Email(_) => &EMAIL,
        ChannelConfig::Slack(_) => &SLACK,
        ChannelConfig::Pagerduty(_) => &PAGERDUTY,
    }
}

/// Code task for one (monitor, color) pair.
#[derive(Debug)]
pub struct NotifyTask {
    monitor: Arc<str>,
    color: Color,
    channel: ChannelConfig,
}

impl NotifyTask {
    pub fn new(monitor: Arc<str>, color: Color, channel: ChannelConfig) -> Self {
        Self {
            monitor,
            color,
            channel,
        }
    }
}

#[async_trait]
impl Task for NotifyTask {
    async fn execute(&self) -> TaskOutput {
        let alert = Alert::new(&self.monitor, self.color, Utc::now());
        let limit = self.channel.timeout();
        let sent = match timeout(limit, sender_for(&self.channel).send(&self.channel, &alert)).await {
            Ok(result) => result,
            Err(_) => Err(SenderError::Timeout(limit)),
        };
        match sent {
            Ok(()) => {
                debug!(monitor = %self.monitor, color = %self.color, alert_id = %alert.id, "Alert sent.");
                TaskOutput::ok()
            }
            Err(e) => TaskOutput::failed(e.kind(), e.to_string()),
        }
    }

    fn describe(&self) -> String {
        let channel = match &self.channel {
            ChannelConfig::Log(_) => "log",
            ChannelConfig::Webhook(_) => "webhook",
            ChannelConfig::Email(_) => "email",
            ChannelConfig::Slack(_) => "slack",
            ChannelConfig::Pagerduty(_) => "pagerduty",
        };
        format!("{} {channel} alert for {}", self.color, self.monitor)
    }
}
