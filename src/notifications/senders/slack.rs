use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::check_response;
use crate::duration;
use crate::notifications::alert::template;
use crate::notifications::{Alert, ChannelConfig, NotificationSender, SenderError};
use crate::probes::http::HTTP_CLIENT;

#[derive(Debug, Clone, Deserialize)]
pub struct SlackConfig {
    /// Incoming-webhook URL.
    #[serde(alias = "webhook_url")]
    pub hook: String,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default, with = "duration::serde_opt")]
    pub timeout: Option<Duration>,
}

#[derive(Serialize)]
struct SlackMessage<'a> {
    text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    channel: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    username: Option<&'a str>,
    attachments: [Attachment<'a>; 1],
}

#[derive(Serialize)]
struct Attachment<'a> {
    color: &'static str,
    title: &'a str,
    text: &'a str,
    footer: &'static str,
    ts: i64,
}

pub struct SlackSender;

fn message<'a>(config: &'a SlackConfig, alert: &'a Alert) -> SlackMessage<'a> {
    SlackMessage {
        text: alert.headline(),
        channel: config.channel.as_deref(),
        username: config.username.as_deref(),
        attachments: [Attachment {
            color: template(alert.color).hex,
            title: &alert.title,
            text: &alert.message,
            footer: "cpra",
            ts: alert.timestamp.timestamp(),
        }],
    }
}

#[async_trait]
impl NotificationSender for SlackSender {
    async fn send(&self, config: &ChannelConfig, alert: &Alert) -> Result<(), SenderError> {
        let ChannelConfig::Slack(slack) = config else {
            return Err(SenderError::InvalidConfiguration(
                "Expected Slack config, but found a different type.".to_string(),
            ));
        };
        let response = HTTP_CLIENT.post(&slack.hook).json(&message(slack, alert)).send().await?;
        check_response("Slack", response).await
    }
}
