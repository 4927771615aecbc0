use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::check_response;
use crate::duration;
use crate::enums::Color;
use crate::notifications::{Alert, ChannelConfig, NotificationSender, SenderError};
use crate::probes::http::HTTP_CLIENT;

pub const EVENTS_V2_URL: &str = "https://events.pagerduty.com/v2/enqueue";

#[derive(Debug, Clone, Deserialize)]
pub struct PagerDutyConfig {
    pub routing_key: String,
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(default, with = "duration::serde_opt")]
    pub timeout: Option<Duration>,
}

fn default_url() -> String {
    EVENTS_V2_URL.to_string()
}

#[derive(Serialize)]
struct Event<'a> {
    routing_key: &'a str,
    event_action: &'static str,
    dedup_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<Payload<'a>>,
}

#[derive(Serialize)]
struct Payload<'a> {
    summary: String,
    source: &'a str,
    severity: &'a str,
    timestamp: String,
    custom_details: CustomDetails<'a>,
}

#[derive(Serialize)]
struct CustomDetails<'a> {
    color: Color,
    status: &'a str,
    message: &'a str,
}

/// Triggers an incident for every color except green, which resolves it.
/// Both share a dedup key per monitor so PagerDuty folds them together.
pub struct PagerDutySender;

fn event<'a>(config: &'a PagerDutyConfig, alert: &'a Alert) -> Event<'a> {
    let dedup_key = format!("cpra-{}", alert.monitor);
    if alert.color == Color::Green {
        return Event {
            routing_key: &config.routing_key,
            event_action: "resolve",
            dedup_key,
            payload: None,
        };
    }
    Event {
        routing_key: &config.routing_key,
        event_action: "trigger",
        dedup_key,
        payload: Some(Payload {
            summary: alert.headline(),
            source: &alert.monitor,
            // PagerDuty accepts critical, error, warning and info.
            severity: &alert.severity,
            timestamp: alert.timestamp.to_rfc3339(),
            custom_details: CustomDetails {
                color: alert.color,
                status: &alert.status,
                message: &alert.message,
            },
        }),
    }
}

#[async_trait]
impl NotificationSender for PagerDutySender {
    async fn send(&self, config: &ChannelConfig, alert: &Alert) -> Result<(), SenderError> {
        let ChannelConfig::Pagerduty(pd) = config else {
            return Err(SenderError::InvalidConfiguration(
                "Expected PagerDuty config, but found a different type.".to_string(),
            ));
        };
        if pd.routing_key.is_empty() {
            return Err(SenderError::InvalidConfiguration("PagerDuty routing_key is empty".to_string()));
        }
        let response = HTTP_CLIENT.post(&pd.url).json(&event(pd, alert)).send().await?;
        check_response("PagerDuty", response).await
    }
}
