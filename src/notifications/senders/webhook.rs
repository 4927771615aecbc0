use async_trait::async_trait;
use reqwest::header;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tera::{Context, Tera};

use super::check_response;
use crate::duration;
use crate::notifications::{Alert, ChannelConfig, NotificationSender, SenderError};
use crate::probes::http::{HTTP_CLIENT, header_map, parse_method};

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    /// Tera template for the request body; the alert as JSON when absent.
    #[serde(default)]
    pub body_template: Option<String>,
    /// Upper bound for one delivery; the notifier default when absent.
    #[serde(default, with = "duration::serde_opt")]
    pub timeout: Option<Duration>,
}

fn default_method() -> String {
    "POST".to_string()
}

/// Pushes alerts to a custom HTTP endpoint.
pub struct WebhookSender;

pub(crate) fn render_body(template: Option<&str>, alert: &Alert) -> Result<String, SenderError> {
    let Some(template) = template else {
        return serde_json::to_string(alert).map_err(|e| SenderError::TemplatingError(e.to_string()));
    };
    let mut context = Context::new();
    for (key, value) in alert.context() {
        context.insert(key, &value);
    }
    Tera::one_off(template, &context, true).map_err(|e| SenderError::TemplatingError(e.to_string()))
}

#[async_trait]
impl NotificationSender for WebhookSender {
    async fn send(&self, config: &ChannelConfig, alert: &Alert) -> Result<(), SenderError> {
        let ChannelConfig::Webhook(WebhookConfig {
            url,
            method,
            headers,
            body_template,
            ..
        }) = config
        else {
            return Err(SenderError::InvalidConfiguration(
                "Expected Webhook config, but found a different type.".to_string(),
            ));
        };

        let http_method = parse_method(method).map_err(SenderError::InvalidConfiguration)?;
        let mut request = HTTP_CLIENT.request(http_method.clone(), url);
        if let Some(h) = headers {
            request = request.headers(header_map(h).map_err(SenderError::InvalidConfiguration)?);
        }
        if http_method != reqwest::Method::GET {
            let body = render_body(body_template.as_deref(), alert)?;
            request = request.header(header::CONTENT_TYPE, "application/json").body(body);
        }

        let response = request.send().await?;
        check_response("Webhook", response).await
    }
}
