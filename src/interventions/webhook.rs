use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use super::ActionError;
use crate::duration;
use crate::probes::http::{HTTP_CLIENT, header_map, parse_method};

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookActionConfig {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default, with = "duration::serde_opt")]
    pub timeout: Option<Duration>,
}

fn default_method() -> String {
    "POST".to_string()
}

/// Calls the remediation endpoint. Any non-2xx status is a failed attempt.
pub(crate) async fn run(config: &WebhookActionConfig, monitor: &str) -> Result<u16, ActionError> {
    let method = parse_method(&config.method).map_err(ActionError::InvalidConfiguration)?;
    let headers = header_map(&config.headers).map_err(ActionError::InvalidConfiguration)?;
    let mut request = HTTP_CLIENT
        .request(method, &config.url)
        .headers(headers)
        .header("X-CPRA-Monitor", monitor);
    if let Some(body) = &config.body {
        request = request.body(body.clone());
    }
    let response = request.send().await?;
    let status = response.status();
    if status.is_success() {
        Ok(status.as_u16())
    } else {
        Err(ActionError::Status(status.as_u16()))
    }
}
