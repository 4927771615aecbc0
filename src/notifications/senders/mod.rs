//! One sender per channel type.
pub mod email;
pub mod log;
pub mod pagerduty;
pub mod slack;
pub mod webhook;

pub use email::{EmailConfig, EmailSender};
pub use log::{LogConfig, LogSender};
pub use pagerduty::{PagerDutyConfig, PagerDutySender};
pub use slack::{SlackConfig, SlackSender};
pub use webhook::{WebhookConfig, WebhookSender};

use super::SenderError;

/// Turns a non-2xx response into `SendFailed`, keeping the body for the log.
pub(crate) async fn check_response(service: &str, response: reqwest::Response) -> Result<(), SenderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Failed to read error body".to_string());
    Err(SenderError::SendFailed(format!(
        "{service} returned non-success status: {status}. Body: {body}"
    )))
}
