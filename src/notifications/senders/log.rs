use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

use crate::duration;
use crate::notifications::{Alert, ChannelConfig, NotificationSender, SenderError};

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    pub file: PathBuf,
    #[serde(default, with = "duration::serde_opt")]
    pub timeout: Option<Duration>,
}

/// Appends one JSON object per alert to a file.
pub struct LogSender;

#[async_trait]
impl NotificationSender for LogSender {
    async fn send(&self, config: &ChannelConfig, alert: &Alert) -> Result<(), SenderError> {
        let ChannelConfig::Log(LogConfig { file, .. }) = config else {
            return Err(SenderError::InvalidConfiguration(
                "Expected Log config, but found a different type.".to_string(),
            ));
        };
        let mut line = serde_json::to_vec(alert).map_err(|e| SenderError::SendFailed(e.to_string()))?;
        line.push(b'\n');

        if let Some(parent) = file.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut handle = OpenOptions::new().create(true).append(true).open(file).await?;
        handle.write_all(&line).await?;
        handle.flush().await?;
        Ok(())
    }
}
