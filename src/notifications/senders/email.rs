use async_trait::async_trait;
use serde::Deserialize;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::duration;
use crate::notifications::{Alert, ChannelConfig, NotificationSender, SenderError};

#[derive(Debug, Clone, Deserialize)]
pub struct EmailConfig {
    pub to: Vec<String>,
    #[serde(default = "default_from")]
    pub from: String,
    /// Any sendmail-compatible binary that reads a full message on stdin.
    #[serde(default = "default_sendmail")]
    pub sendmail: String,
    #[serde(default = "default_args")]
    pub args: Vec<String>,
    #[serde(default, with = "duration::serde_opt")]
    pub timeout: Option<Duration>,
}

fn default_from() -> String {
    "cpra@localhost".to_string()
}

fn default_sendmail() -> String {
    "/usr/sbin/sendmail".to_string()
}

fn default_args() -> Vec<String> {
    vec!["-t".to_string(), "-i".to_string()]
}

pub struct EmailSender;

pub(crate) fn render_message(config: &EmailConfig, alert: &Alert) -> String {
    format!(
        "From: {from}\r\nTo: {to}\r\nSubject: {subject}\r\nDate: {date}\r\nMessage-ID: <{id}@cpra>\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\r\n{message}\r\n\r\nMonitor: {monitor}\r\nStatus: {status}\r\n\
         Severity: {severity}\r\nTime: {time}\r\n",
        from = config.from,
        to = config.to.join(", "),
        subject = alert.headline(),
        date = alert.timestamp.to_rfc2822(),
        id = alert.id,
        message = alert.message,
        monitor = alert.monitor,
        status = alert.status,
        severity = alert.severity,
        time = alert.timestamp.to_rfc3339(),
    )
}

#[async_trait]
impl NotificationSender for EmailSender {
    async fn send(&self, config: &ChannelConfig, alert: &Alert) -> Result<(), SenderError> {
        let ChannelConfig::Email(email) = config else {
            return Err(SenderError::InvalidConfiguration(
                "Expected Email config, but found a different type.".to_string(),
            ));
        };
        if email.to.is_empty() {
            return Err(SenderError::InvalidConfiguration("Email needs at least one recipient".to_string()));
        }

        let mut child = Command::new(&email.sendmail)
            .args(&email.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(render_message(email, alert).as_bytes()).await?;
            stdin.shutdown().await?;
        }
        let output = child.wait_with_output().await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(SenderError::SendFailed(format!(
                "{} exited with {}: {}",
                email.sendmail,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enums::Color;
    use chrono::Utc;

    #[test]
    fn message_has_headers_and_body() {
        let config: EmailConfig = serde_json::from_str(r#"{"to": ["ops@example.com", "sre@example.com"]}"#).unwrap();
        let alert = Alert::new("api", Color::Red, Utc::now());
        let message = render_message(&config, &alert);
        assert!(message.starts_with("From: cpra@localhost\r\nTo: ops@example.com, sre@example.com\r\n"));
        assert!(message.contains("Subject: [CRITICAL ALERT] api: FAILED\r\n"));
        assert!(message.contains("\r\n\r\nMonitor 'api' is down"));
    }

    #[tokio::test]
    async fn pipes_message_to_sendmail_binary() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("mail.txt");
        let config = ChannelConfig::Email(EmailConfig {
            to: vec!["ops@example.com".into()],
            from: default_from(),
            sendmail: "/bin/sh".into(),
            args: vec!["-c".into(), format!("cat > {}", out.display())],
            timeout: None,
        });
        let alert = Alert::new("db", Color::Green, Utc::now());
        EmailSender.send(&config, &alert).await.unwrap();
        let mail = std::fs::read_to_string(&out).unwrap();
        assert!(mail.contains("Subject: [RECOVERY NOTICE] db: RECOVERED"));
    }
}
