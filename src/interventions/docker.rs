use serde::Deserialize;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use super::ActionError;
use crate::duration;

#[derive(Debug, Clone, Deserialize)]
pub struct DockerActionConfig {
    pub container: String,
    /// Grace period handed to `docker restart -t`.
    #[serde(default, with = "duration::serde_opt")]
    pub timeout: Option<Duration>,
    #[serde(default = "default_binary")]
    pub binary: String,
}

fn default_binary() -> String {
    "docker".to_string()
}

impl DockerActionConfig {
    pub(crate) fn args(&self) -> Vec<String> {
        let grace = self.timeout.unwrap_or(Duration::from_secs(10)).as_secs();
        vec![
            "restart".to_string(),
            "-t".to_string(),
            grace.to_string(),
            self.container.clone(),
        ]
    }
}

pub(crate) async fn run(config: &DockerActionConfig) -> Result<(), ActionError> {
    if config.container.is_empty() {
        return Err(ActionError::InvalidConfiguration("docker action needs a container".to_string()));
    }
    let output = Command::new(&config.binary)
        .args(config.args())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| ActionError::Spawn {
            program: config.binary.clone(),
            source,
        })?;
    if output.status.success() {
        Ok(())
    } else {
        Err(ActionError::ExitStatus {
            program: config.binary.clone(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_restart_command() {
        let cfg: DockerActionConfig = serde_json::from_str(r#"{"container": "web", "timeout": "30s"}"#).unwrap();
        assert_eq!(cfg.args(), vec!["restart", "-t", "30", "web"]);
        assert_eq!(cfg.binary, "docker");
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let cfg = DockerActionConfig {
            container: "web".into(),
            timeout: None,
            binary: "/nonexistent/docker".into(),
        };
        assert!(matches!(run(&cfg).await, Err(ActionError::Spawn { .. })));
    }
}
