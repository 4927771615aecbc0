use serde::Deserialize;
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use super::ActionError;
use crate::duration;

/// Either an inline `content` run by `/bin/sh`, or an executable `path` with `args`.
#[derive(Debug, Clone, Deserialize)]
pub struct ScriptActionConfig {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, with = "duration::serde_opt")]
    pub timeout: Option<Duration>,
}

const SHELL: &str = "/bin/sh";

pub(crate) async fn run(config: &ScriptActionConfig, monitor: &str) -> Result<(), ActionError> {
    // Keeps the temp file alive until the child exits.
    let mut _script_file = None;
    let mut command = match (&config.content, &config.path) {
        (Some(content), _) => {
            let mut file = tempfile::Builder::new().prefix("cpra-action-").suffix(".sh").tempfile()?;
            file.write_all(content.as_bytes())?;
            file.flush()?;
            let mut command = Command::new(SHELL);
            command.arg(file.path());
            _script_file = Some(file);
            command
        }
        (None, Some(path)) => Command::new(path),
        (None, None) => {
            return Err(ActionError::InvalidConfiguration(
                "script action needs either 'content' or 'path'".to_string(),
            ));
        }
    };
    let program = config
        .path
        .as_ref()
        .filter(|_| config.content.is_none())
        .map_or_else(|| SHELL.to_string(), |p| p.display().to_string());

    let output = command
        .args(&config.args)
        .env("CPRA_MONITOR", monitor)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| ActionError::Spawn {
            program: program.clone(),
            source,
        })?;

    if output.status.success() {
        Ok(())
    } else {
        Err(ActionError::ExitStatus {
            program,
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}
