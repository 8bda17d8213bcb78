use std::fmt;
use std::process::ExitStatus;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info_span, warn, Instrument};

/// Which refresh the external update routine should perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateMode {
    /// Matches in progress or about to start.
    Live,
    /// Today's results plus the forward calendar window.
    Upcoming,
}

impl UpdateMode {
    pub fn as_str(self) -> &'static str {
        match self {
            UpdateMode::Live => "live",
            UpdateMode::Upcoming => "upcoming",
        }
    }
}

impl fmt::Display for UpdateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UpdateMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "live" => Ok(UpdateMode::Live),
            "upcoming" => Ok(UpdateMode::Upcoming),
            other => Err(format!("unknown update mode {other:?} (expected live or upcoming)")),
        }
    }
}

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed waiting on `{command}`: {source}")]
    Wait {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` exited with {status}")]
    NonZeroExit { command: String, status: ExitStatus },
    #[error("`{command}` did not finish within {timeout:?}")]
    TimedOut { command: String, timeout: Duration },
}

#[async_trait]
pub trait MatchUpdater: Send + Sync {
    async fn run(&self, mode: UpdateMode) -> Result<(), UpdateError>;
}

/// Runs the provider client as a child process: `<program> <args..> --mode <mode>`.
#[derive(Debug, Clone)]
pub struct CommandUpdater {
    program: String,
    args: Vec<String>,
    timeout: Option<Duration>,
}

impl CommandUpdater {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn command_line(&self, mode: UpdateMode) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 3);
        parts.push(self.program.as_str());
        parts.extend(self.args.iter().map(String::as_str));
        parts.push("--mode");
        parts.push(mode.as_str());
        parts.join(" ")
    }
}

#[async_trait]
impl MatchUpdater for CommandUpdater {
    async fn run(&self, mode: UpdateMode) -> Result<(), UpdateError> {
        let command = self.command_line(mode);
        let span = info_span!("external_update", %mode, command = %command);

        async {
            let mut child = Command::new(&self.program)
                .args(&self.args)
                .arg("--mode")
                .arg(mode.as_str())
                .kill_on_drop(true)
                .spawn()
                .map_err(|source| UpdateError::Spawn {
                    command: command.clone(),
                    source,
                })?;

            let waited = match self.timeout {
                Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                    Ok(waited) => waited,
                    Err(_elapsed) => {
                        if let Err(err) = child.kill().await {
                            warn!(error = %err, "failed to kill timed-out update");
                        }
                        return Err(UpdateError::TimedOut {
                            command: command.clone(),
                            timeout: limit,
                        });
                    }
                },
                None => child.wait().await,
            };

            let status = waited.map_err(|source| UpdateError::Wait {
                command: command.clone(),
                source,
            })?;
            if !status.success() {
                return Err(UpdateError::NonZeroExit {
                    command: command.clone(),
                    status,
                });
            }
            debug!("external update finished");
            Ok(())
        }
        .instrument(span)
        .await
    }
}
