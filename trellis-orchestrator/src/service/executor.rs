//! Local container execution
//!
//! Narrow contract for the local container driver: run one step to
//! completion, stream its output into the caller's log buffer, honor its
//! timeout, and guarantee the container is removed afterwards. One
//! process-wide driver handle lives in the AppContext; routing decisions
//! never instantiate their own.

use anyhow::{Context as AnyhowContext, Result};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};
use trellis_core::domain::execution::EXIT_CODE_TIMEOUT;
use trellis_core::domain::job::{ExecutionOutcome, StepConfig};

use crate::service::execution::LogBuffer;

/// The local container runtime, as the orchestrator sees it
#[async_trait]
pub trait ContainerDriver: Send + Sync {
    /// Run one step to completion, appending stdout lines to `logs` as
    /// they arrive
    ///
    /// Must honor `config.timeout_seconds` and remove the container on
    /// every path, including timeout.
    async fn execute_step(
        &self,
        execution_key: &str,
        config: &StepConfig,
        logs: &LogBuffer,
    ) -> Result<ExecutionOutcome>;

    /// The container name this driver will use for an execution key;
    /// recorded on the execution so cancellation can find the container
    fn container_name(&self, execution_key: &str) -> String;

    /// Kill and remove a step's container
    async fn terminate(&self, container_name: &str) -> Result<()>;
}

/// Forward lines from a child stream into the shared log buffer
pub(crate) async fn pump_lines<R: AsyncRead + Unpin>(reader: R, logs: &LogBuffer) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        logs.lock().unwrap().push(line);
    }
}

/// Podman-backed driver
pub struct PodmanDriver {
    workspace_base: String,
}

impl PodmanDriver {
    pub fn new(workspace_base: impl Into<String>) -> Self {
        Self {
            workspace_base: workspace_base.into(),
        }
    }

    async fn remove_container(name: &str) {
        let result = Command::new("podman")
            .arg("rm")
            .arg("-f")
            .arg(name)
            .output()
            .await;
        match result {
            Ok(output) if output.status.success() => {
                debug!("Container {} removed", name)
            }
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                warn!("Failed to remove container {}: {}", name, stderr.trim());
            }
            Err(e) => warn!("Failed to remove container {}: {}", name, e),
        }
    }
}

#[async_trait]
impl ContainerDriver for PodmanDriver {
    async fn execute_step(
        &self,
        execution_key: &str,
        config: &StepConfig,
        logs: &LogBuffer,
    ) -> Result<ExecutionOutcome> {
        let name = self.container_name(execution_key);
        let workspace = format!("{}/{}", self.workspace_base, execution_key.replace(':', "-"));
        tokio::fs::create_dir_all(&workspace)
            .await
            .context("Failed to create workspace directory")?;

        info!("Starting container {} (image {})", name, config.image);

        let mut command = Command::new("podman");
        command
            .arg("run")
            .arg("--name")
            .arg(&name)
            .arg("-v")
            .arg(format!("{}:/workspace", workspace))
            .arg("-w")
            .arg("/workspace");
        for (key, value) in &config.env {
            command.arg("-e").arg(format!("{}={}", key, value));
        }
        command.arg(&config.image);
        if let Some(cmd) = &config.command {
            command.arg("/bin/sh").arg("-c").arg(cmd);
        }

        let mut child = command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("Failed to spawn podman run")?;

        let stdout = child.stdout.take();
        let mut stderr = child.stderr.take();

        let timeout = Duration::from_secs(config.timeout_seconds.unwrap_or(3600));
        let waited = tokio::time::timeout(timeout, async {
            let pump = async {
                if let Some(out) = stdout {
                    pump_lines(out, logs).await;
                }
            };
            let (status, _) = tokio::join!(child.wait(), pump);
            status
        })
        .await;

        let outcome = match waited {
            Ok(status) => {
                let status = status.context("Failed to execute podman run")?;
                let exit_code = status.code().unwrap_or(-1);

                let mut stderr_text = String::new();
                if let Some(err) = stderr.as_mut() {
                    let _ = err.read_to_string(&mut stderr_text).await;
                }

                debug!("Container {} exited with code {}", name, exit_code);
                ExecutionOutcome {
                    success: exit_code == 0,
                    exit_code,
                    error_message: (!status.success())
                        .then(|| stderr_text.trim().to_string())
                        .filter(|s| !s.is_empty()),
                }
            }
            Err(_) => {
                warn!("Container {} exceeded {:?}, killing", name, timeout);
                let _ = child.start_kill();
                ExecutionOutcome {
                    success: false,
                    exit_code: EXIT_CODE_TIMEOUT,
                    error_message: Some(format!("step timed out after {:?}", timeout)),
                }
            }
        };

        // Removal runs on every path, including timeout
        Self::remove_container(&name).await;

        Ok(outcome)
    }

    fn container_name(&self, execution_key: &str) -> String {
        // Keys contain colons, which container names cannot
        format!("trellis-{}", execution_key.replace(':', "-"))
    }

    async fn terminate(&self, container_name: &str) -> Result<()> {
        info!("Terminating container {}", container_name);
        Self::remove_container(container_name).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_container_name_has_no_colons() {
        let driver = PodmanDriver::new("/tmp/ws");
        let name = driver.container_name("run-1:3:2");
        assert_eq!(name, "trellis-run-1-3-2");
        assert!(!name.contains(':'));
    }

    #[tokio::test]
    async fn test_pump_lines_fills_the_buffer() {
        let logs: LogBuffer = Arc::new(Mutex::new(Vec::new()));
        let output = &b"checking out main\ncompiling\ntests passed\n"[..];

        pump_lines(output, &logs).await;

        let collected = logs.lock().unwrap().clone();
        assert_eq!(collected, vec!["checking out main", "compiling", "tests passed"]);
    }

    #[tokio::test]
    async fn test_pump_lines_handles_missing_trailing_newline() {
        let logs: LogBuffer = Arc::new(Mutex::new(Vec::new()));
        pump_lines(&b"partial line"[..], &logs).await;
        assert_eq!(logs.lock().unwrap().clone(), vec!["partial line"]);
    }
}
