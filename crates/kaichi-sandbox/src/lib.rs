//! Sandboxed code execution: run a program string as a child process in a
//! fresh working directory, bounded by a wall-clock timeout, and report a
//! uniform execution state.
//!
//! A [`SandboxRunner::step`] never fails — timeouts, non-zero exits, and
//! spawn problems are all encoded in the returned [`ExecutionState`] and
//! judged downstream by the critic. The isolation here is misbehaviour
//! containment (own cwd, own process, hard timeout), not a security
//! boundary against hostile code.

use kaichi_core::{KaichiError, KaichiResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;
use tracing::{debug, info, warn};

/// Return code recorded when the child exceeded its wall-clock budget.
pub const TIMEOUT_RETURN_CODE: i64 = -1;

/// Return code recorded when the child could not be spawned at all.
pub const SPAWN_FAILURE_RETURN_CODE: i64 = 127;

/// Settings for the runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Wall-clock bound per step, in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Interpreter used to run the written script.
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
}

fn default_timeout() -> u64 {
    5
}

fn default_interpreter() -> String {
    "python3".to_string()
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            interpreter: default_interpreter(),
        }
    }
}

impl SandboxConfig {
    pub fn validate(&self) -> KaichiResult<()> {
        if self.timeout == 0 {
            return Err(KaichiError::Config("Invalid timeout: 0".to_string()));
        }
        if self.interpreter.is_empty() {
            return Err(KaichiError::Config("Empty interpreter".to_string()));
        }
        Ok(())
    }
}

/// Uniform result of one execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub output: String,
    pub error: String,
    pub return_code: i64,
}

/// One `(code, state)` entry of the append-only execution log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub code: String,
    pub state: ExecutionState,
}

/// Status returned by [`SandboxRunner::reset`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxStatus {
    pub status: String,
    pub temp_dir: PathBuf,
}

/// Executes program strings in an isolated working directory.
pub struct SandboxRunner {
    config: SandboxConfig,
    temp_dir: Option<TempDir>,
    execution_log: Vec<ExecutionRecord>,
}

impl SandboxRunner {
    pub fn new(config: SandboxConfig) -> KaichiResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            temp_dir: None,
            execution_log: Vec::new(),
        })
    }

    /// Create a fresh empty working directory, discarding the previous one
    /// and the execution log.
    pub fn reset(&mut self) -> KaichiResult<SandboxStatus> {
        self.temp_dir = None;
        let dir = tempfile::tempdir().map_err(|e| KaichiError::Sandbox(e.to_string()))?;
        let path = dir.path().to_path_buf();
        self.temp_dir = Some(dir);
        self.execution_log.clear();
        info!(temp_dir = %path.display(), "Sandbox reset");
        Ok(SandboxStatus {
            status: "ready".to_string(),
            temp_dir: path,
        })
    }

    /// Run `code` in the working directory. Returns the execution state
    /// and a reward: +1.0 for exit code 0, −1.0 otherwise.
    pub async fn step(&mut self, code: &str) -> (ExecutionState, f64) {
        let state = self.execute(code).await;
        let reward = if state.return_code == 0 { 1.0 } else { -1.0 };
        self.execution_log.push(ExecutionRecord {
            code: code.to_string(),
            state: state.clone(),
        });
        debug!(return_code = state.return_code, reward, "Sandbox step finished");
        (state, reward)
    }

    async fn execute(&self, code: &str) -> ExecutionState {
        let Some(dir) = self.temp_dir.as_ref() else {
            return ExecutionState {
                output: String::new(),
                error: "Sandbox has not been reset.".to_string(),
                return_code: SPAWN_FAILURE_RETURN_CODE,
            };
        };

        let script = dir.path().join("script.py");
        if let Err(e) = tokio::fs::write(&script, code).await {
            return ExecutionState {
                output: String::new(),
                error: format!("Failed to write script: {e}"),
                return_code: SPAWN_FAILURE_RETURN_CODE,
            };
        }

        let run = tokio::process::Command::new(&self.config.interpreter)
            .arg(&script)
            .current_dir(dir.path())
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(Duration::from_secs(self.config.timeout), run).await {
            Ok(Ok(output)) => ExecutionState {
                output: String::from_utf8_lossy(&output.stdout).to_string(),
                error: String::from_utf8_lossy(&output.stderr).to_string(),
                return_code: output.status.code().map_or(TIMEOUT_RETURN_CODE, i64::from),
            },
            Ok(Err(e)) => {
                warn!(error = %e, "Failed to spawn interpreter");
                ExecutionState {
                    output: String::new(),
                    error: format!("Failed to execute code: {e}"),
                    return_code: SPAWN_FAILURE_RETURN_CODE,
                }
            }
            Err(_) => ExecutionState {
                output: String::new(),
                error: format!(
                    "Code execution exceeded timeout of {} seconds.",
                    self.config.timeout
                ),
                return_code: TIMEOUT_RETURN_CODE,
            },
        }
    }

    /// Delete the working directory recursively.
    pub fn close(&mut self) {
        if let Some(dir) = self.temp_dir.take() {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                warn!(temp_dir = %path.display(), error = %e, "Failed to remove sandbox dir");
            }
        }
    }

    /// Every `(code, state)` pair since the last reset.
    pub fn execution_log(&self) -> &[ExecutionRecord] {
        &self.execution_log
    }

    /// The execution log rendered as pretty JSON, for diagnostics.
    pub fn render(&self) -> String {
        self.execution_log
            .iter()
            .filter_map(|entry| serde_json::to_string_pretty(entry).ok())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn runner(timeout: u64) -> SandboxRunner {
        SandboxRunner::new(SandboxConfig {
            timeout,
            interpreter: default_interpreter(),
        })
        .unwrap()
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let result = SandboxRunner::new(SandboxConfig {
            timeout: 0,
            interpreter: "python3".to_string(),
        });
        assert!(matches!(result, Err(KaichiError::Config(_))));
    }

    #[tokio::test]
    async fn test_happy_path_prints_hi() {
        let mut sandbox = runner(5);
        let status = sandbox.reset().unwrap();
        assert_eq!(status.status, "ready");
        assert!(status.temp_dir.is_dir());

        let (state, reward) = sandbox.step("print('hi')\n").await;
        assert_eq!(state.output, "hi\n");
        assert_eq!(state.error, "");
        assert_eq!(state.return_code, 0);
        assert_eq!(reward, 1.0);
    }

    #[tokio::test]
    async fn test_division_by_zero_is_negative_reward() {
        let mut sandbox = runner(5);
        sandbox.reset().unwrap();

        let (state, reward) = sandbox.step("x = 1/0\n").await;
        assert_ne!(state.return_code, 0);
        assert!(state.error.contains("ZeroDivisionError"));
        assert_eq!(reward, -1.0);
    }

    #[tokio::test]
    async fn test_timeout_encodes_state() {
        let mut sandbox = runner(2);
        sandbox.reset().unwrap();

        let (state, reward) = sandbox.step("import time; time.sleep(10)\n").await;
        assert_eq!(state.output, "");
        assert_eq!(state.error, "Code execution exceeded timeout of 2 seconds.");
        assert_eq!(state.return_code, TIMEOUT_RETURN_CODE);
        assert_eq!(reward, -1.0);
    }

    #[tokio::test]
    async fn test_step_before_reset_does_not_panic() {
        let mut sandbox = runner(5);
        let (state, reward) = sandbox.step("print('x')\n").await;
        assert_eq!(state.return_code, SPAWN_FAILURE_RETURN_CODE);
        assert_eq!(reward, -1.0);
    }

    #[tokio::test]
    async fn test_cwd_is_the_working_directory() {
        let mut sandbox = runner(5);
        let status = sandbox.reset().unwrap();

        let (state, _) = sandbox
            .step("import os; print(os.path.realpath(os.getcwd()))\n")
            .await;
        let reported = PathBuf::from(state.output.trim());
        assert_eq!(reported, status.temp_dir.canonicalize().unwrap());
    }

    #[tokio::test]
    async fn test_log_accumulates_and_reset_clears() {
        let mut sandbox = runner(5);
        sandbox.reset().unwrap();
        sandbox.step("print(1)\n").await;
        sandbox.step("print(2)\n").await;
        assert_eq!(sandbox.execution_log().len(), 2);
        assert!(sandbox.render().contains("\"return_code\": 0"));

        sandbox.reset().unwrap();
        assert!(sandbox.execution_log().is_empty());
    }

    #[tokio::test]
    async fn test_close_removes_working_directory() {
        let mut sandbox = runner(5);
        let status = sandbox.reset().unwrap();
        assert!(status.temp_dir.is_dir());

        sandbox.close();
        assert!(!status.temp_dir.exists());
    }
}
