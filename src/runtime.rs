//! Worker runtime contract: the narrow seam to the AI execution engine.
//!
//! The core treats execution as an opaque, slow, fallible remote call:
//! hand over a task description, a role and a workspace path; get back a
//! success flag, free-text output, file changes and an optional error.
//! Verification is a separate call so the dispatcher can gate completion
//! on the rig's policy.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{FileChange, VerificationReport};

/// Everything a runtime needs to execute one bead attempt.
#[derive(Debug, Clone)]
pub struct RuntimeTask {
    pub bead_id: Uuid,
    pub description: String,
    pub role: String,
    pub workspace_path: PathBuf,
    /// Rig-configured verification command, run in the workspace
    pub verification_command: Option<String>,
}

/// What came back from the execution engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuntimeOutcome {
    pub success: bool,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub file_changes: Vec<FileChange>,
    #[serde(default)]
    pub error: Option<String>,
}

#[async_trait]
pub trait WorkerRuntime: Send + Sync {
    /// Execute the task. An `Err` means the call itself failed (spawn
    /// error, timeout, garbage output); a `RuntimeOutcome` with
    /// `success = false` means the worker ran and gave up.
    async fn invoke(&self, task: &RuntimeTask) -> Result<RuntimeOutcome>;

    /// Run the rig's verification policy against the workspace.
    async fn verify(&self, task: &RuntimeTask) -> Result<VerificationReport>;
}

/// Runtime that shells out to a worker command.
///
/// The command receives the task over environment variables and runs with
/// the hook's working copy as its working directory. It must print a JSON
/// object (`success`, `output`, `file_changes`, `error`) on stdout;
/// surrounding noise is tolerated.
pub struct ProcessRuntime {
    command: String,
}

impl ProcessRuntime {
    pub fn new<S: Into<String>>(command: S) -> Self {
        Self {
            command: command.into(),
        }
    }

    /// Extract the outcome JSON from worker stdout, which may contain
    /// other text around it.
    pub fn parse_emission(output: &str) -> Result<RuntimeOutcome> {
        let start = output.find('{');
        let end = output.rfind('}');
        match (start, end) {
            (Some(start), Some(end)) if start <= end => {
                let json = &output[start..=end];
                debug!("Parsing worker emission: {}", json);
                Ok(serde_json::from_str(json)?)
            }
            _ => Err(Error::runtime_execution(
                "no JSON object found in worker output",
            )),
        }
    }
}

#[async_trait]
impl WorkerRuntime for ProcessRuntime {
    async fn invoke(&self, task: &RuntimeTask) -> Result<RuntimeOutcome> {
        info!(
            bead_id = %task.bead_id,
            role = %task.role,
            workspace = %task.workspace_path.display(),
            "Invoking worker runtime"
        );

        let output = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env("RIGYARD_BEAD_ID", task.bead_id.to_string())
            .env("RIGYARD_TASK", &task.description)
            .env("RIGYARD_ROLE", &task.role)
            .current_dir(&task.workspace_path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| Error::runtime_execution(format!("failed to spawn worker: {e}")))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        debug!("Worker stdout: {}", stdout);
        debug!("Worker stderr: {}", stderr);

        if !output.status.success() {
            return Err(Error::runtime_execution(format!(
                "worker exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        Self::parse_emission(&stdout)
    }

    async fn verify(&self, task: &RuntimeTask) -> Result<VerificationReport> {
        let Some(command) = &task.verification_command else {
            // No rig policy configured: trust the runtime's own report
            return Ok(VerificationReport {
                passed: true,
                errors: Vec::new(),
            });
        };

        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&task.workspace_path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| Error::runtime_execution(format!("failed to spawn verifier: {e}")))?;

        if output.status.success() {
            return Ok(VerificationReport {
                passed: true,
                errors: Vec::new(),
            });
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let errors: Vec<String> = stderr
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();
        Ok(VerificationReport {
            passed: false,
            errors: if errors.is_empty() {
                vec![format!("verification exited with {}", output.status)]
            } else {
                errors
            },
        })
    }
}
