use std::process::Stdio;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::manager::protocol::{Outcome, StreamedJob};

/// Result of processing one streamed job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobOutcome {
    pub status: Outcome,
    pub result: Value,
    pub error: Option<String>,
}

impl JobOutcome {
    pub fn done(result: Value) -> Self {
        Self {
            status: Outcome::Done,
            result,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Outcome::Failed,
            result: Value::Null,
            error: Some(error.into()),
        }
    }
}

/// The opaque per-job processing logic run by workers.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, job: &StreamedJob) -> JobOutcome;
}

/// Runs a shell command per job.
///
/// The streamed job is written as JSON to the command's stdin. Exit status 0
/// means `done`, with stdout as the result (parsed as JSON when possible).
/// Any other exit status means `failed`, with stderr as the error.
#[derive(Debug, Clone)]
pub struct CommandProcessor {
    command: String,
}

impl CommandProcessor {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    async fn run(&self, input: Vec<u8>) -> std::io::Result<std::process::Output> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child.stdin.take();
        let writer = async move {
            if let Some(mut stdin) = stdin {
                // A command that ignores its input may exit before reading it.
                let _ = stdin.write_all(&input).await;
                let _ = stdin.shutdown().await;
            }
        };

        let (output, ()) = tokio::join!(child.wait_with_output(), writer);
        output
    }

    fn process_output(
        job: &StreamedJob,
        result: std::io::Result<std::process::Output>,
    ) -> JobOutcome {
        match result {
            Ok(output) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let stderr = String::from_utf8_lossy(&output.stderr);
                let exit_code = output.status.code();

                let outcome = if output.status.success() {
                    let trimmed = stdout.trim();
                    let result = serde_json::from_str(trimmed)
                        .unwrap_or_else(|_| Value::String(trimmed.to_string()));
                    JobOutcome::done(result)
                } else if stderr.trim().is_empty() {
                    JobOutcome::failed(format!("Exit code: {:?}", exit_code))
                } else {
                    JobOutcome::failed(stderr.trim().to_string())
                };

                tracing::debug!(
                    job_id = %job.jobid,
                    status = ?outcome.status,
                    exit_code = ?exit_code,
                    "Job processed"
                );
                outcome
            }
            Err(e) => {
                tracing::error!(job_id = %job.jobid, error = %e, "Job execution failed");
                JobOutcome::failed(e.to_string())
            }
        }
    }
}

#[async_trait]
impl JobProcessor for CommandProcessor {
    async fn process(&self, job: &StreamedJob) -> JobOutcome {
        let input = match serde_json::to_vec(job) {
            Ok(input) => input,
            Err(e) => return JobOutcome::failed(e.to_string()),
        };
        let result = self.run(input).await;
        Self::process_output(job, result)
    }
}
