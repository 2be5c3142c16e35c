//! Collaborator adapter: the external execution session that performs the
//! actual work of an attempt.
//!
//! The production implementation shells out to a configured command. The
//! command receives a JSON request on stdin and must print a final JSON
//! line reporting either completion (with the changed resources) or a
//! decline.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use task_core::{Id, TaskKind};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Maximum bytes captured from the collaborator's stdout.
const MAX_OUTPUT_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum CollabError {
    /// Spawn failure. Transient infra error: the attempt never started and
    /// must not consume budget.
    #[error("collaborator unavailable: {0}")]
    Unavailable(std::io::Error),
    #[error("collaborator timed out after {0} seconds")]
    Timeout(u32),
    /// The kill switch went OFF while the command was running.
    #[error("collaborator cancelled")]
    Cancelled,
    #[error("collaborator produced malformed output: {0}")]
    Malformed(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CollabError>;

/// Attempt context handed to the collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollabRequest {
    pub task_id: Id,
    pub title: String,
    pub kind: TaskKind,
    pub sequence_number: u32,
    /// Diagnostics from the previous failed attempt, if any.
    pub next_steps: Vec<String>,
}

/// What the collaborator reported back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollabOutcome {
    /// Work performed; resources the collaborator touched.
    Done { changed_resources: Vec<String> },
    /// The collaborator declared inability to proceed.
    Declined { reason: String },
}

/// Final JSON line printed by the collaborator command.
#[derive(Debug, Deserialize)]
struct CollabReport {
    status: String,
    #[serde(default)]
    changed_resources: Vec<String>,
    #[serde(default)]
    reason: Option<String>,
}

/// Seam for the external execution session. `cancel` aborts a running
/// invocation mid-flight; implementations report `CollabError::Cancelled`.
#[async_trait]
pub trait Collaborator: Send + Sync {
    async fn invoke(
        &self,
        request: &CollabRequest,
        cancel: &CancellationToken,
    ) -> Result<CollabOutcome>;
}

/// Production collaborator: runs a configured command via `sh -c`.
#[derive(Debug, Clone)]
pub struct CommandCollaborator {
    command: String,
    /// Timeout in seconds (0 = no timeout).
    timeout_sec: u32,
}

impl CommandCollaborator {
    pub fn new(command: impl Into<String>, timeout_sec: u32) -> Self {
        Self {
            command: command.into(),
            timeout_sec,
        }
    }
}

#[async_trait]
impl Collaborator for CommandCollaborator {
    async fn invoke(
        &self,
        request: &CollabRequest,
        cancel: &CancellationToken,
    ) -> Result<CollabOutcome> {
        debug!(task_id = %request.task_id, cmd = %self.command, "invoking collaborator");

        let request_json =
            serde_json::to_string(request).map_err(|e| CollabError::Malformed(e.to_string()))?;

        let mut process = Command::new("sh");
        process
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        let mut child = process.spawn().map_err(CollabError::Unavailable)?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(request_json.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            // Close stdin so the command sees EOF.
            drop(stdin);
        }

        // Drain stdout concurrently with the wait; a command emitting more
        // than the pipe buffer would otherwise block until the timeout.
        let stdout_task = child.stdout.take().map(|mut handle| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = (&mut handle)
                    .take(MAX_OUTPUT_BYTES as u64)
                    .read_to_end(&mut buf)
                    .await;
                // Keep draining past the cap so the child never stalls.
                let _ = tokio::io::copy(&mut handle, &mut tokio::io::sink()).await;
                buf
            })
        });

        let timeout_duration = Duration::from_secs(u64::from(self.timeout_sec.max(1)));
        tokio::select! {
            result = child.wait() => {
                result?;
            }
            () = tokio::time::sleep(timeout_duration), if self.timeout_sec > 0 => {
                if let Err(e) = child.kill().await {
                    warn!(task_id = %request.task_id, error = %e, "failed to kill timed-out collaborator");
                }
                // Reap the process to prevent zombie
                let _ = child.wait().await;
                return Err(CollabError::Timeout(self.timeout_sec));
            }
            () = cancel.cancelled() => {
                if let Err(e) = child.kill().await {
                    warn!(task_id = %request.task_id, error = %e, "failed to kill cancelled collaborator");
                }
                let _ = child.wait().await;
                return Err(CollabError::Cancelled);
            }
        }

        let stdout = match stdout_task {
            Some(task) => task.await.unwrap_or_default(),
            None => Vec::new(),
        };

        parse_report(&String::from_utf8_lossy(&stdout))
    }
}

/// Parse the last non-empty stdout line as the collaborator report.
fn parse_report(output: &str) -> Result<CollabOutcome> {
    let Some(last_line) = output.lines().rev().find(|l| !l.trim().is_empty()) else {
        return Err(CollabError::Malformed("empty output".to_string()));
    };

    let report: CollabReport = serde_json::from_str(last_line.trim())
        .map_err(|e| CollabError::Malformed(format!("{e}: {last_line}")))?;

    match report.status.as_str() {
        "done" => Ok(CollabOutcome::Done {
            changed_resources: report.changed_resources,
        }),
        "declined" => Ok(CollabOutcome::Declined {
            reason: report
                .reason
                .unwrap_or_else(|| "no reason given".to_string()),
        }),
        other => Err(CollabError::Malformed(format!("unknown status: {other}"))),
    }
}

/// Write a collaborator stub script for tests and local dry runs.
pub fn write_stub_script(path: &Path, body: &str) -> std::io::Result<()> {
    std::fs::write(path, format!("#!/bin/sh\n{body}\n"))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(path)?.permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(path, perms)?;
    }
    Ok(())
}
