//! Tiered verification runner.
//!
//! Runs configured tiers in order, cheapest first, and short-circuits on
//! the first failure. A timed-out tier counts as a failed tier with
//! `timeout` diagnostics.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use chrono::Utc;
use task_core::{TierResult, TierSpec};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Diagnostics keep at most this many trailing output lines.
const DIAGNOSTICS_TAIL_LINES: usize = 120;

#[derive(Debug, Error)]
pub enum VerifierError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The kill switch went OFF while a tier was running.
    #[error("verification cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, VerifierError>;

/// Runs verification tiers for one attempt.
#[derive(Debug, Clone)]
pub struct TierRunner {
    tiers: Vec<TierSpec>,
    /// Timeout per tier in seconds (0 = no timeout).
    timeout_sec: u32,
}

impl TierRunner {
    pub fn new(tiers: Vec<TierSpec>, timeout_sec: u32) -> Self {
        Self { tiers, timeout_sec }
    }

    pub fn has_tiers(&self) -> bool {
        !self.tiers.is_empty()
    }

    /// Run all tiers in order, stopping at the first failure.
    ///
    /// Returns the results of the tiers that ran; tiers after the failing
    /// one never execute. `cancel` kills the running tier mid-flight.
    pub async fn run(
        &self,
        working_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<Vec<TierResult>> {
        let mut results = Vec::with_capacity(self.tiers.len());

        for tier in &self.tiers {
            let result = self.run_tier(tier, working_dir, cancel).await?;
            let passed = result.passed;
            results.push(result);
            if !passed {
                break;
            }
        }

        info!(
            tiers_run = results.len(),
            passed = results.iter().all(|r| r.passed),
            "verification finished"
        );
        Ok(results)
    }

    async fn run_tier(
        &self,
        tier: &TierSpec,
        working_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<TierResult> {
        debug!(tier = %tier.name, cmd = %tier.command, "running verification tier");

        let start = Utc::now();

        let mut process = Command::new("sh");
        process
            .arg("-c")
            .arg(&tier.command)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = process.spawn()?;

        // Drain both pipes concurrently with the wait; a chatty tier would
        // otherwise fill the pipe buffer and deadlock against the timeout.
        let stdout_task = child.stdout.take().map(|mut handle| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = handle.read_to_end(&mut buf).await;
                buf
            })
        });
        let stderr_task = child.stderr.take().map(|mut handle| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = handle.read_to_end(&mut buf).await;
                buf
            })
        });

        let mut timed_out = false;
        let timeout_duration = Duration::from_secs(u64::from(self.timeout_sec.max(1)));
        let exit_code = tokio::select! {
            result = child.wait() => {
                result?.code().unwrap_or(-1)
            }
            () = tokio::time::sleep(timeout_duration), if self.timeout_sec > 0 => {
                if let Err(e) = child.kill().await {
                    warn!(tier = %tier.name, error = %e, "failed to kill timed-out tier");
                }
                // Reap the process to prevent zombie
                let _ = child.wait().await;
                warn!(tier = %tier.name, timeout_sec = self.timeout_sec, "tier timed out");
                timed_out = true;
                -1
            }
            () = cancel.cancelled() => {
                if let Err(e) = child.kill().await {
                    warn!(tier = %tier.name, error = %e, "failed to kill cancelled tier");
                }
                let _ = child.wait().await;
                return Err(VerifierError::Cancelled);
            }
        };

        let stdout = match stdout_task {
            Some(task) => task.await.unwrap_or_default(),
            None => Vec::new(),
        };
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => Vec::new(),
        };

        let end = Utc::now();
        let duration_ms = (end - start).num_milliseconds() as u64;

        let passed = !timed_out && exit_code == 0;
        let diagnostics = if timed_out {
            format!("timeout after {} seconds", self.timeout_sec)
        } else if passed {
            String::new()
        } else {
            tail_output(
                &String::from_utf8_lossy(&stdout),
                &String::from_utf8_lossy(&stderr),
            )
        };

        if passed {
            debug!(tier = %tier.name, duration_ms, "tier passed");
        } else {
            warn!(tier = %tier.name, exit_code, duration_ms, "tier failed");
        }

        Ok(TierResult {
            tier: tier.name.clone(),
            passed,
            diagnostics,
            duration_ms,
        })
    }
}

/// Combine stdout and stderr, keeping only the trailing lines.
fn tail_output(stdout: &str, stderr: &str) -> String {
    let combined = if stderr.is_empty() {
        stdout.to_string()
    } else if stdout.is_empty() {
        stderr.to_string()
    } else {
        format!("{stdout}\n--- STDERR ---\n{stderr}")
    };

    let lines: Vec<&str> = combined.lines().collect();
    let tail_start = lines.len().saturating_sub(DIAGNOSTICS_TAIL_LINES);
    lines[tail_start..].join("\n")
}
