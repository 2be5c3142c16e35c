//! Iteration loop: drives one claimed task through attempt, verification
//! and governance until it completes, blocks, or runs out of budget.
//!
//! Phases run in a fixed order (attempting, verifying, deciding) and a
//! checkpoint is persisted before every task state transition, so a crash
//! or kill-switch abort can always resume from the last recorded phase.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use task_core::events::{
    AttemptFinishedPayload, AttemptStartedPayload, CheckpointSavedPayload, EventPayload,
    TaskBlockedPayload, TaskCompletedPayload, TaskRequeuedPayload, VerdictRecordedPayload,
};
use task_core::{
    Attempt, Checkpoint, Decision, Id, KillSwitchMode, LoopPhase, Task, TaskState, TierResult,
    Verdict, VerdictReason,
};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::collaborator::{CollabError, CollabOutcome, CollabRequest, Collaborator};
use crate::gate::{GateError, GateInput, GovernanceGate};
use crate::queue::{QueueError, TaskQueue};
use crate::storage::{Storage, StorageError};
use crate::verifier::{TierRunner, VerifierError};

#[derive(Debug, Error)]
pub enum LoopError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("gate error: {0}")]
    Gate(#[from] GateError),
    #[error("verifier error: {0}")]
    Verifier(#[from] VerifierError),
}

pub type Result<T> = std::result::Result<T, LoopError>;

/// Terminal outcome of one loop run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopOutcome {
    Completed { attempts: u32 },
    Blocked { reason: String },
    /// Transient infra failure; the task went back to PENDING without
    /// consuming budget.
    Requeued,
    /// Kill switch went OFF; state was checkpointed and the task requeued.
    Aborted,
}

/// Runs attempts for one task at a time.
pub struct IterationLoop {
    storage: Arc<Storage>,
    queue: Arc<TaskQueue>,
    gate: Arc<GovernanceGate>,
    verifier: TierRunner,
    collaborator: Arc<dyn Collaborator>,
    working_dir: PathBuf,
}

impl std::fmt::Debug for IterationLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IterationLoop")
            .field("working_dir", &self.working_dir)
            .finish_non_exhaustive()
    }
}

impl IterationLoop {
    pub fn new(
        storage: Arc<Storage>,
        queue: Arc<TaskQueue>,
        gate: Arc<GovernanceGate>,
        verifier: TierRunner,
        collaborator: Arc<dyn Collaborator>,
        working_dir: PathBuf,
    ) -> Self {
        Self {
            storage,
            queue,
            gate,
            verifier,
            collaborator,
            working_dir,
        }
    }

    /// Drive an already-claimed (IN_PROGRESS) task to a terminal outcome.
    ///
    /// `mode` is sampled once per governance evaluation; `cancel` is
    /// observed at checkpoint boundaries and inside the collaborator and
    /// verifier awaits.
    pub async fn run(
        &self,
        task_id: &Id,
        mode: &watch::Receiver<KillSwitchMode>,
        cancel: &CancellationToken,
    ) -> Result<LoopOutcome> {
        loop {
            let task = self.storage.get_task(task_id).await?;
            // Attempt rows keep globally unique sequence numbers across
            // human resolutions, so the sequence comes from history rather
            // than the (resettable) budget counter.
            let last_sequence = self.storage.max_attempt_sequence(task_id).await?;
            let sequence = last_sequence + 1;
            let new_count = task.attempt_count + 1;

            if cancel.is_cancelled() {
                return self.abort(&task, sequence, LoopPhase::Attempting).await;
            }

            let budget = self
                .gate
                .policy()
                .effective_max_attempts(task.max_attempts);
            if task.attempt_count >= budget {
                // Budget already spent before this loop got the task.
                return self
                    .block(
                        &task,
                        last_sequence,
                        task.attempt_count,
                        "attempts_exhausted",
                        "attempt budget already consumed",
                    )
                    .await;
            }

            // Prior failure diagnostics feed the next attempt so a retry is
            // never a blind repeat.
            let next_steps = match self.storage.latest_checkpoint(task_id).await? {
                Some(cp) => cp.next_steps,
                None => vec![],
            };

            self.checkpoint(&task, sequence, LoopPhase::Attempting, next_steps.clone())
                .await?;

            let attempt_id = Id::new();
            let started_at = Utc::now();
            self.storage
                .append_event(
                    task_id,
                    "coordinator",
                    &EventPayload::AttemptStarted(AttemptStartedPayload {
                        attempt_id: attempt_id.clone(),
                        task_id: task_id.clone(),
                        sequence_number: sequence,
                    }),
                )
                .await?;
            info!(task_id = %task_id, sequence, "attempt started");

            let request = CollabRequest {
                task_id: task_id.clone(),
                title: task.title.clone(),
                kind: task.kind,
                sequence_number: sequence,
                next_steps,
            };

            let (changed_resources, tier_results, verdict) =
                match self.collaborator.invoke(&request, cancel).await {
                    Ok(CollabOutcome::Done { changed_resources }) => {
                        if cancel.is_cancelled() {
                            return self.abort(&task, sequence, LoopPhase::Verifying).await;
                        }
                        self.checkpoint(&task, sequence, LoopPhase::Verifying, vec![])
                            .await?;
                        let tier_results =
                            match self.verifier.run(&self.working_dir, cancel).await {
                                Ok(results) => results,
                                Err(VerifierError::Cancelled) => {
                                    return self
                                        .abort(&task, sequence, LoopPhase::Verifying)
                                        .await;
                                }
                                Err(e) => return Err(e.into()),
                            };

                        if cancel.is_cancelled() {
                            return self.abort(&task, sequence, LoopPhase::Deciding).await;
                        }
                        self.checkpoint(&task, sequence, LoopPhase::Deciding, vec![])
                            .await?;
                        // Copy the snapshot out before the await; holding the
                        // watch ref across it would pin the loop future.
                        let mode_snapshot = *mode.borrow();
                        let verdict = self
                            .gate
                            .evaluate(GateInput {
                                task: &task,
                                mode: mode_snapshot,
                                changed_resources: &changed_resources,
                                tier_results: &tier_results,
                            })
                            .await?;
                        (changed_resources, tier_results, verdict)
                    }
                    Ok(CollabOutcome::Declined { reason }) => {
                        let verdict = Verdict::blocked(VerdictReason::CollaboratorDeclined, reason);
                        self.record_synthetic_verdict(task_id, &verdict).await?;
                        (vec![], vec![], verdict)
                    }
                    Err(CollabError::Timeout(secs)) => {
                        let verdict = Verdict::fail(
                            VerdictReason::Timeout {
                                stage: "collaborator".to_string(),
                            },
                            format!("collaborator timed out after {secs} seconds"),
                        );
                        self.record_synthetic_verdict(task_id, &verdict).await?;
                        (vec![], vec![], verdict)
                    }
                    Err(CollabError::Malformed(detail)) => {
                        let verdict = Verdict::fail(VerdictReason::MalformedOutput, detail);
                        self.record_synthetic_verdict(task_id, &verdict).await?;
                        (vec![], vec![], verdict)
                    }
                    Err(CollabError::Cancelled) => {
                        return self.abort(&task, sequence, LoopPhase::Attempting).await;
                    }
                    Err(e @ (CollabError::Unavailable(_) | CollabError::Io(_))) => {
                        // The attempt never ran; no budget consumed.
                        warn!(task_id = %task_id, error = %e, "collaborator unavailable, requeueing");
                        return self.requeue(&task, e.to_string(), true).await;
                    }
                };

            let attempt = Attempt {
                id: attempt_id.clone(),
                task_id: task_id.clone(),
                sequence_number: sequence,
                started_at,
                ended_at: None,
                verifier_results: vec![],
                verdict: None,
                changed_resources: vec![],
            };
            self.storage.insert_attempt(&attempt).await?;
            self.storage
                .finish_attempt(&attempt_id, &tier_results, &verdict, &changed_resources)
                .await?;
            self.storage
                .update_attempt_count(task_id, new_count)
                .await?;

            let duration_ms = (Utc::now() - started_at).num_milliseconds().max(0) as u64;
            self.storage
                .append_event(
                    task_id,
                    "coordinator",
                    &EventPayload::AttemptFinished(AttemptFinishedPayload {
                        attempt_id,
                        task_id: task_id.clone(),
                        sequence_number: sequence,
                        decision: verdict.decision,
                        duration_ms,
                    }),
                )
                .await?;

            match verdict.decision {
                Decision::Pass => {
                    let mut done = task.clone();
                    done.attempt_count = new_count;
                    self.checkpoint_with_status(
                        &done,
                        sequence,
                        LoopPhase::Done,
                        TaskState::Completed,
                        vec![],
                    )
                    .await?;
                    self.queue
                        .transition(task_id, TaskState::Completed, None)
                        .await?;
                    self.storage
                        .append_event(
                            task_id,
                            "coordinator",
                            &EventPayload::TaskCompleted(TaskCompletedPayload {
                                task_id: task_id.clone(),
                                attempt_count: new_count,
                            }),
                        )
                        .await?;
                    info!(task_id = %task_id, attempts = new_count, "task completed");
                    return Ok(LoopOutcome::Completed { attempts: new_count });
                }
                Decision::Blocked => {
                    // Governance-level block: never retried, budget or not.
                    return self
                        .block(
                            &task,
                            sequence,
                            new_count,
                            verdict.reason.code(),
                            &verdict.summary,
                        )
                        .await;
                }
                Decision::Fail => {
                    if new_count >= budget {
                        return self
                            .block(
                                &task,
                                sequence,
                                new_count,
                                "attempts_exhausted",
                                &verdict.summary,
                            )
                            .await;
                    }
                    let diagnostics = failure_diagnostics(&verdict, &tier_results);
                    let mut retrying = task.clone();
                    retrying.attempt_count = new_count;
                    self.checkpoint(&retrying, sequence, LoopPhase::Retrying, diagnostics)
                        .await?;
                    info!(
                        task_id = %task_id,
                        sequence,
                        remaining = budget - new_count,
                        "attempt failed, retrying"
                    );
                }
            }
        }
    }

    async fn block(
        &self,
        task: &Task,
        sequence: u32,
        attempts: u32,
        reason: &str,
        summary: &str,
    ) -> Result<LoopOutcome> {
        let mut blocked = task.clone();
        blocked.attempt_count = attempts;
        self.checkpoint_with_status(
            &blocked,
            sequence,
            LoopPhase::Blocked,
            TaskState::Blocked,
            vec![summary.to_string()],
        )
        .await?;
        self.queue
            .transition(&task.id, TaskState::Blocked, Some(reason))
            .await?;
        self.storage
            .append_event(
                &task.id,
                "coordinator",
                &EventPayload::TaskBlocked(TaskBlockedPayload {
                    task_id: task.id.clone(),
                    reason: reason.to_string(),
                }),
            )
            .await?;
        warn!(task_id = %task.id, reason, "task blocked");
        Ok(LoopOutcome::Blocked {
            reason: reason.to_string(),
        })
    }

    async fn requeue(&self, task: &Task, reason: String, transient: bool) -> Result<LoopOutcome> {
        self.queue
            .transition(&task.id, TaskState::Pending, None)
            .await?;
        self.storage
            .append_event(
                &task.id,
                "coordinator",
                &EventPayload::TaskRequeued(TaskRequeuedPayload {
                    task_id: task.id.clone(),
                    reason,
                    transient,
                }),
            )
            .await?;
        Ok(LoopOutcome::Requeued)
    }

    /// Kill-switch abort: persist where we were, hand the task back.
    async fn abort(&self, task: &Task, sequence: u32, phase: LoopPhase) -> Result<LoopOutcome> {
        self.checkpoint(task, sequence, phase, vec![]).await?;
        self.queue
            .transition(&task.id, TaskState::Pending, None)
            .await?;
        self.storage
            .append_event(
                &task.id,
                "coordinator",
                &EventPayload::TaskRequeued(TaskRequeuedPayload {
                    task_id: task.id.clone(),
                    reason: "kill_switch_off".to_string(),
                    transient: true,
                }),
            )
            .await?;
        warn!(task_id = %task.id, phase = phase.as_str(), "loop aborted by kill switch");
        Ok(LoopOutcome::Aborted)
    }

    async fn checkpoint(
        &self,
        task: &Task,
        sequence: u32,
        phase: LoopPhase,
        next_steps: Vec<String>,
    ) -> Result<()> {
        self.checkpoint_with_status(task, sequence, phase, task.state, next_steps)
            .await
    }

    async fn checkpoint_with_status(
        &self,
        task: &Task,
        sequence: u32,
        phase: LoopPhase,
        status: TaskState,
        next_steps: Vec<String>,
    ) -> Result<()> {
        let checkpoint = Checkpoint {
            task_id: task.id.clone(),
            sequence_number: sequence,
            phase,
            status,
            attempt_count: task.attempt_count,
            next_steps,
            context: Default::default(),
            saved_at: Utc::now(),
        };
        self.storage.save_checkpoint(&checkpoint).await?;
        self.storage
            .append_event(
                &task.id,
                "coordinator",
                &EventPayload::CheckpointSaved(CheckpointSavedPayload {
                    task_id: task.id.clone(),
                    sequence_number: sequence,
                    phase,
                }),
            )
            .await?;
        Ok(())
    }

    /// Verdicts the gate never saw (collaborator timeout, malformed output,
    /// decline) still land in the audit log.
    async fn record_synthetic_verdict(&self, task_id: &Id, verdict: &Verdict) -> Result<()> {
        self.storage
            .append_event(
                task_id,
                "coordinator",
                &EventPayload::VerdictRecorded(VerdictRecordedPayload {
                    task_id: task_id.clone(),
                    decision: verdict.decision,
                    reason: verdict.reason.clone(),
                    summary: verdict.summary.clone(),
                }),
            )
            .await?;
        Ok(())
    }
}

/// What the next attempt should know about this failure.
fn failure_diagnostics(verdict: &Verdict, tier_results: &[TierResult]) -> Vec<String> {
    let mut steps = vec![verdict.summary.clone()];
    if let Some(failed) = tier_results.iter().find(|t| !t.passed) {
        if !failed.diagnostics.is_empty() {
            steps.push(failed.diagnostics.clone());
        }
    }
    steps
}
