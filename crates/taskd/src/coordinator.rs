//! Coordinator: dispatch, concurrency bound, kill switch.
//!
//! `tick()` claims ready tasks and spawns one iteration loop per claim, up
//! to `max_concurrent_tasks`. The kill switch lives in a watch channel;
//! PAUSED stops new dispatch but lets in-flight loops finish, OFF
//! additionally cancels them at their next checkpoint boundary.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use task_core::events::{EventPayload, KillSwitchChangedPayload, TaskRequeuedPayload};
use task_core::{Id, KillSwitchMode, TaskState};
use thiserror::Error;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::gate::GovernanceGate;
use crate::iteration::{IterationLoop, LoopOutcome};
use crate::queue::{QueueError, TaskQueue};
use crate::storage::{Storage, StorageError};

/// Task id under which global (task-less) audit events are filed.
const GLOBAL_EVENT_ID: &str = "-";

#[derive(Debug, Error)]
pub enum CoordError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

pub type Result<T> = std::result::Result<T, CoordError>;

pub struct Coordinator {
    storage: Arc<Storage>,
    queue: Arc<TaskQueue>,
    gate: Arc<GovernanceGate>,
    iteration: Arc<IterationLoop>,
    /// Concurrency bound on in-flight iteration loops.
    semaphore: Arc<Semaphore>,
    active_loops: Arc<AtomicUsize>,
    mode_tx: watch::Sender<KillSwitchMode>,
    /// Replaced with a fresh token whenever the switch leaves OFF.
    cancel: Mutex<CancellationToken>,
    session_counter: AtomicUsize,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("active_loops", &self.active_loops.load(Ordering::SeqCst))
            .field("mode", &*self.mode_tx.borrow())
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    pub fn new(
        storage: Arc<Storage>,
        queue: Arc<TaskQueue>,
        gate: Arc<GovernanceGate>,
        iteration: Arc<IterationLoop>,
        max_concurrent_tasks: usize,
    ) -> Self {
        let (mode_tx, _) = watch::channel(KillSwitchMode::Normal);
        Self {
            storage,
            queue,
            gate,
            iteration,
            semaphore: Arc::new(Semaphore::new(max_concurrent_tasks)),
            active_loops: Arc::new(AtomicUsize::new(0)),
            mode_tx,
            cancel: Mutex::new(CancellationToken::new()),
            session_counter: AtomicUsize::new(0),
        }
    }

    pub fn mode(&self) -> KillSwitchMode {
        *self.mode_tx.borrow()
    }

    pub fn subscribe_mode(&self) -> watch::Receiver<KillSwitchMode> {
        self.mode_tx.subscribe()
    }

    pub fn active_loops(&self) -> usize {
        self.active_loops.load(Ordering::SeqCst)
    }

    /// Change the kill-switch mode and record it in the audit log.
    ///
    /// OFF cancels in-flight loops; leaving OFF installs a fresh
    /// cancellation token for subsequent dispatch.
    pub async fn set_mode(&self, mode: KillSwitchMode, actor: &str) -> Result<KillSwitchMode> {
        let previous = self.mode();
        if previous == mode {
            return Ok(previous);
        }

        {
            let mut cancel = self.cancel.lock().await;
            if mode == KillSwitchMode::Off {
                cancel.cancel();
            } else if previous == KillSwitchMode::Off {
                *cancel = CancellationToken::new();
            }
        }

        self.mode_tx.send_replace(mode);
        self.storage
            .append_event(
                &Id::from_string(GLOBAL_EVENT_ID),
                actor,
                &EventPayload::KillSwitchChanged(KillSwitchChangedPayload {
                    previous,
                    current: mode,
                    actor: actor.to_string(),
                }),
            )
            .await?;

        warn!(
            previous = previous.as_str(),
            current = mode.as_str(),
            actor,
            "kill switch changed"
        );
        Ok(previous)
    }

    /// One scheduling pass: dispatch ready tasks up to the concurrency
    /// bound. Returns the number of loops started.
    pub async fn tick(self: &Arc<Self>) -> Result<usize> {
        // One mode snapshot per tick.
        let mode = self.mode();
        if matches!(mode, KillSwitchMode::Paused | KillSwitchMode::Off) {
            return Ok(0);
        }

        let mut dispatched = 0;
        loop {
            let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() else {
                break;
            };

            let session = format!(
                "loop-{}",
                self.session_counter.fetch_add(1, Ordering::SeqCst) + 1
            );
            // SAFE restricts dispatch to whitelisted kinds; everything else
            // stays queued. The gate re-checks mid-flight mode flips.
            let claimed = if mode == KillSwitchMode::Safe {
                self.queue
                    .claim_next_ready_matching(&session, |t| {
                        self.gate.policy().is_safe_kind(t.kind)
                    })
                    .await?
            } else {
                self.queue.claim_next_ready(&session).await?
            };
            let Some(task) = claimed else {
                drop(permit);
                break;
            };

            let cancel = self.cancel.lock().await.clone();
            let mode_rx = self.mode_tx.subscribe();
            let coordinator = Arc::clone(self);
            self.active_loops.fetch_add(1, Ordering::SeqCst);

            tokio::spawn(async move {
                let task_id = task.id.clone();
                let outcome = coordinator
                    .iteration
                    .run(&task_id, &mode_rx, &cancel)
                    .await;
                coordinator.active_loops.fetch_sub(1, Ordering::SeqCst);
                drop(permit);

                match outcome {
                    Ok(LoopOutcome::Blocked { reason }) => {
                        coordinator.on_task_blocked(&task_id, &reason).await;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(task_id = %task_id, error = %e, "iteration loop failed");
                    }
                }
            });
            dispatched += 1;
        }

        Ok(dispatched)
    }

    /// A blocked task never halts the queue, but a halt-condition reason
    /// downgrades the kill switch to PAUSED.
    async fn on_task_blocked(&self, task_id: &Id, reason: &str) {
        info!(task_id = %task_id, reason, "task blocked, queue continues");
        if self.gate.policy().is_halt_condition(reason) {
            if let Err(e) = self.set_mode(KillSwitchMode::Paused, "policy").await {
                error!(error = %e, "failed to record policy halt");
            }
        }
    }

    /// Crash recovery: hand tasks found IN_PROGRESS back to the queue.
    ///
    /// Attempt budgets are untouched; an interrupted attempt was never
    /// finished and does not count. Idempotent under repeated calls.
    pub async fn resume(&self) -> Result<usize> {
        let in_progress = self
            .storage
            .list_tasks(Some(TaskState::InProgress))
            .await?;

        let mut requeued = 0;
        for task in in_progress {
            self.queue
                .transition(&task.id, TaskState::Pending, None)
                .await?;
            self.storage
                .append_event(
                    &task.id,
                    "coordinator",
                    &EventPayload::TaskRequeued(TaskRequeuedPayload {
                        task_id: task.id.clone(),
                        reason: "interrupted".to_string(),
                        transient: true,
                    }),
                )
                .await?;
            info!(task_id = %task.id, "interrupted task requeued");
            requeued += 1;
        }
        Ok(requeued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborator::{CollabError, CollabOutcome, CollabRequest, Collaborator};
    use crate::queue::NewTask;
    use crate::verifier::TierRunner;
    use async_trait::async_trait;
    use std::time::Duration;
    use task_core::{AutonomyPolicy, TaskKind};
    use tempfile::TempDir;

    /// Collaborator that parks until released, so tests can observe
    /// in-flight loops.
    struct ParkedCollaborator {
        release: tokio::sync::Notify,
    }

    #[async_trait]
    impl Collaborator for ParkedCollaborator {
        async fn invoke(
            &self,
            _request: &CollabRequest,
            cancel: &CancellationToken,
        ) -> crate::collaborator::Result<CollabOutcome> {
            tokio::select! {
                () = self.release.notified() => Ok(CollabOutcome::Done {
                    changed_resources: vec!["src/lib.rs".to_string()],
                }),
                () = cancel.cancelled() => Err(CollabError::Cancelled),
            }
        }
    }

    struct InstantCollaborator {
        changed: Vec<String>,
    }

    #[async_trait]
    impl Collaborator for InstantCollaborator {
        async fn invoke(
            &self,
            _request: &CollabRequest,
            _cancel: &CancellationToken,
        ) -> crate::collaborator::Result<CollabOutcome> {
            Ok(CollabOutcome::Done {
                changed_resources: self.changed.clone(),
            })
        }
    }

    struct TestCoordinator {
        coordinator: Arc<Coordinator>,
        queue: Arc<TaskQueue>,
        storage: Arc<Storage>,
        _dir: TempDir,
    }

    fn permissive_policy() -> AutonomyPolicy {
        toml::from_str(
            r#"
            version = 1
            role = "executor"
            "#,
        )
        .unwrap()
    }

    fn safe_policy() -> AutonomyPolicy {
        toml::from_str(
            r#"
            version = 1
            role = "executor"
            safe_kinds = ["doc"]
            "#,
        )
        .unwrap()
    }

    fn halting_policy() -> AutonomyPolicy {
        toml::from_str(
            r#"
            version = 1
            role = "executor"
            halt_conditions = ["scope_escalation"]

            [limits]
            escalation_threshold = 1
            "#,
        )
        .unwrap()
    }

    async fn create_test_coordinator(
        policy: AutonomyPolicy,
        collaborator: Arc<dyn Collaborator>,
        max_concurrent: usize,
    ) -> TestCoordinator {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(&dir.path().join("test.db")).await.unwrap();
        storage.migrate_embedded().await.unwrap();
        let storage = Arc::new(storage);
        let queue = Arc::new(TaskQueue::new(Arc::clone(&storage)));
        let gate = Arc::new(GovernanceGate::new(policy, Arc::clone(&storage)));
        let iteration = Arc::new(IterationLoop::new(
            Arc::clone(&storage),
            Arc::clone(&queue),
            Arc::clone(&gate),
            TierRunner::new(vec![], 30),
            collaborator,
            dir.path().to_path_buf(),
        ));
        let coordinator = Arc::new(Coordinator::new(
            Arc::clone(&storage),
            Arc::clone(&queue),
            gate,
            iteration,
            max_concurrent,
        ));
        TestCoordinator {
            coordinator,
            queue,
            storage,
            _dir: dir,
        }
    }

    fn new_task(id: &str) -> NewTask {
        NewTask {
            id: Some(Id::from_string(id)),
            title: format!("task {id}"),
            kind: TaskKind::Feature,
            priority: 1,
            dependencies: vec![],
            max_attempts: 3,
        }
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..250 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached within timeout");
    }

    #[tokio::test]
    async fn tick_respects_concurrency_bound() {
        let parked = Arc::new(ParkedCollaborator {
            release: tokio::sync::Notify::new(),
        });
        let tc = create_test_coordinator(permissive_policy(), Arc::clone(&parked) as _, 2).await;
        for id in ["TASK-001", "TASK-002", "TASK-003"] {
            tc.queue.enqueue(new_task(id)).await.unwrap();
        }

        let dispatched = tc.coordinator.tick().await.unwrap();
        assert_eq!(dispatched, 2);
        assert_eq!(tc.coordinator.active_loops(), 2);

        // No capacity left; the third task stays queued.
        let dispatched = tc.coordinator.tick().await.unwrap();
        assert_eq!(dispatched, 0);

        let coordinator = Arc::clone(&tc.coordinator);
        let release = Arc::clone(&parked);
        wait_for(move || {
            release.release.notify_waiters();
            coordinator.active_loops() == 0
        })
        .await;

        let dispatched = tc.coordinator.tick().await.unwrap();
        assert_eq!(dispatched, 1);
        let coordinator = Arc::clone(&tc.coordinator);
        let release = Arc::clone(&parked);
        wait_for(move || {
            release.release.notify_waiters();
            coordinator.active_loops() == 0
        })
        .await;
    }

    #[tokio::test]
    async fn paused_mode_stops_dispatch() {
        let collab = Arc::new(InstantCollaborator { changed: vec![] });
        let tc = create_test_coordinator(permissive_policy(), collab, 2).await;
        tc.queue.enqueue(new_task("TASK-001")).await.unwrap();

        tc.coordinator
            .set_mode(KillSwitchMode::Paused, "operator")
            .await
            .unwrap();
        let dispatched = tc.coordinator.tick().await.unwrap();
        assert_eq!(dispatched, 0);

        // Back to normal, the task dispatches.
        tc.coordinator
            .set_mode(KillSwitchMode::Normal, "operator")
            .await
            .unwrap();
        let dispatched = tc.coordinator.tick().await.unwrap();
        assert_eq!(dispatched, 1);
    }

    #[tokio::test]
    async fn set_mode_is_audited() {
        let collab = Arc::new(InstantCollaborator { changed: vec![] });
        let tc = create_test_coordinator(permissive_policy(), collab, 1).await;

        tc.coordinator
            .set_mode(KillSwitchMode::Safe, "operator")
            .await
            .unwrap();
        // No-op change records nothing.
        tc.coordinator
            .set_mode(KillSwitchMode::Safe, "operator")
            .await
            .unwrap();

        let events = tc
            .storage
            .list_events(&Id::from_string(GLOBAL_EVENT_ID))
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "KILL_SWITCH_CHANGED");
        assert_eq!(events[0].actor, "operator");
    }

    #[tokio::test]
    async fn halt_condition_downgrades_to_paused() {
        // Escalation threshold of 1, so touching two resources blocks the
        // task and trips the halt condition.
        let collab = Arc::new(InstantCollaborator {
            changed: vec!["src/a.rs".to_string(), "src/b.rs".to_string()],
        });
        let tc = create_test_coordinator(halting_policy(), collab, 1).await;
        tc.queue.enqueue(new_task("TASK-001")).await.unwrap();

        tc.coordinator.tick().await.unwrap();
        let coordinator = Arc::clone(&tc.coordinator);
        wait_for(move || coordinator.mode() == KillSwitchMode::Paused).await;

        let task = tc
            .storage
            .get_task(&Id::from_string("TASK-001"))
            .await
            .unwrap();
        assert_eq!(task.state, TaskState::Blocked);
        assert_eq!(task.block_reason.as_deref(), Some("scope_escalation"));

        let events = tc
            .storage
            .list_events(&Id::from_string(GLOBAL_EVENT_ID))
            .await
            .unwrap();
        assert!(events
            .iter()
            .any(|e| e.event_type == "KILL_SWITCH_CHANGED" && e.actor == "policy"));
    }

    #[tokio::test]
    async fn off_cancels_in_flight_loops() {
        let parked = Arc::new(ParkedCollaborator {
            release: tokio::sync::Notify::new(),
        });
        let tc = create_test_coordinator(permissive_policy(), Arc::clone(&parked) as _, 1).await;
        tc.queue.enqueue(new_task("TASK-001")).await.unwrap();

        tc.coordinator.tick().await.unwrap();
        assert_eq!(tc.coordinator.active_loops(), 1);

        tc.coordinator
            .set_mode(KillSwitchMode::Off, "operator")
            .await
            .unwrap();
        // The parked attempt is interrupted by the cancelled token without
        // any release; the loop checkpoints and requeues.
        let coordinator = Arc::clone(&tc.coordinator);
        wait_for(move || coordinator.active_loops() == 0).await;

        let task = tc
            .storage
            .get_task(&Id::from_string("TASK-001"))
            .await
            .unwrap();
        assert_eq!(task.state, TaskState::Pending);
        assert_eq!(task.attempt_count, 0);

        // Still OFF: the requeued task does not redispatch.
        assert_eq!(tc.coordinator.tick().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn resume_requeues_interrupted_tasks() {
        let collab = Arc::new(InstantCollaborator { changed: vec![] });
        let tc = create_test_coordinator(permissive_policy(), collab, 1).await;
        tc.queue.enqueue(new_task("TASK-001")).await.unwrap();
        tc.queue.enqueue(new_task("TASK-002")).await.unwrap();

        // Simulate a crash mid-attempt: claimed but never finished.
        tc.queue.claim_next_ready("loop-1").await.unwrap().unwrap();

        let requeued = tc.coordinator.resume().await.unwrap();
        assert_eq!(requeued, 1);

        let task = tc
            .storage
            .get_task(&Id::from_string("TASK-001"))
            .await
            .unwrap();
        assert_eq!(task.state, TaskState::Pending);
        assert_eq!(task.attempt_count, 0);
        assert!(task.assigned_session.is_none());

        // Idempotent.
        let requeued = tc.coordinator.resume().await.unwrap();
        assert_eq!(requeued, 0);
    }

    #[tokio::test]
    async fn safe_mode_dispatches_only_whitelisted_kinds() {
        let collab = Arc::new(InstantCollaborator { changed: vec![] });
        let tc = create_test_coordinator(safe_policy(), collab, 4).await;
        tc.queue.enqueue(new_task("TASK-001")).await.unwrap();
        let mut doc = new_task("TASK-002");
        doc.kind = TaskKind::Doc;
        tc.queue.enqueue(doc).await.unwrap();

        tc.coordinator
            .set_mode(KillSwitchMode::Safe, "operator")
            .await
            .unwrap();
        let dispatched = tc.coordinator.tick().await.unwrap();
        assert_eq!(dispatched, 1);
        let coordinator = Arc::clone(&tc.coordinator);
        wait_for(move || coordinator.active_loops() == 0).await;

        let doc_task = tc
            .storage
            .get_task(&Id::from_string("TASK-002"))
            .await
            .unwrap();
        assert_eq!(doc_task.state, TaskState::Completed);

        // The feature task is held back, not blocked: normal mode picks
        // it up untouched.
        let feature = tc
            .storage
            .get_task(&Id::from_string("TASK-001"))
            .await
            .unwrap();
        assert_eq!(feature.state, TaskState::Pending);
        assert!(feature.block_reason.is_none());
        assert!(feature.assigned_session.is_none());

        tc.coordinator
            .set_mode(KillSwitchMode::Normal, "operator")
            .await
            .unwrap();
        assert_eq!(tc.coordinator.tick().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn concurrent_ticks_never_double_assign() {
        let ids = ["TASK-001", "TASK-002", "TASK-003", "TASK-004"];
        let parked = Arc::new(ParkedCollaborator {
            release: tokio::sync::Notify::new(),
        });
        let tc = create_test_coordinator(permissive_policy(), Arc::clone(&parked) as _, 4).await;
        for id in ids {
            tc.queue.enqueue(new_task(id)).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let coordinator = Arc::clone(&tc.coordinator);
            handles.push(tokio::spawn(async move { coordinator.tick().await }));
        }
        let mut total = 0;
        for handle in handles {
            total += handle.await.unwrap().unwrap();
        }
        // Four tasks, eight racing ticks: each task dispatched exactly once.
        assert_eq!(total, 4);

        for id in ids {
            let events = tc
                .storage
                .list_events(&Id::from_string(id))
                .await
                .unwrap();
            let assigned = events
                .iter()
                .filter(|e| e.event_type == "TASK_ASSIGNED")
                .count();
            assert_eq!(assigned, 1, "{id} assigned more than once");
        }

        let coordinator = Arc::clone(&tc.coordinator);
        let release = Arc::clone(&parked);
        wait_for(move || {
            release.release.notify_waiters();
            coordinator.active_loops() == 0
        })
        .await;
    }

    #[tokio::test]
    async fn resume_after_interrupt_reaches_terminal_state() {
        let collab = Arc::new(InstantCollaborator { changed: vec![] });
        let tc = create_test_coordinator(permissive_policy(), collab, 1).await;
        tc.queue.enqueue(new_task("TASK-001")).await.unwrap();

        // Claimed but never driven, as after a crash.
        tc.queue.claim_next_ready("loop-1").await.unwrap().unwrap();

        assert_eq!(tc.coordinator.resume().await.unwrap(), 1);
        assert_eq!(tc.coordinator.tick().await.unwrap(), 1);
        let coordinator = Arc::clone(&tc.coordinator);
        wait_for(move || coordinator.active_loops() == 0).await;

        let task = tc
            .storage
            .get_task(&Id::from_string("TASK-001"))
            .await
            .unwrap();
        assert_eq!(task.state, TaskState::Completed);
        assert_eq!(task.attempt_count, 1);

        // A second recovery pass finds nothing and leaves the outcome alone.
        assert_eq!(tc.coordinator.resume().await.unwrap(), 0);
        let task = tc
            .storage
            .get_task(&Id::from_string("TASK-001"))
            .await
            .unwrap();
        assert_eq!(task.state, TaskState::Completed);
    }
}
