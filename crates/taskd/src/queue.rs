//! Durable task queue with dependency-ordered dispatch.
//!
//! All state lives in storage; the queue enforces the lifecycle and the
//! dispatch total order (priority, then age, then id).

use std::sync::Arc;

use chrono::Utc;
use task_core::events::{
    EventPayload, TaskAssignedPayload, TaskCancelledPayload, TaskEnqueuedPayload,
    TaskResolvedPayload,
};
use task_core::{Id, Task, TaskKind, TaskState};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

use crate::storage::{Storage, StorageError};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("duplicate task id: {0}")]
    DuplicateTask(String),
    #[error("task {task} depends on unknown task {dependency}")]
    InvalidDependency { task: String, dependency: String },
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: TaskState, to: TaskState },
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// Parameters for enqueueing a new task.
#[derive(Debug, Clone)]
pub struct NewTask {
    /// Operator-supplied id; generated when absent.
    pub id: Option<Id>,
    pub title: String,
    pub kind: TaskKind,
    /// Lower value dispatches first.
    pub priority: i64,
    pub dependencies: Vec<Id>,
    pub max_attempts: u32,
}

/// The durable backlog.
pub struct TaskQueue {
    storage: Arc<Storage>,
    /// Serializes claim operations so concurrent ticks never hand the same
    /// task to two loops.
    claim_lock: Mutex<()>,
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue").finish_non_exhaustive()
    }
}

impl TaskQueue {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            claim_lock: Mutex::new(()),
        }
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Enqueue a new task in PENDING state.
    ///
    /// Rejects duplicate ids and dependencies on unknown tasks. Records a
    /// `TASK_ENQUEUED` audit event.
    pub async fn enqueue(&self, new_task: NewTask) -> Result<Task> {
        let id = new_task.id.unwrap_or_default();

        match self.storage.get_task(&id).await {
            Ok(_) => return Err(QueueError::DuplicateTask(id.to_string())),
            Err(StorageError::TaskNotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        for dep in &new_task.dependencies {
            if dep == &id {
                return Err(QueueError::InvalidDependency {
                    task: id.to_string(),
                    dependency: dep.to_string(),
                });
            }
            match self.storage.get_task(dep).await {
                Ok(_) => {}
                Err(StorageError::TaskNotFound(_)) => {
                    return Err(QueueError::InvalidDependency {
                        task: id.to_string(),
                        dependency: dep.to_string(),
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }

        let now = Utc::now();
        let task = Task {
            id: id.clone(),
            title: new_task.title,
            kind: new_task.kind,
            priority: new_task.priority,
            dependencies: new_task.dependencies,
            state: TaskState::Pending,
            attempt_count: 0,
            max_attempts: new_task.max_attempts,
            assigned_session: None,
            block_reason: None,
            created_at: now,
            updated_at: now,
        };
        // A concurrent enqueue of the same id can slip past the pre-check;
        // the PRIMARY KEY violation still maps to a duplicate rejection.
        if let Err(e) = self.storage.insert_task(&task).await {
            return Err(match e {
                StorageError::Duplicate(id) => QueueError::DuplicateTask(id),
                other => other.into(),
            });
        }

        let payload = EventPayload::TaskEnqueued(TaskEnqueuedPayload {
            task_id: task.id.clone(),
            title: task.title.clone(),
            kind: task.kind,
            priority: task.priority,
            dependencies: task.dependencies.clone(),
        });
        self.storage
            .append_event(&task.id, "coordinator", &payload)
            .await?;

        info!(task_id = %task.id, kind = task.kind.as_str(), "task enqueued");
        Ok(task)
    }

    /// The next dispatchable task, or None.
    ///
    /// A task is ready when it is PENDING, unassigned, and every dependency
    /// is COMPLETED. Tasks are considered in the dispatch total order.
    pub async fn next_ready(&self) -> Result<Option<Task>> {
        self.next_ready_matching(|_| true).await
    }

    /// Like `next_ready`, restricted to tasks the predicate accepts.
    /// Rejected tasks stay queued and keep their position.
    pub async fn next_ready_matching<F>(&self, eligible: F) -> Result<Option<Task>>
    where
        F: Fn(&Task) -> bool,
    {
        let pending = self.storage.list_tasks(Some(TaskState::Pending)).await?;

        for task in pending {
            if task.assigned_session.is_some() || !eligible(&task) {
                continue;
            }
            if self.dependencies_satisfied(&task).await? {
                return Ok(Some(task));
            }
        }
        Ok(None)
    }

    /// Atomically claim the next ready task for a collaborator session.
    ///
    /// Moves the task to IN_PROGRESS and records `TASK_ASSIGNED`.
    pub async fn claim_next_ready(&self, session: &str) -> Result<Option<Task>> {
        self.claim_next_ready_matching(session, |_| true).await
    }

    /// Claim the next ready task accepted by the predicate.
    pub async fn claim_next_ready_matching<F>(
        &self,
        session: &str,
        eligible: F,
    ) -> Result<Option<Task>>
    where
        F: Fn(&Task) -> bool,
    {
        let _lock = self.claim_lock.lock().await;

        let Some(task) = self.next_ready_matching(eligible).await? else {
            return Ok(None);
        };

        self.transition(&task.id, TaskState::InProgress, None)
            .await?;
        self.storage
            .update_assignment(&task.id, Some(session))
            .await?;

        let payload = EventPayload::TaskAssigned(TaskAssignedPayload {
            task_id: task.id.clone(),
            session: session.to_string(),
        });
        self.storage
            .append_event(&task.id, "coordinator", &payload)
            .await?;

        let claimed = self.storage.get_task(&task.id).await?;
        info!(task_id = %claimed.id, session = session, "task claimed");
        Ok(Some(claimed))
    }

    /// Validate and apply a lifecycle transition.
    ///
    /// `block_reason` is persisted alongside a BLOCKED transition and
    /// cleared on every other target state. Leaving IN_PROGRESS clears the
    /// session assignment.
    pub async fn transition(
        &self,
        id: &Id,
        to: TaskState,
        block_reason: Option<&str>,
    ) -> Result<Task> {
        let task = self.storage.get_task(id).await?;

        if !task.state.can_transition_to(to) {
            return Err(QueueError::InvalidTransition {
                from: task.state,
                to,
            });
        }

        let reason = if to == TaskState::Blocked {
            block_reason
        } else {
            None
        };
        self.storage.update_task_state(id, to, reason).await?;

        if task.state == TaskState::InProgress && to != TaskState::InProgress {
            self.storage.update_assignment(id, None).await?;
        }

        Ok(self.storage.get_task(id).await?)
    }

    /// Resolve a BLOCKED task back to PENDING (human action).
    ///
    /// Clears `block_reason`, resets the attempt budget, and records
    /// `TASK_RESOLVED`.
    pub async fn resolve(&self, id: &Id, actor: &str, note: Option<String>) -> Result<Task> {
        let task = self.storage.get_task(id).await?;
        if task.state != TaskState::Blocked {
            return Err(QueueError::InvalidTransition {
                from: task.state,
                to: TaskState::Pending,
            });
        }

        self.transition(id, TaskState::Pending, None).await?;
        // Human resolution grants a fresh attempt budget; without the reset
        // an attempts_exhausted task would re-block immediately.
        self.storage.update_attempt_count(id, 0).await?;

        let payload = EventPayload::TaskResolved(TaskResolvedPayload {
            task_id: id.clone(),
            actor: actor.to_string(),
            note,
        });
        self.storage.append_event(id, actor, &payload).await?;

        info!(task_id = %id, actor = actor, "task resolved");
        Ok(self.storage.get_task(id).await?)
    }

    /// Cancel a non-terminal task. Records `TASK_CANCELLED`.
    pub async fn cancel(&self, id: &Id, actor: &str) -> Result<Task> {
        let task = self.storage.get_task(id).await?;
        let cancelled = self.transition(id, TaskState::Cancelled, None).await?;

        let payload = EventPayload::TaskCancelled(TaskCancelledPayload {
            task_id: id.clone(),
            actor: actor.to_string(),
            previous_state: task.state,
        });
        self.storage.append_event(id, actor, &payload).await?;

        info!(task_id = %id, actor = actor, "task cancelled");
        Ok(cancelled)
    }

    /// Counts per state.
    pub async fn summary(&self) -> Result<Vec<(TaskState, u64)>> {
        Ok(self.storage.counts_by_state().await?)
    }

    async fn dependencies_satisfied(&self, task: &Task) -> Result<bool> {
        for dep in &task.dependencies {
            let dep_task = self.storage.get_task(dep).await?;
            if dep_task.state != TaskState::Completed {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct TestQueue {
        queue: TaskQueue,
        _dir: TempDir,
    }

    async fn create_test_queue() -> TestQueue {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("test.db");
        let storage = Storage::new(&db_path).await.unwrap();
        storage.migrate_embedded().await.unwrap();
        TestQueue {
            queue: TaskQueue::new(Arc::new(storage)),
            _dir: dir,
        }
    }

    fn new_task(id: &str, priority: i64) -> NewTask {
        NewTask {
            id: Some(Id::from_string(id)),
            title: format!("task {id}"),
            kind: TaskKind::Feature,
            priority,
            dependencies: vec![],
            max_attempts: 5,
        }
    }

    #[tokio::test]
    async fn enqueue_creates_pending_task_with_audit_event() {
        let tq = create_test_queue().await;
        let task = tq.queue.enqueue(new_task("TASK-001", 1)).await.unwrap();

        assert_eq!(task.state, TaskState::Pending);
        assert_eq!(task.attempt_count, 0);

        let events = tq.queue.storage().list_events(&task.id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "TASK_ENQUEUED");
    }

    #[tokio::test]
    async fn enqueue_rejects_duplicate_id() {
        let tq = create_test_queue().await;
        tq.queue.enqueue(new_task("TASK-001", 1)).await.unwrap();

        let result = tq.queue.enqueue(new_task("TASK-001", 2)).await;
        assert!(matches!(result, Err(QueueError::DuplicateTask(_))));
    }

    #[tokio::test]
    async fn enqueue_rejects_unknown_dependency() {
        let tq = create_test_queue().await;
        let mut task = new_task("TASK-001", 1);
        task.dependencies = vec![Id::from_string("TASK-999")];

        let result = tq.queue.enqueue(task).await;
        assert!(matches!(
            result,
            Err(QueueError::InvalidDependency { .. })
        ));
    }

    #[tokio::test]
    async fn enqueue_rejects_self_dependency() {
        let tq = create_test_queue().await;
        let mut task = new_task("TASK-001", 1);
        task.dependencies = vec![Id::from_string("TASK-001")];

        let result = tq.queue.enqueue(task).await;
        assert!(matches!(
            result,
            Err(QueueError::InvalidDependency { .. })
        ));
    }

    #[tokio::test]
    async fn next_ready_respects_priority_order() {
        let tq = create_test_queue().await;
        tq.queue.enqueue(new_task("TASK-LOW", 5)).await.unwrap();
        tq.queue.enqueue(new_task("TASK-HIGH", 1)).await.unwrap();

        let next = tq.queue.next_ready().await.unwrap().unwrap();
        assert_eq!(next.id.as_ref(), "TASK-HIGH");
    }

    #[tokio::test]
    async fn next_ready_orders_equal_priority_deterministically() {
        let tq = create_test_queue().await;
        tq.queue.enqueue(new_task("TASK-A", 1)).await.unwrap();
        tq.queue.enqueue(new_task("TASK-B", 1)).await.unwrap();

        // Equal priority falls back to created_at, then lexical id; both
        // rules pick TASK-A here.
        let next = tq.queue.next_ready().await.unwrap().unwrap();
        assert_eq!(next.id.as_ref(), "TASK-A");
    }

    #[tokio::test]
    async fn next_ready_gates_on_dependencies() {
        let tq = create_test_queue().await;
        tq.queue.enqueue(new_task("TASK-001", 1)).await.unwrap();
        let mut dependent = new_task("TASK-002", 0);
        dependent.dependencies = vec![Id::from_string("TASK-001")];
        tq.queue.enqueue(dependent).await.unwrap();

        // TASK-002 is more urgent but its dependency is not COMPLETED.
        let next = tq.queue.next_ready().await.unwrap().unwrap();
        assert_eq!(next.id.as_ref(), "TASK-001");

        // Complete the dependency; TASK-002 becomes dispatchable.
        tq.queue
            .transition(
                &Id::from_string("TASK-001"),
                TaskState::InProgress,
                None,
            )
            .await
            .unwrap();
        tq.queue
            .transition(&Id::from_string("TASK-001"), TaskState::Completed, None)
            .await
            .unwrap();

        let next = tq.queue.next_ready().await.unwrap().unwrap();
        assert_eq!(next.id.as_ref(), "TASK-002");
    }

    #[tokio::test]
    async fn cancelled_dependency_never_satisfies() {
        let tq = create_test_queue().await;
        tq.queue.enqueue(new_task("TASK-001", 1)).await.unwrap();
        let mut dependent = new_task("TASK-002", 1);
        dependent.dependencies = vec![Id::from_string("TASK-001")];
        tq.queue.enqueue(dependent).await.unwrap();

        tq.queue
            .cancel(&Id::from_string("TASK-001"), "operator")
            .await
            .unwrap();

        let next = tq.queue.next_ready().await.unwrap();
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn next_ready_matching_skips_rejected_tasks() {
        let tq = create_test_queue().await;
        tq.queue.enqueue(new_task("TASK-001", 1)).await.unwrap();
        let mut doc = new_task("TASK-002", 2);
        doc.kind = TaskKind::Doc;
        tq.queue.enqueue(doc).await.unwrap();

        let next = tq
            .queue
            .next_ready_matching(|t| t.kind == TaskKind::Doc)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.id.as_ref(), "TASK-002");

        // The skipped task stays dispatchable without the filter.
        let next = tq.queue.next_ready().await.unwrap().unwrap();
        assert_eq!(next.id.as_ref(), "TASK-001");
    }

    #[tokio::test]
    async fn claim_assigns_session_and_excludes_from_ready() {
        let tq = create_test_queue().await;
        tq.queue.enqueue(new_task("TASK-001", 1)).await.unwrap();

        let claimed = tq
            .queue
            .claim_next_ready("session-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.state, TaskState::InProgress);
        assert_eq!(claimed.assigned_session.as_deref(), Some("session-1"));

        let next = tq.queue.claim_next_ready("session-2").await.unwrap();
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn transition_rejects_invalid_moves() {
        let tq = create_test_queue().await;
        let task = tq.queue.enqueue(new_task("TASK-001", 1)).await.unwrap();

        // PENDING -> COMPLETED is not in the lifecycle.
        let result = tq
            .queue
            .transition(&task.id, TaskState::Completed, None)
            .await;
        assert!(matches!(
            result,
            Err(QueueError::InvalidTransition {
                from: TaskState::Pending,
                to: TaskState::Completed,
            })
        ));
    }

    #[tokio::test]
    async fn terminal_states_are_immutable() {
        let tq = create_test_queue().await;
        let task = tq.queue.enqueue(new_task("TASK-001", 1)).await.unwrap();
        tq.queue.cancel(&task.id, "operator").await.unwrap();

        let result = tq
            .queue
            .transition(&task.id, TaskState::Pending, None)
            .await;
        assert!(matches!(result, Err(QueueError::InvalidTransition { .. })));

        // Cancelling again is also invalid.
        let result = tq.queue.cancel(&task.id, "operator").await;
        assert!(matches!(result, Err(QueueError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn leaving_in_progress_clears_assignment() {
        let tq = create_test_queue().await;
        tq.queue.enqueue(new_task("TASK-001", 1)).await.unwrap();
        let claimed = tq
            .queue
            .claim_next_ready("session-1")
            .await
            .unwrap()
            .unwrap();

        let done = tq
            .queue
            .transition(&claimed.id, TaskState::Completed, None)
            .await
            .unwrap();
        assert!(done.assigned_session.is_none());
    }

    #[tokio::test]
    async fn resolve_clears_block_reason_and_resets_budget() {
        let tq = create_test_queue().await;
        tq.queue.enqueue(new_task("TASK-001", 1)).await.unwrap();
        let id = Id::from_string("TASK-001");

        tq.queue
            .transition(&id, TaskState::InProgress, None)
            .await
            .unwrap();
        tq.queue.storage().update_attempt_count(&id, 5).await.unwrap();
        tq.queue
            .transition(&id, TaskState::Blocked, Some("attempts_exhausted"))
            .await
            .unwrap();

        let resolved = tq
            .queue
            .resolve(&id, "operator", Some("retry after fix".to_string()))
            .await
            .unwrap();
        assert_eq!(resolved.state, TaskState::Pending);
        assert!(resolved.block_reason.is_none());
        assert_eq!(resolved.attempt_count, 0);

        let events = tq.queue.storage().list_events(&id).await.unwrap();
        assert!(events.iter().any(|e| e.event_type == "TASK_RESOLVED"));
    }

    #[tokio::test]
    async fn resolve_rejects_non_blocked_task() {
        let tq = create_test_queue().await;
        let task = tq.queue.enqueue(new_task("TASK-001", 1)).await.unwrap();

        let result = tq.queue.resolve(&task.id, "operator", None).await;
        assert!(matches!(result, Err(QueueError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn summary_counts_states() {
        let tq = create_test_queue().await;
        tq.queue.enqueue(new_task("TASK-001", 1)).await.unwrap();
        tq.queue.enqueue(new_task("TASK-002", 1)).await.unwrap();
        tq.queue
            .cancel(&Id::from_string("TASK-002"), "operator")
            .await
            .unwrap();

        let summary = tq.queue.summary().await.unwrap();
        let pending = summary
            .iter()
            .find(|(s, _)| *s == TaskState::Pending)
            .map(|(_, c)| *c);
        let cancelled = summary
            .iter()
            .find(|(s, _)| *s == TaskState::Cancelled)
            .map(|(_, c)| *c);
        assert_eq!(pending, Some(1));
        assert_eq!(cancelled, Some(1));
    }
}
