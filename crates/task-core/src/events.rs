//! Event types for the audit log.
//!
//! Every state transition, verdict, and kill-switch change is appended to
//! the audit log with one of these event types and a typed JSON payload.

use serde::{Deserialize, Serialize};

use crate::types::{Decision, Id, KillSwitchMode, LoopPhase, TaskKind, TaskState, VerdictReason};

/// Audit event type names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    TaskEnqueued,
    TaskAssigned,
    AttemptStarted,
    AttemptFinished,
    VerdictRecorded,
    TaskCompleted,
    TaskBlocked,
    TaskRequeued,
    TaskResolved,
    TaskCancelled,
    KillSwitchChanged,
    CheckpointSaved,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskEnqueued => "TASK_ENQUEUED",
            Self::TaskAssigned => "TASK_ASSIGNED",
            Self::AttemptStarted => "ATTEMPT_STARTED",
            Self::AttemptFinished => "ATTEMPT_FINISHED",
            Self::VerdictRecorded => "VERDICT_RECORDED",
            Self::TaskCompleted => "TASK_COMPLETED",
            Self::TaskBlocked => "TASK_BLOCKED",
            Self::TaskRequeued => "TASK_REQUEUED",
            Self::TaskResolved => "TASK_RESOLVED",
            Self::TaskCancelled => "TASK_CANCELLED",
            Self::KillSwitchChanged => "KILL_SWITCH_CHANGED",
            Self::CheckpointSaved => "CHECKPOINT_SAVED",
        }
    }
}

/// Payload for TASK_ENQUEUED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEnqueuedPayload {
    pub task_id: Id,
    pub title: String,
    pub kind: TaskKind,
    pub priority: i64,
    pub dependencies: Vec<Id>,
}

/// Payload for TASK_ASSIGNED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAssignedPayload {
    pub task_id: Id,
    pub session: String,
}

/// Payload for ATTEMPT_STARTED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptStartedPayload {
    pub attempt_id: Id,
    pub task_id: Id,
    pub sequence_number: u32,
}

/// Payload for ATTEMPT_FINISHED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptFinishedPayload {
    pub attempt_id: Id,
    pub task_id: Id,
    pub sequence_number: u32,
    pub decision: Decision,
    pub duration_ms: u64,
}

/// Payload for VERDICT_RECORDED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerdictRecordedPayload {
    pub task_id: Id,
    pub decision: Decision,
    pub reason: VerdictReason,
    pub summary: String,
}

/// Payload for TASK_COMPLETED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCompletedPayload {
    pub task_id: Id,
    pub attempt_count: u32,
}

/// Payload for TASK_BLOCKED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskBlockedPayload {
    pub task_id: Id,
    pub reason: String,
}

/// Payload for TASK_REQUEUED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequeuedPayload {
    pub task_id: Id,
    pub reason: String,
    /// True when the requeue did not consume attempt budget.
    pub transient: bool,
}

/// Payload for TASK_RESOLVED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResolvedPayload {
    pub task_id: Id,
    pub actor: String,
    pub note: Option<String>,
}

/// Payload for TASK_CANCELLED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCancelledPayload {
    pub task_id: Id,
    pub actor: String,
    pub previous_state: TaskState,
}

/// Payload for KILL_SWITCH_CHANGED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillSwitchChangedPayload {
    pub previous: KillSwitchMode,
    pub current: KillSwitchMode,
    pub actor: String,
}

/// Payload for CHECKPOINT_SAVED event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointSavedPayload {
    pub task_id: Id,
    pub sequence_number: u32,
    pub phase: LoopPhase,
}

/// Union type for all event payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    TaskEnqueued(TaskEnqueuedPayload),
    TaskAssigned(TaskAssignedPayload),
    AttemptStarted(AttemptStartedPayload),
    AttemptFinished(AttemptFinishedPayload),
    VerdictRecorded(VerdictRecordedPayload),
    TaskCompleted(TaskCompletedPayload),
    TaskBlocked(TaskBlockedPayload),
    TaskRequeued(TaskRequeuedPayload),
    TaskResolved(TaskResolvedPayload),
    TaskCancelled(TaskCancelledPayload),
    KillSwitchChanged(KillSwitchChangedPayload),
    CheckpointSaved(CheckpointSavedPayload),
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::TaskEnqueued(_) => EventType::TaskEnqueued,
            Self::TaskAssigned(_) => EventType::TaskAssigned,
            Self::AttemptStarted(_) => EventType::AttemptStarted,
            Self::AttemptFinished(_) => EventType::AttemptFinished,
            Self::VerdictRecorded(_) => EventType::VerdictRecorded,
            Self::TaskCompleted(_) => EventType::TaskCompleted,
            Self::TaskBlocked(_) => EventType::TaskBlocked,
            Self::TaskRequeued(_) => EventType::TaskRequeued,
            Self::TaskResolved(_) => EventType::TaskResolved,
            Self::TaskCancelled(_) => EventType::TaskCancelled,
            Self::KillSwitchChanged(_) => EventType::KillSwitchChanged,
            Self::CheckpointSaved(_) => EventType::CheckpointSaved,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
