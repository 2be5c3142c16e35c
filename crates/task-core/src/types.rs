//! Core types for the task orchestration daemon.
//!
//! Task, Attempt, Checkpoint, Verdict, and the kill-switch mode shared by
//! every component.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for tasks, attempts, and audit events.
/// Generated ids use `UUIDv7` for time-ordered lexicographic sorting;
/// operator-supplied task ids (e.g. `TASK-001`) are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// --- Enumerations ---

/// The closed set of work-item categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Feature,
    Bugfix,
    Refactor,
    Test,
    Doc,
    Infra,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Feature => "feature",
            Self::Bugfix => "bugfix",
            Self::Refactor => "refactor",
            Self::Test => "test",
            Self::Doc => "doc",
            Self::Infra => "infra",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "feature" => Some(Self::Feature),
            "bugfix" => Some(Self::Bugfix),
            "refactor" => Some(Self::Refactor),
            "test" => Some(Self::Test),
            "doc" => Some(Self::Doc),
            "infra" => Some(Self::Infra),
            _ => None,
        }
    }

    pub const ALL: [Self; 6] = [
        Self::Feature,
        Self::Bugfix,
        Self::Refactor,
        Self::Test,
        Self::Doc,
        Self::Infra,
    ];
}

/// Task lifecycle state.
///
/// `PENDING -> IN_PROGRESS -> {COMPLETED | BLOCKED | CANCELLED}`.
/// `BLOCKED -> PENDING` only via explicit human resolution;
/// `IN_PROGRESS -> PENDING` on transient infra failure.
/// Terminal states are immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    InProgress,
    Completed,
    Blocked,
    Cancelled,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Blocked => "BLOCKED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "IN_PROGRESS" => Some(Self::InProgress),
            "COMPLETED" => Some(Self::Completed),
            "BLOCKED" => Some(Self::Blocked),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Whether the lifecycle allows moving from `self` to `to`.
    pub fn can_transition_to(&self, to: Self) -> bool {
        match (self, to) {
            (Self::Pending, Self::InProgress | Self::Cancelled) => true,
            // IN_PROGRESS -> PENDING is the transient-infra requeue path.
            (
                Self::InProgress,
                Self::Completed | Self::Blocked | Self::Cancelled | Self::Pending,
            ) => true,
            // BLOCKED -> PENDING requires explicit human resolution.
            (Self::Blocked, Self::Pending | Self::Cancelled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Process-wide dispatch gate. Mutated only by explicit operator command,
/// with one exception: a policy halt condition downgrades to PAUSED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KillSwitchMode {
    /// No dispatch at all; in-flight attempts abort at the next checkpoint.
    Off,
    /// Dispatch allowed only for whitelisted task kinds.
    Safe,
    /// Full operation.
    #[default]
    Normal,
    /// Queue frozen; in-flight attempts finish, no new dispatch.
    Paused,
}

impl KillSwitchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Safe => "safe",
            Self::Normal => "normal",
            Self::Paused => "paused",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "off" => Some(Self::Off),
            "safe" => Some(Self::Safe),
            "normal" => Some(Self::Normal),
            "paused" => Some(Self::Paused),
            _ => None,
        }
    }
}

/// Governance decision for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Pass,
    Fail,
    Blocked,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
            Self::Blocked => "BLOCKED",
        }
    }
}

/// Structured reason attached to a verdict. The `code` discriminant is what
/// appears in the audit log and in `Task.block_reason`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum VerdictReason {
    /// All tiers passed and no policy rule fired.
    Clean,
    /// Kill switch is OFF; the attempt was never inspected.
    KillSwitchOff,
    /// SAFE mode and the task kind is not whitelisted.
    KindNotWhitelisted { kind: TaskKind },
    /// A changed resource matched a forbidden action.
    ForbiddenAction { action: String },
    /// A numeric policy ceiling was exceeded.
    LimitExceeded {
        limit: String,
        value: u64,
        ceiling: u64,
    },
    /// The attempt footprint crossed the escalation threshold.
    ScopeEscalation { touched: u64, threshold: u64 },
    /// A verification tier failed.
    TierFailed { tier: String },
    /// Collaborator or verifier call timed out.
    Timeout { stage: String },
    /// Collaborator produced output the daemon could not parse.
    MalformedOutput,
    /// Collaborator declared inability to proceed.
    CollaboratorDeclined,
    /// Retry budget exhausted; distinct from a policy violation.
    AttemptsExhausted,
}

impl VerdictReason {
    /// Stable reason code, as stored in the audit log.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Clean => "clean",
            Self::KillSwitchOff => "kill_switch_off",
            Self::KindNotWhitelisted { .. } => "kind_not_whitelisted",
            Self::ForbiddenAction { .. } => "forbidden_action",
            Self::LimitExceeded { .. } => "limit_exceeded",
            Self::ScopeEscalation { .. } => "scope_escalation",
            Self::TierFailed { .. } => "tier_failed",
            Self::Timeout { .. } => "timeout",
            Self::MalformedOutput => "malformed_output",
            Self::CollaboratorDeclined => "collaborator_declined",
            Self::AttemptsExhausted => "attempts_exhausted",
        }
    }
}

/// Outcome of governance evaluation for one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub decision: Decision,
    pub reason: VerdictReason,
    pub summary: String,
}

impl Verdict {
    pub fn pass(summary: impl Into<String>) -> Self {
        Self {
            decision: Decision::Pass,
            reason: VerdictReason::Clean,
            summary: summary.into(),
        }
    }

    pub fn fail(reason: VerdictReason, summary: impl Into<String>) -> Self {
        Self {
            decision: Decision::Fail,
            reason,
            summary: summary.into(),
        }
    }

    pub fn blocked(reason: VerdictReason, summary: impl Into<String>) -> Self {
        Self {
            decision: Decision::Blocked,
            reason,
            summary: summary.into(),
        }
    }

    pub fn is_pass(&self) -> bool {
        self.decision == Decision::Pass
    }

    pub fn is_blocked(&self) -> bool {
        self.decision == Decision::Blocked
    }
}

// --- Core types ---

/// A unit of work in the backlog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Id,
    pub title: String,
    pub kind: TaskKind,
    /// Lower value dispatches first (1 = most urgent).
    pub priority: i64,
    /// Ids of tasks that must be COMPLETED before this one may start.
    pub dependencies: Vec<Id>,
    pub state: TaskState,
    /// Number of attempts consumed. Never decreases, never exceeds `max_attempts`.
    pub attempt_count: u32,
    pub max_attempts: u32,
    /// Collaborator session holding this task while IN_PROGRESS.
    pub assigned_session: Option<String>,
    /// Reason code recorded when the task entered BLOCKED.
    pub block_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Result of one verification tier for one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierResult {
    pub tier: String,
    pub passed: bool,
    pub diagnostics: String,
    pub duration_ms: u64,
}

/// One execution try for a task. Attempts are strictly ordered by
/// `sequence_number`; only the most recent may be non-terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    pub id: Id,
    pub task_id: Id,
    pub sequence_number: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Tier results in execution order.
    pub verifier_results: Vec<TierResult>,
    /// Set once the attempt has been through governance.
    pub verdict: Option<Verdict>,
    /// Resource identifiers touched by the collaborator.
    pub changed_resources: Vec<String>,
}

/// Iteration-loop phase recorded in checkpoints for resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopPhase {
    Attempting,
    Verifying,
    Deciding,
    Retrying,
    Done,
    Blocked,
}

impl LoopPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Attempting => "attempting",
            Self::Verifying => "verifying",
            Self::Deciding => "deciding",
            Self::Retrying => "retrying",
            Self::Done => "done",
            Self::Blocked => "blocked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "attempting" => Some(Self::Attempting),
            "verifying" => Some(Self::Verifying),
            "deciding" => Some(Self::Deciding),
            "retrying" => Some(Self::Retrying),
            "done" => Some(Self::Done),
            "blocked" => Some(Self::Blocked),
            _ => None,
        }
    }
}

/// Durable snapshot of a task's progress. Append-only; the latest checkpoint
/// per task id is authoritative on resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub task_id: Id,
    /// Attempt sequence number this snapshot belongs to.
    pub sequence_number: u32,
    pub phase: LoopPhase,
    pub status: TaskState,
    pub attempt_count: u32,
    /// Failure diagnostics forwarded into the next attempt's context.
    pub next_steps: Vec<String>,
    /// Arbitrary key/value context.
    pub context: BTreeMap<String, String>,
    pub saved_at: DateTime<Utc>,
}

/// An entry in the append-only audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Id,
    pub task_id: Id,
    /// Who caused the entry: `coordinator`, `gate`, `operator`, or `policy`.
    pub actor: String,
    /// Event type name (e.g. `VERDICT_RECORDED`).
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    /// JSON payload with event-specific data.
    pub payload_json: String,
}
