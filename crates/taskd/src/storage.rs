//! SQLite storage module for the task orchestration daemon.
//!
//! Persists tasks, attempts, checkpoints (append-only), and the audit log.

use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use task_core::events::EventPayload;
use task_core::{
    Attempt, AuditEvent, Checkpoint, Id, LoopPhase, Task, TaskKind, TaskState, TierResult, Verdict,
};
use thiserror::Error;

/// Explicit column list for tasks table queries.
/// Using explicit columns instead of SELECT * ensures correct mapping
/// regardless of column order in the database.
const TASKS_COLUMNS: &str = "id, title, kind, priority, dependencies_json, state, \
    attempt_count, max_attempts, assigned_session, block_reason, created_at, updated_at";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("task not found: {0}")]
    TaskNotFound(String),
    #[error("duplicate id: {0}")]
    Duplicate(String),
    #[error("attempt not found: {0}")]
    AttemptNotFound(String),
    #[error("corrupt persisted state ({context}): {detail}")]
    Corrupt { context: String, detail: String },
}

impl StorageError {
    fn corrupt(context: impl Into<String>, detail: impl std::fmt::Display) -> Self {
        Self::Corrupt {
            context: context.into(),
            detail: detail.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Storage backend for the daemon.
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage").finish_non_exhaustive()
    }
}

impl Storage {
    /// Create a new storage instance with the given database path.
    pub async fn new(db_path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        // Enable WAL mode
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    /// Run embedded migrations (compiled in via include_str!).
    pub async fn migrate_embedded(&self) -> Result<()> {
        let migrations = [include_str!("../../../migrations/0001_init.sql")];

        for migration_sql in migrations {
            // Remove comment lines before splitting.
            let cleaned: String = migration_sql
                .lines()
                .filter(|line| !line.trim().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");

            for statement in cleaned.split(';') {
                let trimmed = statement.trim();
                if !trimmed.is_empty() {
                    match sqlx::query(trimmed).execute(&self.pool).await {
                        Ok(_) => {}
                        Err(e) => {
                            let msg = e.to_string();
                            // Ignore expected idempotent errors (duplicate column, table exists).
                            if !msg.contains("duplicate column") && !msg.contains("already exists")
                            {
                                return Err(e.into());
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    // --- Task operations ---

    /// Insert a new task.
    pub async fn insert_task(&self, task: &Task) -> Result<()> {
        let dependencies_json = serde_json::to_string(&task.dependencies)?;

        sqlx::query(
            r#"
            INSERT INTO tasks (id, title, kind, priority, dependencies_json, state,
                               attempt_count, max_attempts, assigned_session, block_reason,
                               created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
        )
        .bind(task.id.as_ref())
        .bind(&task.title)
        .bind(task.kind.as_str())
        .bind(task.priority)
        .bind(&dependencies_json)
        .bind(task.state.as_str())
        .bind(i64::from(task.attempt_count))
        .bind(i64::from(task.max_attempts))
        .bind(task.assigned_session.as_deref())
        .bind(task.block_reason.as_deref())
        .bind(task.created_at.timestamp_millis())
        .bind(task.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            // A concurrent insert of the same id surfaces as a PRIMARY KEY
            // violation rather than through the caller's pre-check.
            if matches!(&e, sqlx::Error::Database(db) if db.is_unique_violation()) {
                StorageError::Duplicate(task.id.to_string())
            } else {
                StorageError::Database(e)
            }
        })?;

        Ok(())
    }

    /// Get a task by ID.
    pub async fn get_task(&self, id: &Id) -> Result<Task> {
        let query = format!("SELECT {TASKS_COLUMNS} FROM tasks WHERE id = ?1");
        let row = sqlx::query_as::<_, TaskRow>(&query)
            .bind(id.as_ref())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::TaskNotFound(id.to_string()))?;

        row.into_task()
    }

    /// List tasks, optionally filtered by state, in dispatch order.
    pub async fn list_tasks(&self, state: Option<TaskState>) -> Result<Vec<Task>> {
        let rows = match state {
            Some(s) => {
                let query = format!(
                    "SELECT {TASKS_COLUMNS} FROM tasks WHERE state = ?1 \
                     ORDER BY priority ASC, created_at ASC, id ASC"
                );
                sqlx::query_as::<_, TaskRow>(&query)
                    .bind(s.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let query = format!(
                    "SELECT {TASKS_COLUMNS} FROM tasks \
                     ORDER BY priority ASC, created_at ASC, id ASC"
                );
                sqlx::query_as::<_, TaskRow>(&query)
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.into_iter().map(TaskRow::into_task).collect()
    }

    /// Update task state, setting or clearing the block reason.
    pub async fn update_task_state(
        &self,
        id: &Id,
        state: TaskState,
        block_reason: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "UPDATE tasks SET state = ?1, block_reason = ?2, updated_at = ?3 WHERE id = ?4",
        )
        .bind(state.as_str())
        .bind(block_reason)
        .bind(now)
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::TaskNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Set or clear the collaborator session holding a task.
    pub async fn update_assignment(&self, id: &Id, session: Option<&str>) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let result =
            sqlx::query("UPDATE tasks SET assigned_session = ?1, updated_at = ?2 WHERE id = ?3")
                .bind(session)
                .bind(now)
                .bind(id.as_ref())
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::TaskNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Record the attempt count after an attempt consumed budget.
    pub async fn update_attempt_count(&self, id: &Id, attempt_count: u32) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let result =
            sqlx::query("UPDATE tasks SET attempt_count = ?1, updated_at = ?2 WHERE id = ?3")
                .bind(i64::from(attempt_count))
                .bind(now)
                .bind(id.as_ref())
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::TaskNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Count tasks per state from one GROUP BY query.
    pub async fn counts_by_state(&self) -> Result<Vec<(TaskState, u64)>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM tasks GROUP BY state")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = Vec::with_capacity(rows.len());
        for (state, count) in rows {
            let state = TaskState::parse(&state)
                .ok_or_else(|| StorageError::corrupt("tasks.state", &state))?;
            counts.push((state, count as u64));
        }
        Ok(counts)
    }

    // --- Attempt operations ---

    /// Insert a new attempt.
    pub async fn insert_attempt(&self, attempt: &Attempt) -> Result<()> {
        let verifier_results_json = serde_json::to_string(&attempt.verifier_results)?;
        let verdict_json = attempt
            .verdict
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let changed_resources_json = serde_json::to_string(&attempt.changed_resources)?;

        sqlx::query(
            r#"
            INSERT INTO attempts (id, task_id, sequence_number, started_at, ended_at,
                                  verifier_results_json, verdict_json, changed_resources_json)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(attempt.id.as_ref())
        .bind(attempt.task_id.as_ref())
        .bind(i64::from(attempt.sequence_number))
        .bind(attempt.started_at.timestamp_millis())
        .bind(attempt.ended_at.map(|t| t.timestamp_millis()))
        .bind(&verifier_results_json)
        .bind(verdict_json)
        .bind(&changed_resources_json)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Finalize an attempt with its results and verdict.
    pub async fn finish_attempt(
        &self,
        id: &Id,
        verifier_results: &[TierResult],
        verdict: &Verdict,
        changed_resources: &[String],
    ) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let verifier_results_json = serde_json::to_string(verifier_results)?;
        let verdict_json = serde_json::to_string(verdict)?;
        let changed_resources_json = serde_json::to_string(changed_resources)?;

        let result = sqlx::query(
            "UPDATE attempts SET ended_at = ?1, verifier_results_json = ?2, \
             verdict_json = ?3, changed_resources_json = ?4 WHERE id = ?5",
        )
        .bind(now)
        .bind(&verifier_results_json)
        .bind(&verdict_json)
        .bind(&changed_resources_json)
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::AttemptNotFound(id.to_string()));
        }
        Ok(())
    }

    /// List attempts for a task in sequence order.
    pub async fn list_attempts(&self, task_id: &Id) -> Result<Vec<Attempt>> {
        let rows = sqlx::query_as::<_, AttemptRow>(
            "SELECT * FROM attempts WHERE task_id = ?1 ORDER BY sequence_number ASC",
        )
        .bind(task_id.as_ref())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(AttemptRow::into_attempt).collect()
    }

    /// Highest attempt sequence number recorded for a task (0 when none).
    pub async fn max_attempt_sequence(&self, task_id: &Id) -> Result<u32> {
        let (max,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(MAX(sequence_number), 0) FROM attempts WHERE task_id = ?1",
        )
        .bind(task_id.as_ref())
        .fetch_one(&self.pool)
        .await?;
        Ok(max as u32)
    }

    /// The most recent attempt for a task, if any.
    pub async fn latest_attempt(&self, task_id: &Id) -> Result<Option<Attempt>> {
        let row = sqlx::query_as::<_, AttemptRow>(
            "SELECT * FROM attempts WHERE task_id = ?1 ORDER BY sequence_number DESC LIMIT 1",
        )
        .bind(task_id.as_ref())
        .fetch_optional(&self.pool)
        .await?;

        row.map(AttemptRow::into_attempt).transpose()
    }

    // --- Checkpoint operations ---

    /// Append a checkpoint. The table is append-only; the newest row per
    /// task id wins on resume.
    pub async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let next_steps_json = serde_json::to_string(&checkpoint.next_steps)?;
        let context_json = serde_json::to_string(&checkpoint.context)?;

        sqlx::query(
            r#"
            INSERT INTO checkpoints (task_id, sequence_number, phase, status, attempt_count,
                                     next_steps_json, context_json, saved_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(checkpoint.task_id.as_ref())
        .bind(i64::from(checkpoint.sequence_number))
        .bind(checkpoint.phase.as_str())
        .bind(checkpoint.status.as_str())
        .bind(i64::from(checkpoint.attempt_count))
        .bind(&next_steps_json)
        .bind(&context_json)
        .bind(checkpoint.saved_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// The authoritative (latest) checkpoint for a task, if any.
    pub async fn latest_checkpoint(&self, task_id: &Id) -> Result<Option<Checkpoint>> {
        let row = sqlx::query_as::<_, CheckpointRow>(
            "SELECT task_id, sequence_number, phase, status, attempt_count, \
             next_steps_json, context_json, saved_at \
             FROM checkpoints WHERE task_id = ?1 ORDER BY seq DESC LIMIT 1",
        )
        .bind(task_id.as_ref())
        .fetch_optional(&self.pool)
        .await?;

        row.map(CheckpointRow::into_checkpoint).transpose()
    }

    /// Full checkpoint history for a task, oldest first.
    pub async fn list_checkpoints(&self, task_id: &Id) -> Result<Vec<Checkpoint>> {
        let rows = sqlx::query_as::<_, CheckpointRow>(
            "SELECT task_id, sequence_number, phase, status, attempt_count, \
             next_steps_json, context_json, saved_at \
             FROM checkpoints WHERE task_id = ?1 ORDER BY seq ASC",
        )
        .bind(task_id.as_ref())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(CheckpointRow::into_checkpoint)
            .collect()
    }

    // --- Event operations ---

    /// Append an event to the audit log.
    pub async fn append_event(
        &self,
        task_id: &Id,
        actor: &str,
        payload: &EventPayload,
    ) -> Result<AuditEvent> {
        let id = Id::new();
        let now = Utc::now();
        let event_type = payload.event_type().as_str().to_string();
        let payload_json = payload.to_json()?;

        sqlx::query(
            "INSERT INTO events (id, task_id, actor, type, ts, payload_json) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(id.as_ref())
        .bind(task_id.as_ref())
        .bind(actor)
        .bind(&event_type)
        .bind(now.timestamp_millis())
        .bind(&payload_json)
        .execute(&self.pool)
        .await?;

        Ok(AuditEvent {
            id,
            task_id: task_id.clone(),
            actor: actor.to_string(),
            event_type,
            timestamp: now,
            payload_json,
        })
    }

    /// List audit events for a task in append order.
    pub async fn list_events(&self, task_id: &Id) -> Result<Vec<AuditEvent>> {
        let rows = sqlx::query_as::<_, EventRow>(
            "SELECT * FROM events WHERE task_id = ?1 ORDER BY ts ASC, id ASC",
        )
        .bind(task_id.as_ref())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(EventRow::into_event).collect())
    }
}

// --- Row types for SQLx ---

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: String,
    title: String,
    kind: String,
    priority: i64,
    dependencies_json: String,
    state: String,
    attempt_count: i64,
    max_attempts: i64,
    assigned_session: Option<String>,
    block_reason: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl TaskRow {
    fn into_task(self) -> Result<Task> {
        let kind = TaskKind::parse(&self.kind)
            .ok_or_else(|| StorageError::corrupt("tasks.kind", &self.kind))?;
        let state = TaskState::parse(&self.state)
            .ok_or_else(|| StorageError::corrupt("tasks.state", &self.state))?;
        let dependencies: Vec<Id> = serde_json::from_str(&self.dependencies_json)
            .map_err(|e| StorageError::corrupt("tasks.dependencies_json", e))?;

        Ok(Task {
            id: Id::from_string(self.id),
            title: self.title,
            kind,
            priority: self.priority,
            dependencies,
            state,
            attempt_count: self.attempt_count as u32,
            max_attempts: self.max_attempts as u32,
            assigned_session: self.assigned_session,
            block_reason: self.block_reason,
            created_at: DateTime::from_timestamp_millis(self.created_at).unwrap_or_default(),
            updated_at: DateTime::from_timestamp_millis(self.updated_at).unwrap_or_default(),
        })
    }
}

#[derive(sqlx::FromRow)]
struct AttemptRow {
    id: String,
    task_id: String,
    sequence_number: i64,
    started_at: i64,
    ended_at: Option<i64>,
    verifier_results_json: String,
    verdict_json: Option<String>,
    changed_resources_json: String,
}

impl AttemptRow {
    fn into_attempt(self) -> Result<Attempt> {
        let verifier_results: Vec<TierResult> = serde_json::from_str(&self.verifier_results_json)
            .map_err(|e| StorageError::corrupt("attempts.verifier_results_json", e))?;
        let verdict: Option<Verdict> = self
            .verdict_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| StorageError::corrupt("attempts.verdict_json", e))?;
        let changed_resources: Vec<String> = serde_json::from_str(&self.changed_resources_json)
            .map_err(|e| StorageError::corrupt("attempts.changed_resources_json", e))?;

        Ok(Attempt {
            id: Id::from_string(self.id),
            task_id: Id::from_string(self.task_id),
            sequence_number: self.sequence_number as u32,
            started_at: DateTime::from_timestamp_millis(self.started_at).unwrap_or_default(),
            ended_at: self.ended_at.and_then(DateTime::from_timestamp_millis),
            verifier_results,
            verdict,
            changed_resources,
        })
    }
}

#[derive(sqlx::FromRow)]
struct CheckpointRow {
    task_id: String,
    sequence_number: i64,
    phase: String,
    status: String,
    attempt_count: i64,
    next_steps_json: String,
    context_json: String,
    saved_at: i64,
}

impl CheckpointRow {
    fn into_checkpoint(self) -> Result<Checkpoint> {
        let phase = LoopPhase::parse(&self.phase)
            .ok_or_else(|| StorageError::corrupt("checkpoints.phase", &self.phase))?;
        let status = TaskState::parse(&self.status)
            .ok_or_else(|| StorageError::corrupt("checkpoints.status", &self.status))?;
        let next_steps = serde_json::from_str(&self.next_steps_json)
            .map_err(|e| StorageError::corrupt("checkpoints.next_steps_json", e))?;
        let context = serde_json::from_str(&self.context_json)
            .map_err(|e| StorageError::corrupt("checkpoints.context_json", e))?;

        Ok(Checkpoint {
            task_id: Id::from_string(self.task_id),
            sequence_number: self.sequence_number as u32,
            phase,
            status,
            attempt_count: self.attempt_count as u32,
            next_steps,
            context,
            saved_at: DateTime::from_timestamp_millis(self.saved_at).unwrap_or_default(),
        })
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    id: String,
    task_id: String,
    actor: String,
    #[sqlx(rename = "type")]
    event_type: String,
    ts: i64,
    payload_json: String,
}

impl EventRow {
    fn into_event(self) -> AuditEvent {
        AuditEvent {
            id: Id::from_string(self.id),
            task_id: Id::from_string(self.task_id),
            actor: self.actor,
            event_type: self.event_type,
            timestamp: DateTime::from_timestamp_millis(self.ts).unwrap_or_default(),
            payload_json: self.payload_json,
        }
    }
}
