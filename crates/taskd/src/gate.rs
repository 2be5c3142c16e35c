//! Governance gate: policy evaluation over a finished attempt.
//!
//! Policy outranks verification. A passing tier run still produces a
//! BLOCKED verdict when the attempt violated a policy rule.

use std::sync::Arc;

use task_core::events::{EventPayload, VerdictRecordedPayload};
use task_core::policy::{LIMIT_ESCALATION_THRESHOLD, LIMIT_MAX_RESOURCES_CHANGED};
use task_core::{
    AutonomyPolicy, KillSwitchMode, Task, TierResult, Verdict, VerdictReason,
};
use thiserror::Error;
use tracing::info;

use crate::storage::{Storage, StorageError};

#[derive(Debug, Error)]
pub enum GateError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, GateError>;

/// Everything the gate inspects for one attempt.
#[derive(Debug)]
pub struct GateInput<'a> {
    pub task: &'a Task,
    pub mode: KillSwitchMode,
    pub changed_resources: &'a [String],
    pub tier_results: &'a [TierResult],
}

/// Policy evaluator. Holds the immutable policy for the coordinator session.
pub struct GovernanceGate {
    policy: AutonomyPolicy,
    storage: Arc<Storage>,
}

impl std::fmt::Debug for GovernanceGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GovernanceGate")
            .field("role", &self.policy.role)
            .finish_non_exhaustive()
    }
}

impl GovernanceGate {
    pub fn new(policy: AutonomyPolicy, storage: Arc<Storage>) -> Self {
        Self { policy, storage }
    }

    pub fn policy(&self) -> &AutonomyPolicy {
        &self.policy
    }

    /// Evaluate one attempt and record the verdict in the audit log.
    ///
    /// Evaluation order is fixed: kill switch OFF, SAFE-mode whitelist,
    /// forbidden actions, numeric limits, tier failures, PASS.
    pub async fn evaluate(&self, input: GateInput<'_>) -> Result<Verdict> {
        let verdict = self.decide(&input);

        let payload = EventPayload::VerdictRecorded(VerdictRecordedPayload {
            task_id: input.task.id.clone(),
            decision: verdict.decision,
            reason: verdict.reason.clone(),
            summary: verdict.summary.clone(),
        });
        self.storage
            .append_event(&input.task.id, "gate", &payload)
            .await?;

        info!(
            task_id = %input.task.id,
            decision = verdict.decision.as_str(),
            reason = verdict.reason.code(),
            "verdict recorded"
        );
        Ok(verdict)
    }

    fn decide(&self, input: &GateInput<'_>) -> Verdict {
        match input.mode {
            KillSwitchMode::Off => {
                return Verdict::blocked(
                    VerdictReason::KillSwitchOff,
                    "kill switch is off; attempt not inspected",
                );
            }
            KillSwitchMode::Safe => {
                if !self.policy.is_safe_kind(input.task.kind) {
                    return Verdict::blocked(
                        VerdictReason::KindNotWhitelisted {
                            kind: input.task.kind,
                        },
                        format!(
                            "kind {} is not whitelisted under safe mode",
                            input.task.kind.as_str()
                        ),
                    );
                }
            }
            KillSwitchMode::Normal | KillSwitchMode::Paused => {}
        }

        // Forbidden actions match changed resources exactly or as a path
        // prefix.
        for resource in input.changed_resources {
            for action in &self.policy.forbidden_actions {
                if resource == action || resource.starts_with(&format!("{action}/")) {
                    return Verdict::blocked(
                        VerdictReason::ForbiddenAction {
                            action: action.clone(),
                        },
                        format!("changed resource {resource} matches forbidden action {action}"),
                    );
                }
            }
        }

        let touched = input.changed_resources.len() as u64;
        if let Some(ceiling) = self.policy.limit(LIMIT_MAX_RESOURCES_CHANGED) {
            if touched > ceiling {
                return Verdict::blocked(
                    VerdictReason::LimitExceeded {
                        limit: LIMIT_MAX_RESOURCES_CHANGED.to_string(),
                        value: touched,
                        ceiling,
                    },
                    format!("{touched} resources changed, limit {LIMIT_MAX_RESOURCES_CHANGED} is {ceiling}"),
                );
            }
        }
        if let Some(threshold) = self.policy.limit(LIMIT_ESCALATION_THRESHOLD) {
            if touched > threshold {
                return Verdict::blocked(
                    VerdictReason::ScopeEscalation { touched, threshold },
                    format!("attempt touched {touched} resources, escalation threshold {threshold}"),
                );
            }
        }

        if let Some(failed) = input.tier_results.iter().find(|t| !t.passed) {
            let fixable = if self.policy.is_auto_fixable(&failed.tier) {
                " (auto-fixable)"
            } else {
                ""
            };
            return Verdict::fail(
                VerdictReason::TierFailed {
                    tier: failed.tier.clone(),
                },
                format!("tier {} failed{fixable}", failed.tier),
            );
        }

        Verdict::pass("all tiers passed, no policy rule fired")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use task_core::{Decision, Id, TaskKind, TaskState};
    use tempfile::TempDir;

    struct TestGate {
        gate: GovernanceGate,
        storage: Arc<Storage>,
        _dir: TempDir,
    }

    async fn create_test_gate(policy: AutonomyPolicy) -> TestGate {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("test.db");
        let storage = Storage::new(&db_path).await.unwrap();
        storage.migrate_embedded().await.unwrap();
        let storage = Arc::new(storage);
        TestGate {
            gate: GovernanceGate::new(policy, Arc::clone(&storage)),
            storage,
            _dir: dir,
        }
    }

    fn sample_policy() -> AutonomyPolicy {
        toml::from_str(
            r#"
            version = 1
            role = "executor"
            forbidden_actions = ["secrets", "deploy/prod"]
            safe_kinds = ["doc", "test"]
            auto_fixable = ["lint"]

            [limits]
            max_resources_changed = 10
            escalation_threshold = 5
            "#,
        )
        .unwrap()
    }

    fn test_task(kind: TaskKind) -> Task {
        let now = Utc::now();
        Task {
            id: Id::from_string("TASK-001"),
            title: "test task".to_string(),
            kind,
            priority: 1,
            dependencies: vec![],
            state: TaskState::InProgress,
            attempt_count: 1,
            max_attempts: 5,
            assigned_session: None,
            block_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn passing_tier(name: &str) -> TierResult {
        TierResult {
            tier: name.to_string(),
            passed: true,
            diagnostics: String::new(),
            duration_ms: 10,
        }
    }

    fn failing_tier(name: &str) -> TierResult {
        TierResult {
            tier: name.to_string(),
            passed: false,
            diagnostics: "boom".to_string(),
            duration_ms: 10,
        }
    }

    #[tokio::test]
    async fn clean_attempt_passes() {
        let tg = create_test_gate(sample_policy()).await;
        let task = test_task(TaskKind::Feature);
        let changed = vec!["src/lib.rs".to_string()];
        let tiers = vec![passing_tier("lint"), passing_tier("tests")];

        let verdict = tg
            .gate
            .evaluate(GateInput {
                task: &task,
                mode: KillSwitchMode::Normal,
                changed_resources: &changed,
                tier_results: &tiers,
            })
            .await
            .unwrap();
        assert!(verdict.is_pass());
    }

    #[tokio::test]
    async fn kill_switch_off_short_circuits() {
        let tg = create_test_gate(sample_policy()).await;
        let task = test_task(TaskKind::Doc);

        let verdict = tg
            .gate
            .evaluate(GateInput {
                task: &task,
                mode: KillSwitchMode::Off,
                changed_resources: &[],
                tier_results: &[],
            })
            .await
            .unwrap();
        assert!(verdict.is_blocked());
        assert_eq!(verdict.reason.code(), "kill_switch_off");
    }

    #[tokio::test]
    async fn safe_mode_blocks_non_whitelisted_kind() {
        let tg = create_test_gate(sample_policy()).await;
        let task = test_task(TaskKind::Infra);

        let verdict = tg
            .gate
            .evaluate(GateInput {
                task: &task,
                mode: KillSwitchMode::Safe,
                changed_resources: &[],
                tier_results: &[passing_tier("tests")],
            })
            .await
            .unwrap();
        assert_eq!(verdict.reason.code(), "kind_not_whitelisted");
    }

    #[tokio::test]
    async fn safe_mode_allows_whitelisted_kind() {
        let tg = create_test_gate(sample_policy()).await;
        let task = test_task(TaskKind::Doc);

        let verdict = tg
            .gate
            .evaluate(GateInput {
                task: &task,
                mode: KillSwitchMode::Safe,
                changed_resources: &[],
                tier_results: &[passing_tier("tests")],
            })
            .await
            .unwrap();
        assert!(verdict.is_pass());
    }

    #[tokio::test]
    async fn forbidden_action_blocks_despite_passing_tiers() {
        let tg = create_test_gate(sample_policy()).await;
        let task = test_task(TaskKind::Feature);
        let changed = vec!["deploy/prod/config.yml".to_string()];

        let verdict = tg
            .gate
            .evaluate(GateInput {
                task: &task,
                mode: KillSwitchMode::Normal,
                changed_resources: &changed,
                tier_results: &[passing_tier("tests")],
            })
            .await
            .unwrap();
        assert!(verdict.is_blocked());
        assert!(matches!(
            verdict.reason,
            VerdictReason::ForbiddenAction { ref action } if action == "deploy/prod"
        ));
    }

    #[tokio::test]
    async fn limit_breach_names_the_limit() {
        let tg = create_test_gate(sample_policy()).await;
        let task = test_task(TaskKind::Feature);
        let changed: Vec<String> = (0..12).map(|i| format!("src/f{i}.rs")).collect();

        let verdict = tg
            .gate
            .evaluate(GateInput {
                task: &task,
                mode: KillSwitchMode::Normal,
                changed_resources: &changed,
                tier_results: &[passing_tier("tests")],
            })
            .await
            .unwrap();
        assert!(matches!(
            verdict.reason,
            VerdictReason::LimitExceeded { ref limit, value: 12, ceiling: 10 }
                if limit == "max_resources_changed"
        ));
    }

    #[tokio::test]
    async fn scope_escalation_despite_passing_tiers() {
        let tg = create_test_gate(sample_policy()).await;
        let task = test_task(TaskKind::Feature);
        // Over the escalation threshold (5) but under max_resources_changed (10).
        let changed: Vec<String> = (0..7).map(|i| format!("src/f{i}.rs")).collect();

        let verdict = tg
            .gate
            .evaluate(GateInput {
                task: &task,
                mode: KillSwitchMode::Normal,
                changed_resources: &changed,
                tier_results: &[passing_tier("tests")],
            })
            .await
            .unwrap();
        assert!(verdict.is_blocked());
        assert!(matches!(
            verdict.reason,
            VerdictReason::ScopeEscalation {
                touched: 7,
                threshold: 5
            }
        ));
    }

    #[tokio::test]
    async fn tier_failure_yields_fail() {
        let tg = create_test_gate(sample_policy()).await;
        let task = test_task(TaskKind::Feature);
        let tiers = vec![passing_tier("lint"), failing_tier("tests")];

        let verdict = tg
            .gate
            .evaluate(GateInput {
                task: &task,
                mode: KillSwitchMode::Normal,
                changed_resources: &[],
                tier_results: &tiers,
            })
            .await
            .unwrap();
        assert_eq!(verdict.decision, Decision::Fail);
        assert!(matches!(
            verdict.reason,
            VerdictReason::TierFailed { ref tier } if tier == "tests"
        ));
    }

    #[tokio::test]
    async fn auto_fixable_failure_is_noted_in_summary() {
        let tg = create_test_gate(sample_policy()).await;
        let task = test_task(TaskKind::Feature);
        let tiers = vec![failing_tier("lint")];

        let verdict = tg
            .gate
            .evaluate(GateInput {
                task: &task,
                mode: KillSwitchMode::Normal,
                changed_resources: &[],
                tier_results: &tiers,
            })
            .await
            .unwrap();
        assert_eq!(verdict.decision, Decision::Fail);
        assert!(verdict.summary.contains("auto-fixable"));
    }

    #[tokio::test]
    async fn every_evaluation_appends_audit_event() {
        let tg = create_test_gate(sample_policy()).await;
        let task = test_task(TaskKind::Feature);

        for _ in 0..3 {
            tg.gate
                .evaluate(GateInput {
                    task: &task,
                    mode: KillSwitchMode::Normal,
                    changed_resources: &[],
                    tier_results: &[passing_tier("tests")],
                })
                .await
                .unwrap();
        }

        let events = tg.storage.list_events(&task.id).await.unwrap();
        let verdicts = events
            .iter()
            .filter(|e| e.event_type == "VERDICT_RECORDED")
            .count();
        assert_eq!(verdicts, 3);
    }
}
