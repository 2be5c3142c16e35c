//! Autonomy policy: the declarative per-role contract evaluated by the
//! governance gate.
//!
//! Policies are TOML documents, immutable at runtime, loaded once per
//! coordinator session.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::TaskKind;

/// Named numeric ceilings with well-known keys.
pub const LIMIT_MAX_RESOURCES_CHANGED: &str = "max_resources_changed";
pub const LIMIT_MAX_ATTEMPTS_PER_TASK: &str = "max_attempts_per_task";
pub const LIMIT_ESCALATION_THRESHOLD: &str = "escalation_threshold";

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("failed to read policy file: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse policy file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Declarative rule set bound to an actor role.
///
/// Versioned and read-only after load; safe to share across loops without
/// locking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutonomyPolicy {
    pub version: u32,
    pub role: String,
    #[serde(default)]
    pub allowed_actions: BTreeSet<String>,
    #[serde(default)]
    pub forbidden_actions: BTreeSet<String>,
    /// Named numeric ceilings, e.g. `max_resources_changed = 20`.
    #[serde(default)]
    pub limits: BTreeMap<String, u64>,
    /// Verdict reason codes that force a kill-switch downgrade to PAUSED.
    #[serde(default)]
    pub halt_conditions: BTreeSet<String>,
    /// Task kinds dispatchable while the kill switch is in SAFE mode.
    #[serde(default)]
    pub safe_kinds: BTreeSet<TaskKind>,
    /// Tier names whose failures are considered auto-fixable by a retry.
    #[serde(default)]
    pub auto_fixable: BTreeSet<String>,
}

impl Default for AutonomyPolicy {
    fn default() -> Self {
        Self {
            version: 1,
            role: "executor".to_string(),
            allowed_actions: BTreeSet::new(),
            forbidden_actions: BTreeSet::new(),
            limits: BTreeMap::new(),
            halt_conditions: BTreeSet::new(),
            safe_kinds: [TaskKind::Doc, TaskKind::Test].into_iter().collect(),
            auto_fixable: BTreeSet::new(),
        }
    }
}

impl AutonomyPolicy {
    /// Load a policy from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, PolicyError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Look up a numeric ceiling by name.
    pub fn limit(&self, name: &str) -> Option<u64> {
        self.limits.get(name).copied()
    }

    pub fn is_forbidden(&self, action: &str) -> bool {
        self.forbidden_actions.contains(action)
    }

    /// Whether a verdict reason code triggers the policy halt path.
    pub fn is_halt_condition(&self, reason_code: &str) -> bool {
        self.halt_conditions.contains(reason_code)
    }

    /// Whether `kind` may be dispatched under SAFE mode.
    pub fn is_safe_kind(&self, kind: TaskKind) -> bool {
        self.safe_kinds.contains(&kind)
    }

    pub fn is_auto_fixable(&self, tier: &str) -> bool {
        self.auto_fixable.contains(tier)
    }

    /// Effective attempt ceiling for a task: the smaller of the task's own
    /// budget and the policy-wide `max_attempts_per_task` limit, if set.
    pub fn effective_max_attempts(&self, task_max: u32) -> u32 {
        match self.limit(LIMIT_MAX_ATTEMPTS_PER_TASK) {
            Some(ceiling) => task_max.min(ceiling as u32),
            None => task_max,
        }
    }
}
