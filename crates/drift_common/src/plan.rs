//! Remediation-side value objects: plans, per-node attempts, backups and the
//! structured event log serialized alongside a plan.

use crate::types::{ServiceState, Severity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// States of the canary remediation state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanState {
    Idle,
    CanarySelection,
    PreValidation,
    Backup,
    ApplyCanary,
    PostValidationCanary,
    FullRollout,
    Rollback,
    Completed,
    Failed,
}

impl fmt::Display for PlanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PlanState::Idle => "idle",
            PlanState::CanarySelection => "canary_selection",
            PlanState::PreValidation => "pre_validation",
            PlanState::Backup => "backup",
            PlanState::ApplyCanary => "apply_canary",
            PlanState::PostValidationCanary => "post_validation_canary",
            PlanState::FullRollout => "full_rollout",
            PlanState::Rollback => "rollback",
            PlanState::Completed => "completed",
            PlanState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Terminal outcome of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanOutcome {
    Pending,
    Success,
    RolledBack,
    Failed,
}

/// Which rollout wave a node belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutPhase {
    Canary,
    Full,
}

/// Resolution of one per-node attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Pending,
    Success,
    /// Pre-validation collect failed; nothing was applied.
    PreValidationFailed,
    /// Backup capture failed; node excluded from apply.
    BackupFailed,
    /// Apply or post-validation failed and the node was restored.
    RolledBack,
    /// Restore from backup failed verification. Manual intervention.
    RollbackFailed,
    /// Cancelled before anything was applied.
    Cancelled,
}

impl AttemptOutcome {
    pub fn is_terminal_success(&self) -> bool {
        matches!(self, AttemptOutcome::Success)
    }
}

/// Result of one step (pre-validation, apply, post-validation, rollback).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepResult {
    pub ok: bool,
    pub detail: String,
    pub finished_at: DateTime<Utc>,
}

impl StepResult {
    pub fn ok(detail: impl Into<String>) -> Self {
        Self {
            ok: true,
            detail: detail.into(),
            finished_at: Utc::now(),
        }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: detail.into(),
            finished_at: Utc::now(),
        }
    }
}

/// One captured file inside a backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupFile {
    pub sha256: String,
    pub mode: Option<u32>,
}

/// Pre-change snapshot of a node's managed artifacts.
///
/// Owned by the attempt that captured it. Retained after rollback for
/// forensics; pruned only after the whole plan resolves Success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backup {
    pub id: String,
    pub node: String,
    pub attempt_id: String,
    pub created_at: DateTime<Utc>,
    /// path -> checksum/mode of the captured content, used to verify that a
    /// rollback restored the node exactly.
    pub files: BTreeMap<String, BackupFile>,
    pub services: BTreeMap<String, ServiceState>,
    /// Local directory holding the captured file contents.
    pub dir: PathBuf,
}

/// Per-node execution within a plan. Immutable once resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationAttempt {
    pub id: String,
    pub node: String,
    pub phase: RolloutPhase,
    pub backup_id: Option<String>,
    pub pre_validation: Option<StepResult>,
    pub apply: Option<StepResult>,
    pub post_validation: Option<StepResult>,
    pub rollback: Option<StepResult>,
    pub outcome: AttemptOutcome,
}

impl RemediationAttempt {
    pub fn new(node: &str, phase: RolloutPhase) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            node: node.to_string(),
            phase,
            backup_id: None,
            pre_validation: None,
            apply: None,
            post_validation: None,
            rollback: None,
            outcome: AttemptOutcome::Pending,
        }
    }
}

/// Log level of a plan event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Info,
    Warning,
    Error,
}

/// One structured remediation event, serialized with the plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub node: String,
    pub detail: String,
    pub level: EventLevel,
}

impl PlanEvent {
    pub fn new(
        event_type: impl Into<String>,
        node: impl Into<String>,
        detail: impl Into<String>,
        level: EventLevel,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type: event_type.into(),
            node: node.into(),
            detail: detail.into(),
            level,
        }
    }
}

/// Follow-up advice attached to a terminal plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    pub priority: Severity,
    pub action: String,
    pub detail: String,
}

/// One end-to-end canary-then-full remediation execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationPlan {
    pub id: String,
    pub report_id: String,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub state: PlanState,
    pub outcome: PlanOutcome,
    pub canary: Vec<String>,
    pub full: Vec<String>,
    pub attempts: Vec<RemediationAttempt>,
    pub events: Vec<PlanEvent>,
    pub recommendations: Vec<Recommendation>,
}

impl RemediationPlan {
    pub fn new(report_id: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            report_id: report_id.to_string(),
            created_at: Utc::now(),
            resolved_at: None,
            state: PlanState::Idle,
            outcome: PlanOutcome::Pending,
            canary: Vec::new(),
            full: Vec::new(),
            attempts: Vec::new(),
            events: Vec::new(),
            recommendations: Vec::new(),
        }
    }

    pub fn transition(&mut self, state: PlanState) {
        self.events.push(PlanEvent::new(
            "state_transition",
            "plan",
            format!("{} -> {}", self.state, state),
            EventLevel::Info,
        ));
        self.state = state;
    }

    pub fn resolve(&mut self, state: PlanState, outcome: PlanOutcome) {
        self.transition(state);
        self.outcome = outcome;
        self.resolved_at = Some(Utc::now());
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }

    /// node -> outcome, for the per-node outcome map retained on failure.
    pub fn outcome_map(&self) -> BTreeMap<String, AttemptOutcome> {
        self.attempts
            .iter()
            .map(|a| (a.node.clone(), a.outcome))
            .collect()
    }

    pub fn attempt_for(&self, node: &str) -> Option<&RemediationAttempt> {
        self.attempts.iter().find(|a| a.node == node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_records_event() {
        let mut plan = RemediationPlan::new("report-1");
        plan.transition(PlanState::CanarySelection);
        plan.transition(PlanState::PreValidation);
        assert_eq!(plan.state, PlanState::PreValidation);
        assert_eq!(plan.events.len(), 2);
        assert_eq!(plan.events[0].detail, "idle -> canary_selection");
    }

    #[test]
    fn test_resolve_sets_outcome() {
        let mut plan = RemediationPlan::new("report-1");
        plan.resolve(PlanState::Completed, PlanOutcome::Success);
        assert!(plan.is_resolved());
        assert_eq!(plan.outcome, PlanOutcome::Success);
        assert_eq!(plan.state, PlanState::Completed);
    }

    #[test]
    fn test_outcome_map() {
        let mut plan = RemediationPlan::new("report-1");
        let mut a = RemediationAttempt::new("target1", RolloutPhase::Canary);
        a.outcome = AttemptOutcome::Success;
        let mut b = RemediationAttempt::new("target2", RolloutPhase::Full);
        b.outcome = AttemptOutcome::RolledBack;
        plan.attempts.push(a);
        plan.attempts.push(b);

        let map = plan.outcome_map();
        assert_eq!(map["target1"], AttemptOutcome::Success);
        assert_eq!(map["target2"], AttemptOutcome::RolledBack);
    }
}
