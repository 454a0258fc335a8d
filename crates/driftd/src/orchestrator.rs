//! Canary remediation orchestrator - the engine's state machine.
//!
//! Drives a plan through `Idle -> CanarySelection -> PreValidation -> Backup
//! -> ApplyCanary -> PostValidationCanary -> {FullRollout | Rollback} ->
//! Completed | Failed`. The canary wave runs its stages in lockstep with a
//! hard barrier between them; the Decision resolves before any full-rollout
//! node begins pre-validation. Full-rollout nodes run their whole sequence
//! independently and in parallel, one node's failure rolling back that node
//! only.

use crate::backup::BackupManager;
use crate::classify::Classifier;
use crate::collector::StateCollector;
use crate::compare;
use crate::invoker::{scope_for, ConvergenceInvoker};
use crate::lease::{NodeLease, NodeLeases};
use crate::notify::Notifier;
use crate::registry::ManifestRegistry;
use crate::rollback::RollbackManager;
use drift_common::config::RemediationConfig;
use drift_common::plan::{
    AttemptOutcome, Backup, EventLevel, PlanEvent, PlanOutcome, PlanState, Recommendation,
    RemediationAttempt, RemediationPlan, RolloutPhase, StepResult,
};
use drift_common::types::{DetectionReport, DriftRecord, Severity};
use drift_common::{EngineError, RoleManifest};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Create the cancellation pair for a plan. Flipping the sender to `true`
/// asks the orchestrator to stop at the next safe checkpoint.
pub fn cancel_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

/// Deterministic canary selection: node ids sorted, shuffled by an RNG
/// seeded from the plan id, first `max(1, ceil(fraction * N))` taken.
/// Reproducible per plan.
pub fn select_canary(
    drifted: &[String],
    fraction: f64,
    plan_id: &str,
) -> (Vec<String>, Vec<String>) {
    let mut nodes: Vec<String> = drifted.to_vec();
    nodes.sort();

    let n = nodes.len();
    let size = ((n as f64 * fraction).ceil() as usize).clamp(1, n.max(1));

    let digest = Sha256::digest(plan_id.as_bytes());
    let seed = u64::from_le_bytes(digest[..8].try_into().expect("digest is 32 bytes"));
    let mut rng = StdRng::seed_from_u64(seed);
    nodes.shuffle(&mut rng);

    let mut canary: Vec<String> = nodes.drain(..size.min(n)).collect();
    canary.sort();
    nodes.sort();
    (canary, nodes)
}

/// Per-node working state carried through an attempt's stages. Holds the
/// node's lease for the attempt's whole duration.
struct NodeCtx {
    node: String,
    manifest: RoleManifest,
    records: Vec<DriftRecord>,
    attempt: RemediationAttempt,
    pre_max: Option<Severity>,
    backup: Option<Backup>,
    events: Vec<PlanEvent>,
    _lease: NodeLease,
}

impl NodeCtx {
    fn pending(&self) -> bool {
        self.attempt.outcome == AttemptOutcome::Pending
    }

    fn event(&mut self, event_type: &str, detail: impl Into<String>, level: EventLevel) {
        self.events
            .push(PlanEvent::new(event_type, self.node.clone(), detail, level));
    }
}

#[derive(Debug, Clone, Copy)]
enum Stage {
    PreValidate,
    Backup,
    Apply,
    PostValidate,
    /// The whole per-node sequence, used for full-rollout nodes.
    FullSequence,
}

/// Shared handles for stage execution, cloned into worker tasks.
#[derive(Clone)]
struct Workers {
    collector: Arc<StateCollector>,
    classifier: Arc<Classifier>,
    backups: Arc<BackupManager>,
    rollback: Arc<RollbackManager>,
    invoker: Arc<dyn ConvergenceInvoker>,
    notifier: Arc<dyn Notifier>,
    config: RemediationConfig,
    cancel: watch::Receiver<bool>,
}

impl Workers {
    fn cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    async fn run_stage(&self, ctx: &mut NodeCtx, stage: Stage) {
        match stage {
            Stage::PreValidate => self.pre_validate(ctx).await,
            Stage::Backup => self.take_backup(ctx).await,
            Stage::Apply => self.apply(ctx).await,
            Stage::PostValidate => self.post_validate(ctx).await,
            Stage::FullSequence => {
                self.pre_validate(ctx).await;
                self.take_backup(ctx).await;
                self.apply(ctx).await;
                self.post_validate(ctx).await;
            }
        }
    }

    /// Re-collect immediately before acting, guarding against stale report
    /// data. A node that re-collects clean resolves Success without applying.
    async fn pre_validate(&self, ctx: &mut NodeCtx) {
        if !ctx.pending() {
            return;
        }
        if self.cancelled() {
            // Nothing applied yet; this is a safe checkpoint.
            ctx.attempt.outcome = AttemptOutcome::Cancelled;
            ctx.event("cancelled", "cancelled before pre-validation", EventLevel::Warning);
            return;
        }

        match self.collector.collect(&ctx.node, &ctx.manifest).await {
            Ok(observed) => {
                let remaining = self
                    .classifier
                    .records(compare::compare(&observed, &ctx.manifest));
                if remaining.is_empty() {
                    ctx.attempt.pre_validation =
                        Some(StepResult::ok("no drift on re-collection"));
                    ctx.attempt.outcome = AttemptOutcome::Success;
                    ctx.event(
                        "already_converged",
                        "node matched manifest at pre-validation, apply skipped",
                        EventLevel::Info,
                    );
                } else {
                    let max = remaining
                        .iter()
                        .map(|r| r.severity)
                        .max()
                        .expect("remaining is nonempty");
                    ctx.attempt.pre_validation = Some(StepResult::ok(format!(
                        "{} drift records, max severity {}",
                        remaining.len(),
                        max
                    )));
                    ctx.pre_max = Some(max);
                    ctx.records = remaining;
                    ctx.event("validation_pre", "pre-validation passed", EventLevel::Info);
                }
            }
            Err(e) => {
                ctx.attempt.pre_validation = Some(StepResult::failed(e.to_string()));
                ctx.attempt.outcome = AttemptOutcome::PreValidationFailed;
                ctx.event(
                    "validation_pre",
                    format!("pre-validation failed: {}", e),
                    EventLevel::Error,
                );
            }
        }
    }

    /// Snapshot before mutation. Failure is fatal for this node's attempt
    /// only and excludes it from Apply.
    async fn take_backup(&self, ctx: &mut NodeCtx) {
        if !ctx.pending() {
            return;
        }
        match self
            .backups
            .capture(&ctx.node, &ctx.attempt.id, &ctx.manifest)
            .await
        {
            Ok(backup) => {
                ctx.attempt.backup_id = Some(backup.id.clone());
                ctx.event(
                    "backup_created",
                    format!("backup {} captured", backup.id),
                    EventLevel::Info,
                );
                ctx.backup = Some(backup);
            }
            Err(e) => {
                ctx.attempt.outcome = AttemptOutcome::BackupFailed;
                ctx.event("backup_failed", e.to_string(), EventLevel::Error);
            }
        }
    }

    /// Invoke the convergence action with bounded retries and backoff for
    /// transient failures.
    async fn apply(&self, ctx: &mut NodeCtx) {
        if !ctx.pending() {
            return;
        }
        if self.cancelled() {
            // Still before Apply; abort cleanly without touching the node.
            ctx.attempt.outcome = AttemptOutcome::Cancelled;
            ctx.event("cancelled", "cancelled before apply", EventLevel::Warning);
            return;
        }

        let scope = scope_for(&ctx.records);
        let mut last_err = String::new();
        for attempt in 0..=self.config.apply_max_retries {
            if attempt > 0 {
                if self.cancelled() {
                    // The node has already seen a failed apply; abandon the
                    // retry ladder and let post-validation drive it to its
                    // rollback checkpoint.
                    ctx.attempt.apply = Some(StepResult::failed(format!(
                        "cancelled during retries: {}",
                        last_err
                    )));
                    ctx.event(
                        "cancelled",
                        "apply retries abandoned on cancellation",
                        EventLevel::Warning,
                    );
                    return;
                }
                let backoff = Duration::from_millis(
                    self.config.apply_backoff_ms * 2u64.saturating_pow(attempt - 1),
                );
                ctx.event(
                    "apply_retry",
                    format!(
                        "retry {}/{} after {:?}: {}",
                        attempt, self.config.apply_max_retries, backoff, last_err
                    ),
                    EventLevel::Warning,
                );
                tokio::time::sleep(backoff).await;
            }
            match self.invoker.apply(&ctx.node, &scope).await {
                Ok(report) => {
                    ctx.attempt.apply = Some(StepResult::ok(report.detail));
                    ctx.event("applied", format!("converged scope {}", scope), EventLevel::Info);
                    return;
                }
                Err(e) => last_err = e.to_string(),
            }
        }

        // Retry ceiling reached; post-validation will route this node to
        // rollback.
        ctx.attempt.apply = Some(StepResult::failed(format!(
            "exhausted {} retries: {}",
            self.config.apply_max_retries, last_err
        )));
        ctx.event("apply_failed", last_err, EventLevel::Error);
    }

    /// Re-collect and re-classify after Apply. Any remaining drift at or
    /// above the node's pre-remediation severity fails validation. Runs even
    /// under cancellation: a node past Apply is driven to its safe
    /// checkpoint (validated, then rolled back or kept) first.
    async fn post_validate(&self, ctx: &mut NodeCtx) {
        if !ctx.pending() {
            return;
        }

        let applied_ok = ctx.attempt.apply.as_ref().map(|s| s.ok).unwrap_or(false);
        if !applied_ok {
            self.run_rollback(ctx, "apply failed").await;
            return;
        }

        match self.collector.collect(&ctx.node, &ctx.manifest).await {
            Ok(observed) => {
                let remaining = self
                    .classifier
                    .records(compare::compare(&observed, &ctx.manifest));
                let pre_max = ctx.pre_max.unwrap_or(Severity::Low);
                let still_bad: Vec<&DriftRecord> = remaining
                    .iter()
                    .filter(|r| r.severity >= pre_max)
                    .collect();

                if still_bad.is_empty() {
                    ctx.attempt.post_validation = Some(StepResult::ok(format!(
                        "{} residual records below severity {}",
                        remaining.len(),
                        pre_max
                    )));
                    ctx.attempt.outcome = AttemptOutcome::Success;
                    ctx.event("remediation_complete", "post-validation passed", EventLevel::Info);
                } else {
                    ctx.attempt.post_validation = Some(StepResult::failed(format!(
                        "{} drift records at or above severity {}",
                        still_bad.len(),
                        pre_max
                    )));
                    ctx.event(
                        "validation_post",
                        "post-validation failed",
                        EventLevel::Error,
                    );
                    self.run_rollback(ctx, "post-validation failed").await;
                }
            }
            Err(e) => {
                ctx.attempt.post_validation = Some(StepResult::failed(e.to_string()));
                ctx.event(
                    "validation_post",
                    format!("post-validation collect failed: {}", e),
                    EventLevel::Error,
                );
                self.run_rollback(ctx, "post-validation unreachable").await;
            }
        }
    }

    /// Restore the node from its backup. Rollback failure escalates to a
    /// manual-intervention alert and is never auto-retried.
    async fn run_rollback(&self, ctx: &mut NodeCtx, reason: &str) {
        let Some(backup) = ctx.backup.clone() else {
            ctx.attempt.outcome = AttemptOutcome::RollbackFailed;
            ctx.event(
                "rollback_failed",
                format!("{}, and no backup exists for this attempt", reason),
                EventLevel::Error,
            );
            return;
        };

        match self.rollback.rollback(&backup, &self.backups).await {
            Ok(()) => {
                ctx.attempt.rollback = Some(StepResult::ok(format!("restored from {}", backup.id)));
                ctx.attempt.outcome = AttemptOutcome::RolledBack;
                ctx.event(
                    "rollback_complete",
                    format!("{}; restored pre-change state", reason),
                    EventLevel::Warning,
                );
            }
            Err(e) => {
                ctx.attempt.rollback = Some(StepResult::failed(e.to_string()));
                ctx.attempt.outcome = AttemptOutcome::RollbackFailed;
                ctx.event("rollback_failed", e.to_string(), EventLevel::Error);
                error!("{}: rollback failed, manual intervention required: {}", ctx.node, e);
                self.notifier
                    .notify(
                        "manual_intervention_required",
                        &format!("{}: rollback from {} failed: {}", ctx.node, backup.id, e),
                        Severity::Critical,
                        "driftd:rollback",
                    )
                    .await;
            }
        }
    }
}

pub struct Orchestrator {
    workers: Workers,
    audit: Arc<crate::audit::AuditLogger>,
    leases: NodeLeases,
    max_concurrent: usize,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        collector: Arc<StateCollector>,
        classifier: Arc<Classifier>,
        backups: Arc<BackupManager>,
        rollback: Arc<RollbackManager>,
        invoker: Arc<dyn ConvergenceInvoker>,
        audit: Arc<crate::audit::AuditLogger>,
        notifier: Arc<dyn Notifier>,
        leases: NodeLeases,
        config: RemediationConfig,
        max_concurrent: usize,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            workers: Workers {
                collector,
                classifier,
                backups,
                rollback,
                invoker,
                notifier,
                config,
                cancel,
            },
            audit,
            leases,
            max_concurrent,
        }
    }

    /// Run one remediation plan for a sealed detection report. Returns
    /// `None` when the report shows no drifted nodes: no plan is created.
    pub async fn run_plan(
        &self,
        report: &DetectionReport,
        registry: Arc<ManifestRegistry>,
    ) -> Result<Option<RemediationPlan>, EngineError> {
        let drifted = report.drifted_nodes();
        if drifted.is_empty() {
            info!("Report {} has no drifted nodes; no plan created", report.id);
            return Ok(None);
        }

        let mut plan = RemediationPlan::new(&report.id);
        info!(
            "Plan {} created for report {}: {} drifted nodes",
            plan.id,
            report.id,
            drifted.len()
        );

        plan.transition(PlanState::CanarySelection);
        let (canary, full) =
            select_canary(&drifted, self.workers.config.canary_fraction, &plan.id);
        plan.events.push(PlanEvent::new(
            "canary_selected",
            "plan",
            format!("canary: {}; full: {}", canary.join(","), full.join(",")),
            EventLevel::Info,
        ));
        plan.canary = canary;
        plan.full = full;

        // Canary wave: lockstep stages, hard barrier between each.
        let mut canary_ctxs = self
            .build_ctxs(&plan.canary, RolloutPhase::Canary, report, &registry)
            .await;
        plan.transition(PlanState::PreValidation);
        canary_ctxs = self.run_wave(canary_ctxs, Stage::PreValidate).await?;
        plan.transition(PlanState::Backup);
        canary_ctxs = self.run_wave(canary_ctxs, Stage::Backup).await?;
        plan.transition(PlanState::ApplyCanary);
        canary_ctxs = self.run_wave(canary_ctxs, Stage::Apply).await?;
        plan.transition(PlanState::PostValidationCanary);
        canary_ctxs = self.run_wave(canary_ctxs, Stage::PostValidate).await?;

        // Decision: every canary attempt resolved before this point.
        let canary_ok = canary_ctxs
            .iter()
            .all(|ctx| ctx.attempt.outcome.is_terminal_success());

        if !canary_ok {
            // The full-rollout subset is never touched in this branch.
            plan.transition(PlanState::Rollback);
            for ctx in canary_ctxs.iter_mut() {
                let applied = ctx.attempt.apply.as_ref().map(|s| s.ok).unwrap_or(false);
                if ctx.attempt.outcome == AttemptOutcome::Success && applied {
                    self.workers
                        .run_rollback(ctx, "canary decision failed")
                        .await;
                }
            }
            self.absorb(&mut plan, canary_ctxs);
            plan.resolve(PlanState::Failed, PlanOutcome::RolledBack);
            self.finish(&mut plan).await;
            return Ok(Some(plan));
        }

        // Full rollout: independent per-node pipelines, in parallel.
        plan.transition(PlanState::FullRollout);
        let full_ctxs = self
            .build_ctxs(&plan.full, RolloutPhase::Full, report, &registry)
            .await;
        let full_ctxs = self.run_wave(full_ctxs, Stage::FullSequence).await?;

        let all_ok = canary_ctxs
            .iter()
            .chain(full_ctxs.iter())
            .all(|ctx| ctx.attempt.outcome.is_terminal_success());

        if all_ok {
            // Confirmed successful rollout: backups are no longer needed.
            for ctx in canary_ctxs.iter().chain(full_ctxs.iter()) {
                if let Some(backup) = &ctx.backup {
                    self.workers.backups.prune(backup).await;
                }
            }
        }

        self.absorb(&mut plan, canary_ctxs);
        self.absorb(&mut plan, full_ctxs);
        if all_ok {
            plan.resolve(PlanState::Completed, PlanOutcome::Success);
        } else {
            plan.resolve(PlanState::Failed, PlanOutcome::Failed);
        }
        self.finish(&mut plan).await;
        Ok(Some(plan))
    }

    /// Acquire leases and assemble working state for a wave. Leases are held
    /// until the wave's contexts are dropped.
    async fn build_ctxs(
        &self,
        nodes: &[String],
        phase: RolloutPhase,
        report: &DetectionReport,
        registry: &ManifestRegistry,
    ) -> Vec<NodeCtx> {
        let mut ctxs = Vec::with_capacity(nodes.len());
        for node in nodes {
            let Some(manifest) = registry.manifest_for(node) else {
                warn!("{}: no manifest entry; excluded from plan", node);
                continue;
            };
            let lease = self.leases.acquire(node).await;
            ctxs.push(NodeCtx {
                node: node.clone(),
                manifest: manifest.clone(),
                records: report.records_for(node),
                attempt: RemediationAttempt::new(node, phase),
                pre_max: None,
                backup: None,
                events: Vec::new(),
                _lease: lease,
            });
        }
        ctxs
    }

    /// Run one stage over all contexts concurrently, bounded by the worker
    /// pool, and join them all before returning: the inter-stage barrier.
    async fn run_wave(&self, ctxs: Vec<NodeCtx>, stage: Stage) -> Result<Vec<NodeCtx>, EngineError> {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut tasks: JoinSet<NodeCtx> = JoinSet::new();
        for mut ctx in ctxs {
            let workers = self.workers.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
                workers.run_stage(&mut ctx, stage).await;
                ctx
            });
        }

        let mut out = Vec::new();
        while let Some(result) = tasks.join_next().await {
            out.push(result.map_err(|e| {
                EngineError::Validation(format!("remediation task panicked: {}", e))
            })?);
        }
        out.sort_by(|a, b| a.node.cmp(&b.node));
        Ok(out)
    }

    /// Fold finished contexts into the plan: attempts, per-node events,
    /// manual-intervention recommendations.
    fn absorb(&self, plan: &mut RemediationPlan, ctxs: Vec<NodeCtx>) {
        for ctx in ctxs {
            if ctx.attempt.outcome == AttemptOutcome::RollbackFailed {
                plan.recommendations.push(Recommendation {
                    priority: Severity::Critical,
                    action: "manual_intervention".to_string(),
                    detail: format!(
                        "{}: rollback failed; node state is unverified",
                        ctx.node
                    ),
                });
            }
            plan.events.extend(ctx.events);
            plan.attempts.push(ctx.attempt);
        }
        plan.events.sort_by_key(|e| e.timestamp);
        plan.attempts.sort_by(|a, b| a.node.cmp(&b.node));
    }

    /// Audit and notify a terminal plan.
    async fn finish(&self, plan: &mut RemediationPlan) {
        let severity = match plan.outcome {
            PlanOutcome::Success => Severity::Medium,
            _ => Severity::High,
        };
        self.workers
            .notifier
            .notify(
                "remediation_resolved",
                &format!(
                    "plan {} resolved {:?}: {} attempts",
                    plan.id,
                    plan.outcome,
                    plan.attempts.len()
                ),
                severity,
                "driftd:orchestrator",
            )
            .await;

        if let Err(e) = self
            .audit
            .append(drift_common::AuditPayload::Remediation(plan.clone()))
            .await
        {
            error!("Audit append failed for plan {}: {}", plan.id, e);
            self.workers
                .notifier
                .notify(
                    "audit_write_failed",
                    &format!("plan {} could not be committed to the audit trail: {}", plan.id, e),
                    Severity::Critical,
                    "driftd:audit",
                )
                .await;
        }

        info!("Plan {} finished: {:?}", plan.id, plan.outcome);
    }
}
