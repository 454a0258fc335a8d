//! Detection cycle driver.
//!
//! Collects every managed node concurrently (bounded by the worker pool),
//! compares and classifies, seals one DetectionReport, appends it to the
//! audit trail and raises notifications. Unreachable nodes are recorded, not
//! treated as cycle failure.

use crate::audit::AuditLogger;
use crate::classify::Classifier;
use crate::collector::StateCollector;
use crate::compare;
use crate::lease::NodeLeases;
use crate::notify::Notifier;
use crate::registry::ManifestRegistry;
use crate::report::ReportEmitter;
use drift_common::types::{DetectionReport, DriftRecord, NodeCycleStatus};
use drift_common::{AuditPayload, EngineError};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

pub struct DetectionRunner {
    collector: Arc<StateCollector>,
    classifier: Arc<Classifier>,
    emitter: ReportEmitter,
    audit: Arc<AuditLogger>,
    notifier: Arc<dyn Notifier>,
    leases: NodeLeases,
    max_concurrent: usize,
}

impl DetectionRunner {
    pub fn new(
        collector: Arc<StateCollector>,
        classifier: Arc<Classifier>,
        emitter: ReportEmitter,
        audit: Arc<AuditLogger>,
        notifier: Arc<dyn Notifier>,
        leases: NodeLeases,
        max_concurrent: usize,
    ) -> Self {
        Self {
            collector,
            classifier,
            emitter,
            audit,
            notifier,
            leases,
            max_concurrent,
        }
    }

    /// Run one detection cycle over all managed nodes.
    pub async fn run_cycle(
        &self,
        registry: Arc<ManifestRegistry>,
    ) -> Result<DetectionReport, EngineError> {
        let nodes = registry.nodes();
        info!("Starting detection cycle over {} nodes", nodes.len());

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut tasks: JoinSet<(String, NodeCycleStatus, Vec<DriftRecord>)> = JoinSet::new();

        for node in nodes {
            let semaphore = semaphore.clone();
            let registry = registry.clone();
            let collector = self.collector.clone();
            let classifier = self.classifier.clone();
            let leases = self.leases.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
                let _lease = leases.acquire(&node).await;

                let Some(manifest) = registry.manifest_for(&node) else {
                    // validate() guarantees every node has a role; treat a
                    // gap as unreachable rather than panicking mid-cycle.
                    warn!("{}: no manifest entry", node);
                    return (node, NodeCycleStatus::Unreachable, vec![]);
                };

                match collector.collect(&node, manifest).await {
                    Ok(observed) => {
                        let records = classifier.records(compare::compare(&observed, manifest));
                        let status = if records.is_empty() {
                            NodeCycleStatus::Clean
                        } else {
                            NodeCycleStatus::Drifted
                        };
                        (node, status, records)
                    }
                    Err(e) => {
                        warn!("{}: collection failed: {}", node, e);
                        (node, NodeCycleStatus::Unreachable, vec![])
                    }
                }
            });
        }

        let mut report = DetectionReport::new();
        while let Some(result) = tasks.join_next().await {
            let (node, status, records) = result
                .map_err(|e| EngineError::Validation(format!("detection task panicked: {}", e)))?;
            report.push_node(&node, status, records);
        }

        self.emitter
            .seal_and_write(&mut report)
            .await
            .map_err(|e| EngineError::Io(std::io::Error::other(e.to_string())))?;

        if let Some(max) = report.max_severity() {
            self.notifier
                .notify(
                    "drift_detected",
                    &format!(
                        "{} drift records across {} nodes (max severity {})",
                        report.summary.total,
                        report.drifted_nodes().len(),
                        max
                    ),
                    max,
                    "driftd:detect",
                )
                .await;
        }

        if let Err(e) = self.audit.append(AuditPayload::Detection(report.clone())).await {
            // Audit failure is escalated but never blocks the cycle.
            error!("Audit append failed for report {}: {}", report.id, e);
            self.notifier
                .notify(
                    "audit_write_failed",
                    &format!("report {} could not be committed to the audit trail: {}", report.id, e),
                    drift_common::types::Severity::Critical,
                    "driftd:audit",
                )
                .await;
        }

        info!(
            "Detection cycle {} complete: {} records, {} drifted nodes",
            report.id,
            report.summary.total,
            report.drifted_nodes().len()
        );
        Ok(report)
    }
}
