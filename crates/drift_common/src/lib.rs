//! Shared types for the drift detection and remediation engine.
//!
//! Value objects exchanged between the collector, comparator, classifier,
//! orchestrator and the audit trail. Everything here is plain data: the
//! engine logic lives in the `driftd` crate.

pub mod audit;
pub mod config;
pub mod error;
pub mod hash;
pub mod manifest;
pub mod plan;
pub mod types;

pub use audit::{AuditEntry, AuditPayload};
pub use config::EngineConfig;
pub use error::EngineError;
pub use manifest::{FileExpectation, FleetManifest, RoleManifest};
pub use plan::{
    AttemptOutcome, Backup, BackupFile, EventLevel, PlanEvent, PlanOutcome, PlanState,
    Recommendation, RemediationAttempt, RemediationPlan, RolloutPhase, StepResult,
};
pub use types::{
    CollectionStatus, DetectionReport, DriftCategory, DriftRecord, FileObservation, Mismatch,
    NodeCycleStatus, ObservedState, ReportSummary, ServiceState, Severity,
};
