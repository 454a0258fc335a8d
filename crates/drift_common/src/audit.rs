//! Append-only audit trail records.
//!
//! Every sealed detection report and every terminal remediation plan becomes
//! exactly one entry. Entries carry a strictly monotonic sequence number and
//! are never mutated or deleted.

use crate::plan::RemediationPlan;
use crate::types::DetectionReport;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What an audit entry records.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditPayload {
    Detection(DetectionReport),
    Remediation(RemediationPlan),
}

impl AuditPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            AuditPayload::Detection(_) => "detection",
            AuditPayload::Remediation(_) => "remediation",
        }
    }

    /// Short human line for log output and audit listings.
    pub fn summary_line(&self) -> String {
        match self {
            AuditPayload::Detection(report) => format!(
                "detection {}: {} drift records",
                report.id, report.summary.total
            ),
            AuditPayload::Remediation(plan) => format!(
                "remediation {}: outcome {:?}, {} canary / {} full",
                plan.id,
                plan.outcome,
                plan.canary.len(),
                plan.full.len()
            ),
        }
    }
}

/// One append-only log record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub seq: u64,
    pub recorded_at: DateTime<Utc>,
    pub payload: AuditPayload,
}
