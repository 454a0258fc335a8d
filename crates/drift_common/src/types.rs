//! Detection-side value objects: observed state, drift records, reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Drift severity. Ordering follows risk: `Low < Medium < High < Critical`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        write!(f, "{}", s)
    }
}

/// What kind of deviation a drift record describes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum DriftCategory {
    FileContent,
    FileMissing,
    FileAdded,
    ServiceState,
}

impl fmt::Display for DriftCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DriftCategory::FileContent => "file_content",
            DriftCategory::FileMissing => "file_missing",
            DriftCategory::FileAdded => "file_added",
            DriftCategory::ServiceState => "service_state",
        };
        write!(f, "{}", s)
    }
}

/// Service activation state as reported by the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Active,
    Inactive,
    Failed,
    Unknown,
}

impl ServiceState {
    pub fn parse(s: &str) -> Self {
        match s.trim() {
            "active" => ServiceState::Active,
            "inactive" => ServiceState::Inactive,
            "failed" => ServiceState::Failed,
            _ => ServiceState::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Active => "active",
            ServiceState::Inactive => "inactive",
            ServiceState::Failed => "failed",
            ServiceState::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One observed file: content hash plus whitespace-normalized hash.
/// Permissions are not observed here; backups capture them at snapshot time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileObservation {
    pub sha256: String,
    pub normalized_sha256: String,
}

/// Whether a node answered during collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionStatus {
    Ok,
    Unreachable,
}

/// Point-in-time snapshot of one node, produced by the collector.
///
/// Keyed with ordered maps so two snapshots of the same state compare and
/// serialize identically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservedState {
    pub node: String,
    pub collected_at: DateTime<Utc>,
    pub status: CollectionStatus,
    /// Manifest paths present on the node.
    pub files: BTreeMap<String, FileObservation>,
    /// Manifest paths absent on the node.
    pub missing: BTreeSet<String>,
    /// Files found under managed directories but not in the manifest.
    pub extra_files: BTreeSet<String>,
    pub services: BTreeMap<String, ServiceState>,
}

impl ObservedState {
    pub fn unreachable(node: &str) -> Self {
        Self {
            node: node.to_string(),
            collected_at: Utc::now(),
            status: CollectionStatus::Unreachable,
            files: BTreeMap::new(),
            missing: BTreeSet::new(),
            extra_files: BTreeSet::new(),
            services: BTreeMap::new(),
        }
    }
}

/// An itemized deviation found by the comparator, before classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mismatch {
    pub node: String,
    /// File path or service name.
    pub item: String,
    pub category: DriftCategory,
    pub expected: String,
    pub observed: String,
    /// Set when the content difference vanishes under whitespace
    /// normalization.
    pub whitespace_only: bool,
}

/// One classified mismatch. Immutable once created.
///
/// Deliberately carries no timestamp: re-running detection over unchanged
/// state must yield an identical record multiset.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DriftRecord {
    pub node: String,
    pub item: String,
    pub category: DriftCategory,
    pub expected: String,
    pub observed: String,
    pub severity: Severity,
    /// Name of the classifier rule that matched.
    pub rule: String,
}

/// Per-node outcome of a detection cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeCycleStatus {
    Clean,
    Drifted,
    Unreachable,
}

/// Summary counts for a sealed report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub total: usize,
    pub by_severity: BTreeMap<Severity, usize>,
    pub by_category: BTreeMap<DriftCategory, usize>,
}

/// Result of one detection cycle. Mutable while being assembled, immutable
/// once sealed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionReport {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub sealed_at: Option<DateTime<Utc>>,
    pub nodes: BTreeMap<String, NodeCycleStatus>,
    pub records: Vec<DriftRecord>,
    pub summary: ReportSummary,
}

impl DetectionReport {
    pub fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            sealed_at: None,
            nodes: BTreeMap::new(),
            records: Vec::new(),
            summary: ReportSummary::default(),
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed_at.is_some()
    }

    /// Record one node's outcome. Panics in debug builds if called after
    /// sealing; sealed reports are immutable.
    pub fn push_node(&mut self, node: &str, status: NodeCycleStatus, records: Vec<DriftRecord>) {
        debug_assert!(!self.is_sealed(), "sealed reports are immutable");
        self.nodes.insert(node.to_string(), status);
        self.records.extend(records);
    }

    /// Compute summary counts and freeze the report.
    pub fn seal(&mut self) {
        if self.is_sealed() {
            return;
        }
        self.records.sort();
        let mut summary = ReportSummary {
            total: self.records.len(),
            ..Default::default()
        };
        for record in &self.records {
            *summary.by_severity.entry(record.severity).or_insert(0) += 1;
            *summary.by_category.entry(record.category).or_insert(0) += 1;
        }
        self.summary = summary;
        self.sealed_at = Some(Utc::now());
    }

    /// Nodes with at least one drift record, sorted.
    pub fn drifted_nodes(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|(_, status)| **status == NodeCycleStatus::Drifted)
            .map(|(node, _)| node.clone())
            .collect()
    }

    /// Drift records for one node.
    pub fn records_for(&self, node: &str) -> Vec<DriftRecord> {
        self.records
            .iter()
            .filter(|r| r.node == node)
            .cloned()
            .collect()
    }

    /// Highest severity present, if any drift was found.
    pub fn max_severity(&self) -> Option<Severity> {
        self.records.iter().map(|r| r.severity).max()
    }
}

impl Default for DetectionReport {
    fn default() -> Self {
        Self::new()
    }
}
