//! Report emitter - seals detection reports and writes their artifacts.
//!
//! Each cycle produces a JSON report, a Markdown summary next to it, and a
//! `latest.json` pointer the remediation cycle reads.

use anyhow::{Context, Result};
use drift_common::types::{DetectionReport, NodeCycleStatus};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::info;

pub const LATEST_REPORT: &str = "latest.json";

pub struct ReportEmitter {
    report_dir: PathBuf,
}

impl ReportEmitter {
    pub fn new(report_dir: impl Into<PathBuf>) -> Self {
        Self {
            report_dir: report_dir.into(),
        }
    }

    /// Seal the report and write its artifacts. Returns the JSON report path.
    pub async fn seal_and_write(&self, report: &mut DetectionReport) -> Result<PathBuf> {
        report.seal();

        fs::create_dir_all(&self.report_dir)
            .await
            .context("Failed to create report directory")?;

        let json_path = self.report_dir.join(format!("detection_{}.json", report.id));
        let json = serde_json::to_string_pretty(report)?;
        fs::write(&json_path, &json)
            .await
            .context("Failed to write detection report")?;

        let md_path = self.report_dir.join(format!("summary_{}.md", report.id));
        fs::write(&md_path, render_markdown(report))
            .await
            .context("Failed to write summary report")?;

        fs::write(self.report_dir.join(LATEST_REPORT), &json)
            .await
            .context("Failed to update latest report pointer")?;

        info!(
            "Sealed report {}: {} drift records across {} nodes",
            report.id,
            report.summary.total,
            report.nodes.len()
        );

        Ok(json_path)
    }

    /// Load the most recently sealed report, if any.
    pub async fn load_latest(&self) -> Result<Option<DetectionReport>> {
        let path = self.report_dir.join(LATEST_REPORT);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)
            .await
            .context("Failed to read latest report")?;
        let report = serde_json::from_str(&content).context("Failed to parse latest report")?;
        Ok(Some(report))
    }

    pub fn dir(&self) -> &Path {
        &self.report_dir
    }
}

fn render_markdown(report: &DetectionReport) -> String {
    let mut out = String::new();
    out.push_str("# Drift Detection Report\n");
    out.push_str(&format!("**Report ID:** {}\n", report.id));
    if let Some(sealed_at) = report.sealed_at {
        out.push_str(&format!("**Sealed:** {}\n", sealed_at.to_rfc3339()));
    }
    out.push_str("\n## Summary\n");
    out.push_str(&format!("- **Total Detections:** {}\n", report.summary.total));

    if !report.summary.by_severity.is_empty() {
        out.push_str("\n### By Severity\n");
        for (severity, count) in &report.summary.by_severity {
            out.push_str(&format!("- **{}:** {}\n", severity, count));
        }
    }

    if !report.summary.by_category.is_empty() {
        out.push_str("\n### By Category\n");
        for (category, count) in &report.summary.by_category {
            out.push_str(&format!("- **{}:** {}\n", category, count));
        }
    }

    out.push_str("\n## Nodes\n");
    for (node, status) in &report.nodes {
        let label = match status {
            NodeCycleStatus::Clean => "clean",
            NodeCycleStatus::Drifted => "drifted",
            NodeCycleStatus::Unreachable => "unreachable",
        };
        out.push_str(&format!("- **{}:** {}\n", node, label));
    }

    if !report.records.is_empty() {
        out.push_str("\n## Detections\n");
        for (i, record) in report.records.iter().enumerate() {
            out.push_str(&format!(
                "\n### Detection #{}\n- **Node:** {}\n- **Item:** {}\n- **Category:** {}\n- **Severity:** {}\n- **Expected:** {}\n- **Observed:** {}\n",
                i + 1,
                record.node,
                record.item,
                record.category,
                record.severity,
                record.expected,
                record.observed,
            ));
        }
    }

    out.push_str("\n---\n*Report generated by driftd*\n");
    out
}
