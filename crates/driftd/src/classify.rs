//! Drift classifier - ordered rule table mapping mismatches to severities.
//!
//! Rules are evaluated in priority order and the first match wins, so the
//! same input always yields the same severity. No randomness, no hidden
//! state. The final rule matches everything.

use drift_common::config::ClassifyConfig;
use drift_common::types::{DriftCategory, DriftRecord, Mismatch, Severity};

struct Rule {
    name: &'static str,
    severity: Severity,
    matches: fn(&Mismatch, &ClassifyConfig) -> bool,
}

pub struct Classifier {
    config: ClassifyConfig,
    rules: Vec<Rule>,
}

fn starts_with_any(item: &str, prefixes: &[String]) -> bool {
    prefixes.iter().any(|p| item.starts_with(p.as_str()))
}

impl Classifier {
    pub fn new(config: ClassifyConfig) -> Self {
        let rules = vec![
            Rule {
                name: "service-down",
                severity: Severity::Critical,
                matches: |m, _| {
                    m.category == DriftCategory::ServiceState
                        && m.expected == "active"
                        && m.observed != "active"
                },
            },
            Rule {
                name: "service-state",
                severity: Severity::Medium,
                matches: |m, _| m.category == DriftCategory::ServiceState,
            },
            Rule {
                name: "whitespace-only",
                severity: Severity::Low,
                matches: |m, _| m.category == DriftCategory::FileContent && m.whitespace_only,
            },
            Rule {
                name: "critical-path",
                severity: Severity::Critical,
                matches: |m, c| {
                    matches!(
                        m.category,
                        DriftCategory::FileContent | DriftCategory::FileMissing
                    ) && starts_with_any(&m.item, &c.critical_paths)
                },
            },
            Rule {
                name: "core-config",
                severity: Severity::High,
                matches: |m, c| {
                    m.category == DriftCategory::FileContent
                        && starts_with_any(&m.item, &c.core_config_paths)
                },
            },
            Rule {
                name: "file-missing",
                severity: Severity::High,
                matches: |m, _| m.category == DriftCategory::FileMissing,
            },
            Rule {
                name: "unauthorized-file",
                severity: Severity::Medium,
                matches: |m, _| m.category == DriftCategory::FileAdded,
            },
            Rule {
                name: "fallback",
                severity: Severity::Medium,
                matches: |_, _| true,
            },
        ];
        Self { config, rules }
    }

    /// Severity and the name of the first rule that matched.
    pub fn classify(&self, mismatch: &Mismatch) -> (Severity, &'static str) {
        for rule in &self.rules {
            if (rule.matches)(mismatch, &self.config) {
                return (rule.severity, rule.name);
            }
        }
        unreachable!("fallback rule matches everything")
    }

    /// Turn a mismatch into a classified drift record.
    pub fn record(&self, mismatch: Mismatch) -> DriftRecord {
        let (severity, rule) = self.classify(&mismatch);
        DriftRecord {
            node: mismatch.node,
            item: mismatch.item,
            category: mismatch.category,
            expected: mismatch.expected,
            observed: mismatch.observed,
            severity,
            rule: rule.to_string(),
        }
    }

    /// Classify a whole comparator batch.
    pub fn records(&self, mismatches: Vec<Mismatch>) -> Vec<DriftRecord> {
        mismatches.into_iter().map(|m| self.record(m)).collect()
    }
}
