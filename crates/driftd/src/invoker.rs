//! Convergence action invoker - triggers the external tool that brings a
//! node toward desired state for a given scope.

use async_trait::async_trait;
use drift_common::types::{DriftCategory, DriftRecord};
use drift_common::EngineError;
use std::collections::BTreeSet;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::info;

use crate::transport::with_timeout;

/// Outcome of one convergence run.
#[derive(Debug, Clone)]
pub struct ApplyReport {
    pub changed: bool,
    pub detail: String,
}

#[async_trait]
pub trait ConvergenceInvoker: Send + Sync {
    /// Bring `node` toward desired state for `scope` (a comma-joined tag
    /// list). Transient failures surface as `EngineError::Apply` and are
    /// retried by the orchestrator up to its ceiling.
    async fn apply(&self, node: &str, scope: &str) -> Result<ApplyReport, EngineError>;
}

/// Derive the convergence scope tags from a node's drift records.
pub fn scope_for(records: &[DriftRecord]) -> String {
    let mut tags = BTreeSet::new();
    for record in records {
        match record.category {
            DriftCategory::FileContent | DriftCategory::FileMissing | DriftCategory::FileAdded => {
                tags.insert("content");
            }
            DriftCategory::ServiceState => {
                tags.insert("services");
            }
        }
    }
    tags.into_iter().collect::<Vec<_>>().join(",")
}

/// Shipped invoker: runs the configured playbook limited to one node.
pub struct PlaybookInvoker {
    playbook: String,
    inventory: String,
    timeout: Duration,
}

impl PlaybookInvoker {
    pub fn new(playbook: &str, inventory: &str, timeout: Duration) -> Self {
        Self {
            playbook: playbook.to_string(),
            inventory: inventory.to_string(),
            timeout,
        }
    }
}

#[async_trait]
impl ConvergenceInvoker for PlaybookInvoker {
    async fn apply(&self, node: &str, scope: &str) -> Result<ApplyReport, EngineError> {
        info!("Converging {} (tags: {})", node, scope);

        let run = async {
            let output = Command::new("ansible-playbook")
                .arg("-i")
                .arg(&self.inventory)
                .arg(&self.playbook)
                .arg("--limit")
                .arg(node)
                .arg("--tags")
                .arg(scope)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output()
                .await
                .map_err(|e| EngineError::Apply(format!("ansible-playbook spawn failed: {}", e)))?;

            if output.status.success() {
                let stdout = String::from_utf8_lossy(&output.stdout);
                Ok(ApplyReport {
                    changed: stdout.contains("changed="),
                    detail: format!("converged with tags {}", scope),
                })
            } else {
                Err(EngineError::Apply(format!(
                    "ansible-playbook exited {}: {}",
                    output.status.code().unwrap_or(-1),
                    String::from_utf8_lossy(&output.stderr).trim()
                )))
            }
        };

        with_timeout(self.timeout, run).await.map_err(|e| match e {
            EngineError::Transport(msg) => EngineError::Apply(msg),
            other => other,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drift_common::types::Severity;

    fn record(item: &str, category: DriftCategory) -> DriftRecord {
        DriftRecord {
            node: "target1".to_string(),
            item: item.to_string(),
            category,
            expected: String::new(),
            observed: String::new(),
            severity: Severity::Medium,
            rule: "test".to_string(),
        }
    }

    #[test]
    fn test_scope_content_only() {
        let records = vec![record("/var/www/html/index.html", DriftCategory::FileContent)];
        assert_eq!(scope_for(&records), "content");
    }

    #[test]
    fn test_scope_mixed_is_sorted_and_deduped() {
        let records = vec![
            record("nginx", DriftCategory::ServiceState),
            record("/etc/nginx/nginx.conf", DriftCategory::FileContent),
            record("/var/www/html/x.php", DriftCategory::FileAdded),
        ];
        assert_eq!(scope_for(&records), "content,services");
    }
}
