//! State collector - gathers one node's observed configuration.
//!
//! For every manifest path the collector hashes the remote content; for every
//! manifest service it queries activation state; managed directories are
//! enumerated so unexpected files can be reported. A node that cannot be
//! reached yields an `Unreachable` error and is excluded from comparison for
//! the cycle without aborting it.

use crate::transport::RemoteChannel;
use chrono::Utc;
use drift_common::hash::{normalized_sha256_hex, sha256_hex};
use drift_common::types::{CollectionStatus, FileObservation, ObservedState, ServiceState};
use drift_common::{EngineError, RoleManifest};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info};

pub struct StateCollector {
    channel: Arc<dyn RemoteChannel>,
}

impl StateCollector {
    pub fn new(channel: Arc<dyn RemoteChannel>) -> Self {
        Self { channel }
    }

    /// Snapshot the node's observed state against its manifest.
    pub async fn collect(
        &self,
        node: &str,
        manifest: &RoleManifest,
    ) -> Result<ObservedState, EngineError> {
        let mut files = BTreeMap::new();
        let mut missing = BTreeSet::new();

        for path in manifest.files.keys() {
            match self.channel.read_file(node, path).await {
                Ok(Some(bytes)) => {
                    files.insert(
                        path.clone(),
                        FileObservation {
                            sha256: sha256_hex(&bytes),
                            normalized_sha256: normalized_sha256_hex(&bytes),
                        },
                    );
                }
                Ok(None) => {
                    debug!("{}: {} absent", node, path);
                    missing.insert(path.clone());
                }
                Err(e) => return Err(unreachable_error(node, e)),
            }
        }

        let mut services = BTreeMap::new();
        for service in manifest.services.keys() {
            let state = self.service_state(node, service).await?;
            services.insert(service.clone(), state);
        }

        let mut extra_files = BTreeSet::new();
        for dir in &manifest.managed_dirs {
            for path in self.list_files(node, dir).await? {
                if !manifest.files.contains_key(&path) {
                    extra_files.insert(path);
                }
            }
        }

        info!(
            "{}: collected {} files ({} missing, {} unexpected), {} services",
            node,
            files.len(),
            missing.len(),
            extra_files.len(),
            services.len()
        );

        Ok(ObservedState {
            node: node.to_string(),
            collected_at: Utc::now(),
            status: CollectionStatus::Ok,
            files,
            missing,
            extra_files,
            services,
        })
    }

    async fn service_state(&self, node: &str, service: &str) -> Result<ServiceState, EngineError> {
        // `systemctl is-active` exits nonzero for inactive units but still
        // prints the state; parse stdout regardless of exit code.
        let output = self
            .channel
            .execute(node, &format!("systemctl is-active {}", service))
            .await
            .map_err(|e| unreachable_error(node, e))?;
        Ok(ServiceState::parse(&output.stdout_text()))
    }

    async fn list_files(&self, node: &str, dir: &str) -> Result<Vec<String>, EngineError> {
        let output = self
            .channel
            .execute(node, &format!("find '{}' -type f", dir))
            .await
            .map_err(|e| unreachable_error(node, e))?;
        if !output.success() {
            // Directory may legitimately not exist yet on this node.
            debug!("{}: find {} failed: {}", node, dir, output.stderr_text().trim());
            return Ok(Vec::new());
        }
        Ok(output
            .stdout_text()
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }
}

fn unreachable_error(node: &str, source: EngineError) -> EngineError {
    match source {
        e @ EngineError::Unreachable { .. } => e,
        other => EngineError::Unreachable {
            node: node.to_string(),
            reason: other.to_string(),
        },
    }
}
