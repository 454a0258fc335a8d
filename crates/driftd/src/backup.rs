//! Backup manager - pre-change snapshots of a node's managed artifacts.
//!
//! Captured before any Apply. Contents live under one directory per attempt
//! with a `backup.json` manifest whose checksums are what rollback verifies
//! against. Retained after rollback for forensics; pruned only after a fully
//! successful rollout.

use crate::transport::RemoteChannel;
use chrono::Utc;
use drift_common::hash::sha256_hex;
use drift_common::plan::{Backup, BackupFile};
use drift_common::{EngineError, RoleManifest};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{info, warn};

const BACKUP_MANIFEST: &str = "backup.json";

pub struct BackupManager {
    channel: Arc<dyn RemoteChannel>,
    backup_dir: PathBuf,
}

impl BackupManager {
    pub fn new(channel: Arc<dyn RemoteChannel>, backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            channel,
            backup_dir: backup_dir.into(),
        }
    }

    /// Capture the node's managed files (contents + modes) and service
    /// states. Any failure aborts the node's attempt before Apply.
    pub async fn capture(
        &self,
        node: &str,
        attempt_id: &str,
        manifest: &RoleManifest,
    ) -> Result<Backup, EngineError> {
        let id = format!("{}_{}", node, attempt_id);
        let dir = self.backup_dir.join(&id);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| EngineError::Backup(format!("cannot create {}: {}", dir.display(), e)))?;

        let mut files = BTreeMap::new();
        for path in manifest.files.keys() {
            let bytes = self
                .channel
                .read_file(node, path)
                .await
                .map_err(|e| EngineError::Backup(format!("{}: read {}: {}", node, path, e)))?;
            let Some(bytes) = bytes else {
                // Absent files are recorded as absent; rollback will not
                // recreate them.
                continue;
            };

            let mode = self.file_mode(node, path).await?;
            let local = local_path(&dir, path);
            if let Some(parent) = local.parent() {
                fs::create_dir_all(parent).await.map_err(|e| {
                    EngineError::Backup(format!("cannot create {}: {}", parent.display(), e))
                })?;
            }
            fs::write(&local, &bytes)
                .await
                .map_err(|e| EngineError::Backup(format!("write {}: {}", local.display(), e)))?;

            files.insert(
                path.clone(),
                BackupFile {
                    sha256: sha256_hex(&bytes),
                    mode,
                },
            );
        }

        let mut services = BTreeMap::new();
        for service in manifest.services.keys() {
            let output = self
                .channel
                .execute(node, &format!("systemctl is-active {}", service))
                .await
                .map_err(|e| EngineError::Backup(format!("{}: query {}: {}", node, service, e)))?;
            services.insert(
                service.clone(),
                drift_common::types::ServiceState::parse(&output.stdout_text()),
            );
        }

        let backup = Backup {
            id,
            node: node.to_string(),
            attempt_id: attempt_id.to_string(),
            created_at: Utc::now(),
            files,
            services,
            dir: dir.clone(),
        };

        let manifest_json = serde_json::to_string_pretty(&backup)?;
        fs::write(dir.join(BACKUP_MANIFEST), manifest_json)
            .await
            .map_err(|e| EngineError::Backup(format!("write backup manifest: {}", e)))?;

        info!(
            "Backup {} captured: {} files, {} services",
            backup.id,
            backup.files.len(),
            backup.services.len()
        );
        Ok(backup)
    }

    /// Stored content for one captured path.
    pub async fn stored_content(&self, backup: &Backup, path: &str) -> Result<Vec<u8>, EngineError> {
        let local = local_path(&backup.dir, path);
        fs::read(&local)
            .await
            .map_err(|e| EngineError::Rollback(format!("backup content {} missing: {}", local.display(), e)))
    }

    /// Delete a backup after a confirmed successful rollout.
    pub async fn prune(&self, backup: &Backup) {
        if let Err(e) = fs::remove_dir_all(&backup.dir).await {
            warn!("Failed to prune backup {}: {}", backup.id, e);
        } else {
            info!("Pruned backup {}", backup.id);
        }
    }

    async fn file_mode(&self, node: &str, path: &str) -> Result<Option<u32>, EngineError> {
        let output = self
            .channel
            .execute(node, &format!("stat -c %a '{}'", path))
            .await
            .map_err(|e| EngineError::Backup(format!("{}: stat {}: {}", node, path, e)))?;
        if !output.success() {
            return Ok(None);
        }
        Ok(u32::from_str_radix(output.stdout_text().trim(), 8).ok())
    }
}

fn local_path(dir: &Path, remote_path: &str) -> PathBuf {
    dir.join("files").join(remote_path.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_path_strips_root() {
        let dir = Path::new("/var/lib/driftd/backups/target1_a1");
        assert_eq!(
            local_path(dir, "/etc/nginx/nginx.conf"),
            Path::new("/var/lib/driftd/backups/target1_a1/files/etc/nginx/nginx.conf")
        );
    }
}
