//! Rollback manager - exact restore from a pre-change backup.
//!
//! Restores file contents, permissions and service activation from the
//! stored Backup, then re-verifies the node against the backup's own
//! checksums. Rollback is exact restoration, not a re-run of desired-state
//! convergence. A failed rollback is fatal for the node and escalated for
//! manual intervention; it is never auto-retried.

use crate::backup::BackupManager;
use crate::transport::RemoteChannel;
use drift_common::hash::sha256_hex;
use drift_common::plan::Backup;
use drift_common::types::ServiceState;
use drift_common::EngineError;
use std::sync::Arc;
use tracing::info;

pub struct RollbackManager {
    channel: Arc<dyn RemoteChannel>,
}

impl RollbackManager {
    pub fn new(channel: Arc<dyn RemoteChannel>) -> Self {
        Self { channel }
    }

    pub async fn rollback(
        &self,
        backup: &Backup,
        backups: &BackupManager,
    ) -> Result<(), EngineError> {
        let node = backup.node.as_str();
        info!("Rolling back {} from backup {}", node, backup.id);

        for (path, captured) in &backup.files {
            let contents = backups.stored_content(backup, path).await?;
            self.channel
                .write_file(node, path, &contents, captured.mode)
                .await
                .map_err(|e| EngineError::Rollback(format!("{}: restore {}: {}", node, path, e)))?;
        }

        for (service, state) in &backup.services {
            let command = match state {
                ServiceState::Active => format!("systemctl start {}", service),
                _ => format!("systemctl stop {}", service),
            };
            let output = self
                .channel
                .execute(node, &command)
                .await
                .map_err(|e| EngineError::Rollback(format!("{}: {}: {}", node, command, e)))?;
            if !output.success() {
                return Err(EngineError::Rollback(format!(
                    "{}: {} exited {}: {}",
                    node,
                    command,
                    output.exit_code,
                    output.stderr_text().trim()
                )));
            }
        }

        self.verify(backup).await?;
        info!("Rollback of {} verified against backup {}", node, backup.id);
        Ok(())
    }

    /// Re-read the restored state and check it matches the backup's captured
    /// checksums exactly.
    async fn verify(&self, backup: &Backup) -> Result<(), EngineError> {
        let node = backup.node.as_str();

        for (path, captured) in &backup.files {
            let bytes = self
                .channel
                .read_file(node, path)
                .await
                .map_err(|e| EngineError::Rollback(format!("{}: verify {}: {}", node, path, e)))?
                .ok_or_else(|| {
                    EngineError::Rollback(format!("{}: {} absent after restore", node, path))
                })?;
            let restored = sha256_hex(&bytes);
            if restored != captured.sha256 {
                return Err(EngineError::Rollback(format!(
                    "{}: {} checksum mismatch after restore (want {}, got {})",
                    node, path, captured.sha256, restored
                )));
            }
        }

        for (service, expected) in &backup.services {
            let output = self
                .channel
                .execute(node, &format!("systemctl is-active {}", service))
                .await
                .map_err(|e| EngineError::Rollback(format!("{}: verify {}: {}", node, service, e)))?;
            let observed = ServiceState::parse(&output.stdout_text());
            if observed != *expected {
                return Err(EngineError::Rollback(format!(
                    "{}: service {} is {} after restore, backup recorded {}",
                    node, service, observed, expected
                )));
            }
        }

        Ok(())
    }
}
