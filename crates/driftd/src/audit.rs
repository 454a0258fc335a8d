//! Audit trail - append-only JSONL with sequence-ordered commit semantics.
//!
//! One line per entry, fsynced before the sequence number is advanced, so
//! the sequence is strictly monotonic and matches file order. Committed
//! entries are never rewritten or deleted. Write failures are retried with
//! backoff; persistent failure surfaces as `AuditWrite` for the caller to
//! escalate without blocking the cycle.

use chrono::Utc;
use drift_common::config::AuditConfig;
use drift_common::{AuditEntry, AuditPayload, EngineError};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{create_dir_all, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

const AUDIT_FILE: &str = "audit.jsonl";

pub struct AuditLogger {
    log_path: PathBuf,
    /// Guards both the next sequence number and the file append, keeping
    /// sequence order identical to file order.
    next_seq: Mutex<u64>,
    max_retries: u32,
    backoff: Duration,
}

impl AuditLogger {
    pub async fn open(config: &AuditConfig) -> Result<Self, EngineError> {
        let dir = Path::new(&config.dir);
        create_dir_all(dir)
            .await
            .map_err(|e| EngineError::AuditWrite(format!("cannot create {}: {}", config.dir, e)))?;
        let log_path = dir.join(AUDIT_FILE);
        let next_seq = last_seq(&log_path).await.map(|s| s + 1).unwrap_or(0);

        info!("Audit trail at {} (next seq {})", log_path.display(), next_seq);

        Ok(Self {
            log_path,
            next_seq: Mutex::new(next_seq),
            max_retries: config.max_write_retries,
            backoff: Duration::from_millis(config.backoff_ms),
        })
    }

    /// Append one entry. The sequence number is only consumed once the line
    /// is durably written.
    pub async fn append(&self, payload: AuditPayload) -> Result<AuditEntry, EngineError> {
        let mut seq = self.next_seq.lock().await;
        let entry = AuditEntry {
            seq: *seq,
            recorded_at: Utc::now(),
            payload,
        };
        let line = serde_json::to_string(&entry)? + "\n";

        let mut last_err = String::new();
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let backoff = self.backoff * 2u32.saturating_pow(attempt - 1);
                warn!(
                    "Audit write retry {}/{} after {:?}: {}",
                    attempt, self.max_retries, backoff, last_err
                );
                tokio::time::sleep(backoff).await;
            }
            match self.write_line(&line).await {
                Ok(()) => {
                    *seq += 1;
                    info!("Audit entry {} committed: {}", entry.seq, entry.payload.summary_line());
                    return Ok(entry);
                }
                Err(e) => last_err = e.to_string(),
            }
        }

        Err(EngineError::AuditWrite(format!(
            "append failed after {} retries: {}",
            self.max_retries, last_err
        )))
    }

    async fn write_line(&self, line: &str) -> Result<(), EngineError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.sync_all().await?;
        Ok(())
    }

    /// Read the whole trail (for the audit listing command).
    pub async fn read_all(&self) -> Result<Vec<AuditEntry>, EngineError> {
        if !self.log_path.exists() {
            return Ok(vec![]);
        }
        let content = tokio::fs::read_to_string(&self.log_path).await?;
        Ok(content
            .lines()
            .filter(|line| !line.is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }

    pub fn path(&self) -> &Path {
        &self.log_path
    }
}

async fn last_seq(path: &Path) -> Option<u64> {
    let content = tokio::fs::read_to_string(path).await.ok()?;
    content
        .lines()
        .rev()
        .find_map(|line| serde_json::from_str::<AuditEntry>(line).ok())
        .map(|entry| entry.seq)
}
