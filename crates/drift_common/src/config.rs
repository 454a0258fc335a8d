//! Engine configuration.
//!
//! Loaded from /etc/driftd/config.yaml (or a path given on the command
//! line). Every field has a serde default so a partial file works; a
//! malformed or inconsistent file fails fast before any node is touched.

use crate::error::EngineError;
use crate::types::Severity;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Default config file path
pub const CONFIG_PATH: &str = "/etc/driftd/config.yaml";

/// Remote transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// SSH user for the remote-execution channel
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,

    /// Per-operation timeout in seconds; a timeout counts as a failure
    #[serde(default = "default_op_timeout")]
    pub op_timeout_secs: u64,

    /// Connection setup timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_ssh_user() -> String {
    "drift".to_string()
}

fn default_op_timeout() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    10
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ssh_user: default_ssh_user(),
            op_timeout_secs: default_op_timeout(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl TransportConfig {
    pub fn op_timeout(&self) -> Duration {
        Duration::from_secs(self.op_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Detection cycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Desired-state manifest path
    #[serde(default = "default_manifest_path")]
    pub manifest_path: String,

    /// Where sealed reports and the latest-report pointer are written
    #[serde(default = "default_report_dir")]
    pub report_dir: String,

    /// Worker-pool bound for concurrent per-node collection
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_nodes: usize,

    /// Minimum severity that triggers a notification
    #[serde(default = "default_notify_threshold")]
    pub notify_threshold: Severity,
}

fn default_manifest_path() -> String {
    "/etc/driftd/manifest.yaml".to_string()
}

fn default_report_dir() -> String {
    "/var/lib/driftd/reports".to_string()
}

fn default_max_concurrent() -> usize {
    8
}

fn default_notify_threshold() -> Severity {
    Severity::High
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            manifest_path: default_manifest_path(),
            report_dir: default_report_dir(),
            max_concurrent_nodes: default_max_concurrent(),
            notify_threshold: default_notify_threshold(),
        }
    }
}

/// Remediation and canary settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationConfig {
    /// Fraction of drifted nodes remediated first as canaries
    #[serde(default = "default_canary_fraction")]
    pub canary_fraction: f64,

    /// Retry ceiling for transient apply failures
    #[serde(default = "default_apply_retries")]
    pub apply_max_retries: u32,

    /// Base backoff between apply retries, doubled per retry
    #[serde(default = "default_apply_backoff")]
    pub apply_backoff_ms: u64,

    /// Where pre-change backups are stored
    #[serde(default = "default_backup_dir")]
    pub backup_dir: String,

    /// Playbook handed to the convergence action invoker
    #[serde(default = "default_playbook")]
    pub playbook: String,

    /// Inventory handed to the convergence action invoker
    #[serde(default = "default_inventory")]
    pub inventory: String,
}

fn default_canary_fraction() -> f64 {
    0.25
}

fn default_apply_retries() -> u32 {
    3
}

fn default_apply_backoff() -> u64 {
    500
}

fn default_backup_dir() -> String {
    "/var/lib/driftd/backups".to_string()
}

fn default_playbook() -> String {
    "/etc/driftd/converge.yml".to_string()
}

fn default_inventory() -> String {
    "/etc/driftd/inventory.ini".to_string()
}

impl Default for RemediationConfig {
    fn default() -> Self {
        Self {
            canary_fraction: default_canary_fraction(),
            apply_max_retries: default_apply_retries(),
            apply_backoff_ms: default_apply_backoff(),
            backup_dir: default_backup_dir(),
            playbook: default_playbook(),
            inventory: default_inventory(),
        }
    }
}

/// Severity rule inputs: path prefixes consulted by the classifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifyConfig {
    /// Drift here is critical regardless of kind
    #[serde(default = "default_critical_paths")]
    pub critical_paths: Vec<String>,

    /// Core configuration; content drift here is high
    #[serde(default = "default_core_config_paths")]
    pub core_config_paths: Vec<String>,
}

fn default_critical_paths() -> Vec<String> {
    [
        "/etc/passwd",
        "/etc/shadow",
        "/etc/sudoers",
        "/etc/ssh/sshd_config",
        "/etc/cron",
        "/root/",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_core_config_paths() -> Vec<String> {
    [
        "/etc/nginx/",
        "/etc/apache2/",
        "/etc/httpd/",
        "/var/www/",
        "/etc/ansible-managed/",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for ClassifyConfig {
    fn default() -> Self {
        Self {
            critical_paths: default_critical_paths(),
            core_config_paths: default_core_config_paths(),
        }
    }
}

/// Audit sink settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_audit_dir")]
    pub dir: String,

    /// Write retries before the failure is escalated as a critical alert
    #[serde(default = "default_audit_retries")]
    pub max_write_retries: u32,

    #[serde(default = "default_audit_backoff")]
    pub backoff_ms: u64,
}

fn default_audit_dir() -> String {
    "/var/log/driftd".to_string()
}

fn default_audit_retries() -> u32 {
    3
}

fn default_audit_backoff() -> u64 {
    250
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            dir: default_audit_dir(),
            max_write_retries: default_audit_retries(),
            backoff_ms: default_audit_backoff(),
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub remediation: RemediationConfig,
    #[serde(default)]
    pub classify: ClassifyConfig,
    #[serde(default)]
    pub audit: AuditConfig,
}

impl EngineConfig {
    /// Load from a specific path, failing fast on parse or consistency
    /// errors.
    pub fn load_from_path(path: &Path) -> Result<Self, EngineError> {
        let content = fs::read_to_string(path).map_err(|e| {
            EngineError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: EngineConfig = serde_yaml::from_str(&content)
            .map_err(|e| EngineError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if !(self.remediation.canary_fraction > 0.0 && self.remediation.canary_fraction <= 1.0) {
            return Err(EngineError::Config(format!(
                "canary_fraction must be in (0, 1], got {}",
                self.remediation.canary_fraction
            )));
        }
        if self.detection.max_concurrent_nodes == 0 {
            return Err(EngineError::Config(
                "max_concurrent_nodes must be at least 1".into(),
            ));
        }
        if self.transport.op_timeout_secs == 0 {
            return Err(EngineError::Config("op_timeout_secs must be nonzero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.remediation.canary_fraction, 0.25);
        assert_eq!(config.detection.max_concurrent_nodes, 8);
        assert_eq!(config.detection.notify_threshold, Severity::High);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = "remediation:\n  apply_max_retries: 5\n";
        let config: EngineConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.remediation.apply_max_retries, 5);
        assert_eq!(config.remediation.canary_fraction, 0.25);
        assert_eq!(config.transport.ssh_user, "drift");
    }

    #[test]
    fn test_invalid_canary_fraction_rejected() {
        let mut config = EngineConfig::default();
        config.remediation.canary_fraction = 0.0;
        assert!(config.validate().is_err());
        config.remediation.canary_fraction = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let mut config = EngineConfig::default();
        config.detection.max_concurrent_nodes = 0;
        assert!(config.validate().is_err());
    }
}
