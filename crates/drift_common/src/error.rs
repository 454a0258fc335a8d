//! Error types for the drift engine.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("node {node} unreachable: {reason}")]
    Unreachable { node: String, reason: String },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("apply failed: {0}")]
    Apply(String),

    #[error("backup failed: {0}")]
    Backup(String),

    #[error("rollback failed: {0}")]
    Rollback(String),

    #[error("audit write failed: {0}")]
    AuditWrite(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl EngineError {
    /// True for failures that abort the whole cycle rather than one node.
    pub fn is_stop_the_world(&self) -> bool {
        matches!(self, EngineError::Config(_) | EngineError::Rollback(_))
    }
}
