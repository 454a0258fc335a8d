//! Desired-state manifest: the declared correct configuration per role.
//!
//! Manifests are YAML, loaded read-only at cycle start and immutable during
//! the cycle. A malformed manifest fails fast before any node is touched.

use crate::error::EngineError;
use crate::hash::is_sha256_hex;
use crate::types::ServiceState;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Expected state of one managed file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileExpectation {
    pub sha256: String,
    /// Whitespace-normalized hash, when the role cares about semantic-only
    /// differences.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normalized_sha256: Option<String>,
}

/// Expected configuration for one node role.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleManifest {
    #[serde(default)]
    pub files: BTreeMap<String, FileExpectation>,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceState>,
    /// Directories in which unexpected files count as drift.
    #[serde(default)]
    pub managed_dirs: Vec<String>,
}

/// The whole fleet's desired state: roles plus a node-to-role assignment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetManifest {
    pub roles: BTreeMap<String, RoleManifest>,
    /// node name -> role name
    pub nodes: BTreeMap<String, String>,
}

impl FleetManifest {
    pub fn parse(yaml: &str) -> Result<Self, EngineError> {
        let manifest: FleetManifest = serde_yaml::from_str(yaml)
            .map_err(|e| EngineError::Config(format!("manifest parse failed: {}", e)))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Structural validation, run at load time.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.nodes.is_empty() {
            return Err(EngineError::Config("manifest lists no nodes".into()));
        }
        for (node, role) in &self.nodes {
            if !self.roles.contains_key(role) {
                return Err(EngineError::Config(format!(
                    "node {} references unknown role {}",
                    node, role
                )));
            }
        }
        for (role_name, role) in &self.roles {
            for (path, file) in &role.files {
                if !path.starts_with('/') {
                    return Err(EngineError::Config(format!(
                        "role {}: path {} is not absolute",
                        role_name, path
                    )));
                }
                if !is_sha256_hex(&file.sha256) {
                    return Err(EngineError::Config(format!(
                        "role {}: {} has malformed sha256",
                        role_name, path
                    )));
                }
                if let Some(normalized) = &file.normalized_sha256 {
                    if !is_sha256_hex(normalized) {
                        return Err(EngineError::Config(format!(
                            "role {}: {} has malformed normalized_sha256",
                            role_name, path
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn role_for(&self, node: &str) -> Option<&RoleManifest> {
        self.nodes.get(node).and_then(|role| self.roles.get(role))
    }

    /// All managed nodes, sorted.
    pub fn node_names(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }
}
