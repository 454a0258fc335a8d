//! Desired-state registry - read-only manifest lookup per node.

use drift_common::{EngineError, FleetManifest, RoleManifest};
use std::path::Path;
use tracing::info;

/// Loaded once per cycle; immutable during it.
#[derive(Debug)]
pub struct ManifestRegistry {
    manifest: FleetManifest,
}

impl ManifestRegistry {
    pub async fn load(path: &Path) -> Result<Self, EngineError> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            EngineError::Config(format!("cannot read manifest {}: {}", path.display(), e))
        })?;
        let manifest = FleetManifest::parse(&content)?;
        info!(
            "Loaded manifest from {}: {} roles, {} nodes",
            path.display(),
            manifest.roles.len(),
            manifest.nodes.len()
        );
        Ok(Self { manifest })
    }

    pub fn from_manifest(manifest: FleetManifest) -> Result<Self, EngineError> {
        manifest.validate()?;
        Ok(Self { manifest })
    }

    pub fn manifest_for(&self, node: &str) -> Option<&RoleManifest> {
        self.manifest.role_for(node)
    }

    /// All managed nodes, sorted.
    pub fn nodes(&self) -> Vec<String> {
        self.manifest.node_names()
    }
}
