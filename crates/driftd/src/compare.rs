//! Drift comparator - diffs observed against desired state.
//!
//! Produces one itemized mismatch per deviation and never assigns severity;
//! that is the classifier's job. Output order is deterministic (sorted maps,
//! fixed section order) so repeated runs over unchanged state yield an
//! identical multiset.

use drift_common::types::{CollectionStatus, DriftCategory, Mismatch, ObservedState};
use drift_common::RoleManifest;

pub fn compare(observed: &ObservedState, manifest: &RoleManifest) -> Vec<Mismatch> {
    // Unreachable snapshots are excluded from comparison for the cycle.
    if observed.status == CollectionStatus::Unreachable {
        return Vec::new();
    }

    let mut mismatches = Vec::new();

    for (path, expectation) in &manifest.files {
        if let Some(observation) = observed.files.get(path) {
            if observation.sha256 != expectation.sha256 {
                let whitespace_only = expectation
                    .normalized_sha256
                    .as_deref()
                    .map(|n| n == observation.normalized_sha256)
                    .unwrap_or(false);
                mismatches.push(Mismatch {
                    node: observed.node.clone(),
                    item: path.clone(),
                    category: DriftCategory::FileContent,
                    expected: expectation.sha256.clone(),
                    observed: observation.sha256.clone(),
                    whitespace_only,
                });
            }
        } else if observed.missing.contains(path) {
            mismatches.push(Mismatch {
                node: observed.node.clone(),
                item: path.clone(),
                category: DriftCategory::FileMissing,
                expected: expectation.sha256.clone(),
                observed: "absent".to_string(),
                whitespace_only: false,
            });
        }
    }

    for path in &observed.extra_files {
        mismatches.push(Mismatch {
            node: observed.node.clone(),
            item: path.clone(),
            category: DriftCategory::FileAdded,
            expected: "absent".to_string(),
            observed: "present".to_string(),
            whitespace_only: false,
        });
    }

    for (service, expected) in &manifest.services {
        if let Some(observed_state) = observed.services.get(service) {
            if observed_state != expected {
                mismatches.push(Mismatch {
                    node: observed.node.clone(),
                    item: service.clone(),
                    category: DriftCategory::ServiceState,
                    expected: expected.to_string(),
                    observed: observed_state.to_string(),
                    whitespace_only: false,
                });
            }
        }
    }

    mismatches
}
