//! Instance snapshots for warm restart.
//!
//! A snapshot is the full serialization of an [`FsmInstance`] minus
//! runtime-only fields (`subscribers`), written to
//! `<data_dir>/<tenant>/fsm/<module-short-name>/<sanitized-fsm-id>.json`.
//!
//! Writers use write-then-rename: the payload lands in a `.tmp` sibling and
//! is renamed over the target, so readers never observe a torn snapshot.
//!
//! Snapshots record intent, not history: the journal remains the
//! authoritative record, and `Registry::reload_from_disk` rehydrates from
//! snapshots without replaying it.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::SnapshotError;
use crate::instance::FsmInstance;
use crate::journal::{sanitize_id, tenant_segment};
use crate::kind::module_short_name;

/// Filesystem store for instance snapshots.
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    /// Create a store rooted at `root` (the shared data directory).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Snapshot path for an instance.
    pub fn path_for(&self, instance: &FsmInstance) -> PathBuf {
        self.root
            .join(tenant_segment(instance.tenant_id.as_deref()))
            .join("fsm")
            .join(module_short_name(&instance.kind_name))
            .join(format!("{}.json", sanitize_id(&instance.id)))
    }

    /// Persist one instance with write-then-rename.
    pub fn save(&self, instance: &FsmInstance) -> Result<(), SnapshotError> {
        let path = self.path_for(instance);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| SnapshotError::WriteFailed {
                reason: e.to_string(),
            })?;
        }
        let json =
            serde_json::to_vec_pretty(instance).map_err(|e| SnapshotError::WriteFailed {
                reason: e.to_string(),
            })?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|e| SnapshotError::WriteFailed {
            reason: e.to_string(),
        })?;
        fs::rename(&tmp, &path).map_err(|e| SnapshotError::WriteFailed {
            reason: e.to_string(),
        })
    }

    /// Remove an instance's snapshot. Missing snapshots are not an error.
    pub fn remove(&self, instance: &FsmInstance) -> Result<(), SnapshotError> {
        let path = self.path_for(instance);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SnapshotError::WriteFailed {
                reason: e.to_string(),
            }),
        }
    }

    /// Load every snapshot under the data directory.
    ///
    /// Malformed files are logged and skipped; a missing data directory
    /// yields an empty list.
    pub fn load_all(&self) -> Result<Vec<FsmInstance>, SnapshotError> {
        let mut instances = Vec::new();
        let tenants = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(_) => return Ok(instances),
        };
        for tenant in tenants.flatten() {
            let fsm_dir = tenant.path().join("fsm");
            let modules = match fs::read_dir(&fsm_dir) {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            for module in modules.flatten() {
                let files = match fs::read_dir(module.path()) {
                    Ok(entries) => entries,
                    Err(_) => continue,
                };
                for file in files.flatten() {
                    let path = file.path();
                    if path.extension().is_some_and(|ext| ext == "json") {
                        match self.load_file(&path) {
                            Ok(instance) => instances.push(instance),
                            Err(e) => {
                                warn!(path = %path.display(), error = %e, "skipping malformed snapshot");
                            }
                        }
                    }
                }
            }
        }
        Ok(instances)
    }

    fn load_file(&self, path: &Path) -> Result<FsmInstance, SnapshotError> {
        let content = fs::read_to_string(path).map_err(|e| SnapshotError::ReadFailed {
            reason: e.to_string(),
        })?;
        serde_json::from_str(&content).map_err(|e| SnapshotError::ReadFailed {
            reason: e.to_string(),
        })
    }
}
