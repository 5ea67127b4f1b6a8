// packages/proxy/src/modules/updater.rs
//! Module discovery producing the update snapshot
//!
//! Layout of the module directory:
//!
//! ```text
//! mods/
//! ├─ protocol_data.json      optional, handed to the protocol engine
//! ├─ command/module.json     updated (has metadata)
//! ├─ old-mod/                legacy (no metadata)
//! └─ _disabled-stuff/        ignored
//! ```

use crate::modules::descriptor::{ModuleDescriptor, ModuleOptions, UpdateSnapshot};
use crate::utils::errors::{ProxyError, Result};
use futures::future::BoxFuture;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::fs;
use tracing::{debug, info, warn};

const MANIFEST_FILE: &str = "module.json";
const PROTOCOL_DATA_FILE: &str = "protocol_data.json";

/// Produces the update snapshot once per process
pub trait ModuleUpdater: Send + Sync {
    fn update(&self) -> BoxFuture<'_, Result<UpdateSnapshot>>;
}

/// Contents of `module.json`
#[derive(Debug, Deserialize)]
struct ModuleManifest {
    #[serde(default)]
    disabled: bool,

    #[serde(default)]
    options: ModuleOptions,
}

/// Where a module ended up after scanning
#[derive(Debug, PartialEq)]
enum ScanOutcome {
    Updated(ModuleDescriptor),
    Legacy(ModuleDescriptor),
    Failed(ModuleDescriptor, String),
    Disabled,
}

/// Scans a local module directory
pub struct LocalModuleScanner {
    module_dir: PathBuf,
    update_log: bool,
}

impl LocalModuleScanner {
    pub fn new(module_dir: impl Into<PathBuf>, update_log: bool) -> Self {
        Self {
            module_dir: module_dir.into(),
            update_log,
        }
    }

    /// Module directory names in registration order
    async fn module_names(&self) -> Result<Vec<String>> {
        let mut entries = fs::read_dir(&self.module_dir).await.map_err(|e| {
            ProxyError::UpdateFailed(format!(
                "Unable to read module directory {}: {}",
                self.module_dir.display(),
                e
            ))
        })?;

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || name.starts_with('_') {
                continue;
            }
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            names.push(name);
        }

        // read_dir order is platform dependent
        names.sort();
        Ok(names)
    }

    async fn scan_module(&self, name: &str) -> ScanOutcome {
        let root = self.module_dir.join(name);
        let manifest_path = root.join(MANIFEST_FILE);

        let mut descriptor = ModuleDescriptor::new(name);
        descriptor.options.root_folder = Some(root.clone());

        let text = match fs::read_to_string(&manifest_path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return ScanOutcome::Legacy(descriptor),
            Err(e) => return ScanOutcome::Failed(descriptor, e.to_string()),
        };

        match serde_json::from_str::<ModuleManifest>(&text) {
            Ok(manifest) if manifest.disabled => ScanOutcome::Disabled,
            Ok(manifest) => {
                descriptor.options = manifest.options;
                descriptor.options.root_folder = Some(root);
                ScanOutcome::Updated(descriptor)
            }
            Err(e) => ScanOutcome::Failed(descriptor, e.to_string()),
        }
    }

    async fn protocol_data(&self) -> HashMap<String, serde_json::Value> {
        let path = self.module_dir.join(PROTOCOL_DATA_FILE);
        match fs::read_to_string(&path).await {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(data) => data,
                Err(e) => {
                    warn!("WARNING: Ignoring malformed {}: {}", path.display(), e);
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        }
    }

    /// Scan the module directory
    pub async fn scan(&self) -> Result<UpdateSnapshot> {
        let mut snapshot = UpdateSnapshot {
            protocol_data: self.protocol_data().await,
            ..Default::default()
        };

        for name in self.module_names().await? {
            match self.scan_module(&name).await {
                ScanOutcome::Updated(descriptor) => {
                    self.log_module(&descriptor.name, "ready");
                    snapshot.updated.push(descriptor);
                }
                ScanOutcome::Legacy(descriptor) => {
                    self.log_module(&descriptor.name, "has no module.json");
                    snapshot.legacy.push(descriptor);
                }
                ScanOutcome::Failed(descriptor, reason) => {
                    warn!("Module {} failed to update: {}", descriptor.name, reason);
                    snapshot.failed.push(descriptor);
                }
                ScanOutcome::Disabled => self.log_module(&name, "disabled"),
            }
        }

        info!(
            "Module scan complete: {} updated, {} legacy, {} failed",
            snapshot.updated.len(),
            snapshot.legacy.len(),
            snapshot.failed.len()
        );

        Ok(snapshot)
    }

    fn log_module(&self, name: &str, status: &str) {
        if self.update_log {
            info!("[update] {}: {}", name, status);
        } else {
            debug!("[update] {}: {}", name, status);
        }
    }
}

impl ModuleUpdater for LocalModuleScanner {
    fn update(&self) -> BoxFuture<'_, Result<UpdateSnapshot>> {
        Box::pin(self.scan())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::descriptor::LoadPhase;
    use std::path::Path;

    fn write(dir: &Path, rel: &str, content: &str) {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[tokio::test]
    async fn test_scan_classifies_modules() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "command/module.json", r#"{"options": {"loadOn": "connect"}}"#);
        write(dir.path(), "game-state/module.json", "{}");
        write(dir.path(), "old-mod/index.js", "");
        write(dir.path(), "broken/module.json", "{ not json");
        write(dir.path(), "off/module.json", r#"{"disabled": true}"#);
        write(dir.path(), "_hidden/module.json", "{}");
        write(dir.path(), ".git/config", "");
        write(dir.path(), "loose-file.js", "");
        write(dir.path(), "protocol_data.json", r#"{"version": 376012}"#);

        let scanner = LocalModuleScanner::new(dir.path(), true);
        let snapshot = scanner.update().await.unwrap();

        let updated: Vec<&str> = snapshot.updated.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(updated, vec!["command", "game-state"]);
        assert_eq!(snapshot.updated[0].phase(), LoadPhase::Connect);
        assert_eq!(snapshot.updated[1].phase(), LoadPhase::VersionCheck);
        assert_eq!(
            snapshot.updated[0].options.root_folder.as_deref(),
            Some(dir.path().join("command").as_path())
        );

        assert_eq!(snapshot.legacy.len(), 1);
        assert_eq!(snapshot.legacy[0].name, "old-mod");
        assert_eq!(snapshot.failed.len(), 1);
        assert_eq!(snapshot.failed[0].name, "broken");
        assert_eq!(snapshot.protocol_data["version"], 376012);
    }

    #[tokio::test]
    async fn test_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let scanner = LocalModuleScanner::new(dir.path().join("nope"), false);
        let err = scanner.scan().await.unwrap_err();
        assert!(matches!(err, ProxyError::UpdateFailed(_)));
    }
}
