// packages/proxy/src/modules/descriptor.rs
//! Module descriptors and the update snapshot
//!
//! The snapshot is produced once by the module updater before any listener
//! is bound, then shared read-only by every session.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Lifecycle point at which a module is activated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadPhase {
    /// Once per process, before listeners bind
    Startup,

    /// Per session, once the upstream handshake completed
    #[default]
    VersionCheck,

    /// Per session, as soon as the session is created
    Connect,
}

/// Options attached to a module descriptor
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleOptions {
    /// Activation phase; untagged modules load on `versioncheck`
    #[serde(default, rename = "loadOn", alias = "load_on", skip_serializing_if = "Option::is_none")]
    pub load_on: Option<LoadPhase>,

    /// Module installation directory
    #[serde(default, rename = "rootFolder", alias = "root_folder", skip_serializing_if = "Option::is_none")]
    pub root_folder: Option<PathBuf>,

    /// Everything else from the manifest
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ModuleOptions {
    pub fn phase(&self) -> LoadPhase {
        self.load_on.unwrap_or_default()
    }
}

/// One installed module
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    pub name: String,

    #[serde(default)]
    pub options: ModuleOptions,
}

impl ModuleDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            options: ModuleOptions::default(),
        }
    }

    pub fn with_phase(mut self, phase: LoadPhase) -> Self {
        self.options.load_on = Some(phase);
        self
    }

    pub fn phase(&self) -> LoadPhase {
        self.options.phase()
    }
}

/// Immutable result of the one-time update pass
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateSnapshot {
    /// Modules with update metadata, in registration order
    pub updated: Vec<ModuleDescriptor>,

    /// Modules without update metadata
    pub legacy: Vec<ModuleDescriptor>,

    /// Modules whose update failed; never activated
    pub failed: Vec<ModuleDescriptor>,

    /// Protocol definitions handed to the protocol engine
    pub protocol_data: HashMap<String, serde_json::Value>,
}

impl UpdateSnapshot {
    /// Descriptors activated once at process startup
    pub fn startup_modules(&self) -> Vec<&ModuleDescriptor> {
        self.updated
            .iter()
            .filter(|m| m.phase() == LoadPhase::Startup)
            .collect()
    }

    /// Descriptors activated when a session is created
    pub fn connect_modules(&self) -> Vec<&ModuleDescriptor> {
        self.updated
            .iter()
            .filter(|m| m.phase() == LoadPhase::Connect)
            .collect()
    }

    /// Descriptors activated on handshake completion: legacy first, then
    /// updated modules tagged (or defaulting to) `versioncheck`
    pub fn versioncheck_modules(&self) -> Vec<&ModuleDescriptor> {
        self.legacy
            .iter()
            .chain(
                self.updated
                    .iter()
                    .filter(|m| m.phase() == LoadPhase::VersionCheck),
            )
            .collect()
    }
}
