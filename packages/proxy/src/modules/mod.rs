// packages/proxy/src/modules/mod.rs
//! Plugin modules
//!
//! - **Descriptor**: module metadata and the immutable update snapshot
//! - **Updater**: module directory scan producing the snapshot
//! - **Loader**: phase-ordered activation and per-session namespaces
//! - **Builtin**: the bootstrap modules every session starts with

pub mod builtin;
pub mod descriptor;
pub mod loader;
pub mod updater;

// Re-export commonly used types
pub use builtin::builtin_catalog;
pub use descriptor::{LoadPhase, ModuleDescriptor, ModuleOptions, UpdateSnapshot};
pub use loader::{
    ActivationPass, ModuleCatalog, ModuleContext, ModuleFactory, ModuleLoader, ModuleNamespace,
    ProxyModule, SessionNotice,
};
pub use updater::{LocalModuleScanner, ModuleUpdater};
