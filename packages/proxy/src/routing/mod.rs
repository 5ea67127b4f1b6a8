// packages/proxy/src/routing/mod.rs
//! Connection routing
//!
//! - **Region**: immutable region profiles and resolved targets
//! - **Directory**: logical server id → live upstream target
//! - **Listener**: one local listener per resolvable logical id

pub mod directory;
pub mod listener;
pub mod region;

pub use directory::{DirectoryClient, DirectoryResolver, HttpDirectoryClient, ServerList};
pub use listener::{plan_listeners, provision, provision_all, ListenerHandle, ListenerPlan};
pub use region::{region_short_code, RegionProfile, ServerSpec, ServerTarget, TargetMap};
