// packages/proxy/src/utils/mod.rs
//! Configuration loading and shared error types

pub mod config;
pub mod errors;

pub use config::{ProxyConfig, RegionContext};
pub use errors::{ProxyError, Result};
