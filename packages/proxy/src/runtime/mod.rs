// packages/proxy/src/runtime/mod.rs
//! Game client process tracking
//!
//! - **Process Monitor**: polls the process table and reports presence
//!   changes of the game client executable

pub mod process_monitor;

pub use process_monitor::{presence_changes, ProcessMonitor, ProcessPresence, ProcessProbe, SysinfoProbe};
