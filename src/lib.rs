//! # 802.11 Node Manager
//!
//! This crate implements the node-management core of an 802.11 stack:
//! discovery of neighboring networks, the authoritative table of known
//! peer/AP nodes, the scan state machine, BSS candidate selection and the
//! kickoff of RSN/WPA security parameter negotiation.
//!
//! ## Architecture
//!
//! The implementation is organized into several modules:
//! - `config`: operating role, desired network pins and RSN policy
//! - `node`: per-peer data model and lifecycle states
//! - `table`: the bounded, reference-counted node table with eviction
//! - `scan`: channel-set iteration state machine (active/passive)
//! - `bss`: candidate filtering and best-candidate selection
//! - `rsn`: RSN/WPA parameter negotiation and RSN element parsing
//! - `ibss`: ad-hoc network convergence (merge) logic
//! - `driver`: collaborator interfaces (PHY, frame TX, keys, timers)
//! - `context`: the single-writer context owning all mutable state
//! - `daemon`: high-level daemon functionality
//!
//! All mutation runs under one exclusive section: callers wrap the
//! [`context::WifiContext`] in a single mutex and hold it for the duration
//! of each operation, including completion callbacks re-entering from
//! collaborators. Nothing in the core blocks while that section is held.

pub mod bss;
pub mod config;
pub mod context;
pub mod driver;
pub mod ibss;
pub mod node;
pub mod rsn;
pub mod scan;
pub mod table;

// Daemon modules
pub mod daemon;

// Re-export commonly used types
pub use crate::{
    bss::MatchFail,
    config::{WifiConfig, WifiRole},
    context::{WifiContext, WifiEvent, WifiStats},
    node::{NodeState, WifiNode},
    scan::{ScanLock, ScanState},
    table::NodeId,
};

// Error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WifiError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Node table full")]
    TableFull,

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Driver error: {0}")]
    Driver(#[from] crate::driver::DriverError),

    #[error("Event error: {0}")]
    Event(String),

    #[error("System error: {0}")]
    System(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}

pub type Result<T> = std::result::Result<T, WifiError>;

/// MAC address of a station, AP or BSSID.
pub type MacAddr = [u8; 6];

// Constants
pub const ADDR_LEN: usize = 6;
pub const BROADCAST_ADDR: MacAddr = [0xff; 6];
pub const MAX_SSID_LEN: usize = 32;
pub const NONCE_LEN: usize = 32;
pub const PMK_LEN: usize = 32;
pub const PMKID_LEN: usize = 16;
/// Association identifiers run 1..=2007 per the standard.
pub const MAX_AID: u16 = 2007;

/// Format a MAC address as the usual colon-separated hex string.
pub fn addr_string(addr: &MacAddr) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        addr[0], addr[1], addr[2], addr[3], addr[4], addr[5]
    )
}

// Utility functions
pub fn init_logging() {
    env_logger::init();
}
