//! Daemon wrapper
//!
//! Hosts the node manager inside an async process: configuration file
//! handling, the run loops pacing scan and ageing, and event fanout to
//! registered handlers.

pub mod config;
pub mod core;

pub use config::{DaemonConfig, GeneralConfig, LoggingConfig};
pub use core::{DaemonState, WifiDaemon, WifiEventHandler};
