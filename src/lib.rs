//! Unkill - Keep protected applications running
//!
//! A fixed-size fleet of watchdog instances that each probe the protected
//! applications, relaunch the ones that died, and revive each other.

pub mod core;
pub mod persistence;
pub mod platform;

/// Application name constant
pub const APP_NAME: &str = "Unkill";

/// Application version
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
