//! Watchdog settings management

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::event::DEFAULT_EVENT_LOG_CAPACITY;

/// Number of watchdog instances in the fleet
pub const DEFAULT_FLEET_SIZE: u32 = 5;

/// Smallest event log the shared history is allowed to shrink to
pub const MIN_EVENT_LOG_CAPACITY: usize = 20;

/// Watchdog settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    // Fleet
    /// Number of watchdog instances
    pub fleet_size: u32,
    /// Seconds between two ticks of one instance
    pub tick_interval_secs: u32,
    /// Upper bound on any single probe, launch, store or peer call (ms)
    pub call_timeout_ms: u32,
    /// How long to wait for a cancelled instance before aborting it (ms)
    pub shutdown_grace_ms: u32,

    // Detection
    /// A target seen alive within this window counts as alive
    pub activity_window_secs: u32,

    // Diagnostics
    /// Number of entries kept in the shared event log
    pub event_log_capacity: usize,
    /// Enable debug logging
    pub debug_logging: bool,

    // Advanced
    /// Custom data directory
    pub data_directory: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            // Fleet
            fleet_size: DEFAULT_FLEET_SIZE,
            tick_interval_secs: 10,
            call_timeout_ms: 5000,
            shutdown_grace_ms: 2000,

            // Detection
            activity_window_secs: 60,

            // Diagnostics
            event_log_capacity: DEFAULT_EVENT_LOG_CAPACITY,
            debug_logging: false,

            // Advanced
            data_directory: None,
        }
    }
}

impl Settings {
    /// Get the data directory, using default if not set
    pub fn get_data_directory(&self) -> PathBuf {
        self.data_directory.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("Unkill")
        })
    }

    /// Get the shared database path
    pub fn get_database_path(&self) -> PathBuf {
        self.get_data_directory().join("unkill.db")
    }

    /// Validate settings and fix any invalid values
    pub fn validate(&mut self) {
        self.fleet_size = self.fleet_size.clamp(1, 32);
        self.tick_interval_secs = self.tick_interval_secs.clamp(1, 3600);
        self.call_timeout_ms = self.call_timeout_ms.clamp(100, 60_000);
        self.shutdown_grace_ms = self.shutdown_grace_ms.clamp(100, 60_000);
        self.activity_window_secs = self.activity_window_secs.max(1);
        self.event_log_capacity = self
            .event_log_capacity
            .clamp(MIN_EVENT_LOG_CAPACITY, DEFAULT_EVENT_LOG_CAPACITY);
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs as u64)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms as u64)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms as u64)
    }

    pub fn activity_window(&self) -> Duration {
        Duration::from_secs(self.activity_window_secs as u64)
    }
}
