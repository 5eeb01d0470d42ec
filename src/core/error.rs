//! Error types for the watchdog mesh and its control surface

use thiserror::Error;

use super::instance::InstanceId;
use super::target::TargetId;

/// Failures inside a watchdog tick. None of these are fatal to the loop.
#[derive(Error, Debug)]
pub enum WatchdogError {
    /// A liveness detection method could not produce an answer
    #[error("probe '{method}' failed for {target}: {reason}")]
    Probe {
        method: &'static str,
        target: TargetId,
        reason: String,
    },

    /// One launch strategy failed; the chain moves on to the next one
    #[error("launch strategy '{strategy}' failed for {target}: {reason}")]
    Restart {
        strategy: &'static str,
        target: TargetId,
        reason: String,
    },

    /// Every launch strategy failed; the next tick retries
    #[error("all {attempts} launch strategies failed for {target}")]
    RestartExhausted { target: TargetId, attempts: usize },

    /// The protection set could not be read
    #[error("protection config unavailable: {0}")]
    ConfigRead(String),

    /// A peer instance could not be checked or revived
    #[error("peer {peer} unreachable: {reason}")]
    PeerUnreachable { peer: InstanceId, reason: String },
}

/// Failures of coordinator control operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    /// The id is outside the configured fleet
    #[error("invalid instance id {id}: fleet has instances 1..={fleet_size}")]
    InvalidInstance { id: u32, fleet_size: u32 },
}
