//! Core module - Watchdog instances, liveness, restarts, and fleet coordination

mod clock;
mod coordinator;
mod error;
mod event;
mod instance;
mod monitor;
pub mod peers;
pub mod probe;
pub mod restart;
pub mod settings;
mod target;
mod watchdog;

#[cfg(test)]
pub(crate) mod mock;

pub use clock::{Clock, ManualClock, SystemClock};
pub use coordinator::{Coordinator, StatusTable};
pub use error::{ControlError, WatchdogError};
pub use event::{push_bounded, EventLogEntry, DEFAULT_EVENT_LOG_CAPACITY};
pub use instance::{InstanceId, InstanceState, InstanceStatus};
pub use monitor::{ProcessSighting, SharedProcessTable};
pub use peers::{EntryPointDirectory, PeerDescriptor, PeerDirectory};
pub use probe::{DetectionMethod, Liveness, LivenessProbe, ProbeVerdict};
pub use restart::{LaunchStrategy, RestartAttemptResult, RestartChain};
pub use settings::{Settings, DEFAULT_FLEET_SIZE};
pub use target::{ProtectionSet, TargetId};
pub use watchdog::{MonitorInstance, MonitorState, TickReport, WatchdogContext};
