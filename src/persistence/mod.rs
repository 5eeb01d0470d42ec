//! Persistence - Shared stores read and written by every watchdog instance
//!
//! Each store is a repository trait so the mesh can run against the SQLite
//! database shared between processes or against an in-process store.
//! Cross-process reads are only eventually consistent.

mod database;
mod memory;

pub use database::Database;
pub use memory::MemoryStore;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::{EventLogEntry, InstanceId, InstanceStatus, ProtectionSet, TargetId};

/// Durable set of protected targets
pub trait ProtectionStore: Send + Sync {
    /// Current protection set, possibly empty
    fn get(&self) -> Result<ProtectionSet>;

    /// Replace the whole protection set
    fn replace_protection_set(&self, set: &ProtectionSet) -> Result<()>;
}

/// Bounded, shared, append-only diagnostic log
pub trait EventLog: Send + Sync {
    /// Append an entry and trim to capacity in the same operation
    fn append(&self, source: InstanceId, message: &str) -> Result<()>;

    /// Current entries, oldest first
    fn read(&self) -> Result<Vec<EventLogEntry>>;

    /// Most recent entries, oldest first
    fn tail(&self) -> Result<Vec<EventLogEntry>> {
        self.read()
    }
}

/// Last time a target was observed alive, and how it was running
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub last_seen: DateTime<Utc>,
    pub executable: Option<PathBuf>,
    pub arguments: Vec<String>,
}

/// Sightings of protected targets
pub trait ActivityStore: Send + Sync {
    fn record_sighting(&self, target: &TargetId, record: &ActivityRecord) -> Result<()>;

    fn last_sighting(&self, target: &TargetId) -> Result<Option<ActivityRecord>>;
}

/// Durable copy of the coordinator's status table for other processes
pub trait StatusMirror: Send + Sync {
    fn save_status(&self, status: &InstanceStatus) -> Result<()>;

    fn load_statuses(&self) -> Result<Vec<InstanceStatus>>;
}

/// Run a synchronous store call on the blocking pool, bounded by `timeout`
pub async fn run_blocking<T, F>(timeout: Duration, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::time::timeout(timeout, tokio::task::spawn_blocking(f)).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => Err(anyhow::anyhow!("Blocking task failed: {}", e)),
        Err(_) => anyhow::bail!("Timed out after {:?}", timeout),
    }
}

/// Append to the event log without ever blocking the caller past `timeout`
pub async fn append_event(
    log: &Arc<dyn EventLog>,
    source: InstanceId,
    message: String,
    timeout: Duration,
) {
    let log = Arc::clone(log);
    if let Err(e) = run_blocking(timeout, move || log.append(source, &message)).await {
        warn!("Failed to append to event log: {}", e);
    }
}
