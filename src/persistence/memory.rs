//! In-process store for embedding callers and tests

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use anyhow::Result;
use chrono::Utc;

use super::{ActivityRecord, ActivityStore, EventLog, ProtectionStore, StatusMirror};
use crate::core::{
    push_bounded, EventLogEntry, InstanceId, InstanceStatus, ProtectionSet, TargetId,
    DEFAULT_EVENT_LOG_CAPACITY,
};

/// All shared stores kept in memory
pub struct MemoryStore {
    protected: RwLock<ProtectionSet>,
    events: RwLock<Vec<EventLogEntry>>,
    event_capacity: usize,
    activity: RwLock<HashMap<TargetId, ActivityRecord>>,
    statuses: RwLock<BTreeMap<InstanceId, InstanceStatus>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_event_capacity(DEFAULT_EVENT_LOG_CAPACITY)
    }

    pub fn with_event_capacity(event_capacity: usize) -> Self {
        Self {
            protected: RwLock::new(ProtectionSet::new()),
            events: RwLock::new(Vec::new()),
            event_capacity: event_capacity.max(1),
            activity: RwLock::new(HashMap::new()),
            statuses: RwLock::new(BTreeMap::new()),
        }
    }

    /// Seed the protection set
    pub fn with_targets<I, T>(self, targets: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TargetId>,
    {
        if let Ok(mut protected) = self.protected.write() {
            protected.extend(targets.into_iter().map(Into::into));
        }
        self
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtectionStore for MemoryStore {
    fn get(&self) -> Result<ProtectionSet> {
        self.protected
            .read()
            .map(|set| set.clone())
            .map_err(|e| anyhow::anyhow!("Protection set lock poisoned: {}", e))
    }

    fn replace_protection_set(&self, set: &ProtectionSet) -> Result<()> {
        *self
            .protected
            .write()
            .map_err(|e| anyhow::anyhow!("Protection set lock poisoned: {}", e))? = set.clone();
        Ok(())
    }
}

impl EventLog for MemoryStore {
    fn append(&self, source: InstanceId, message: &str) -> Result<()> {
        let mut events = self
            .events
            .write()
            .map_err(|e| anyhow::anyhow!("Event log lock poisoned: {}", e))?;
        let entry = EventLogEntry::new(Utc::now(), source, message);
        push_bounded(&mut events, entry, self.event_capacity);
        Ok(())
    }

    fn read(&self) -> Result<Vec<EventLogEntry>> {
        self.events
            .read()
            .map(|events| events.clone())
            .map_err(|e| anyhow::anyhow!("Event log lock poisoned: {}", e))
    }
}

impl ActivityStore for MemoryStore {
    fn record_sighting(&self, target: &TargetId, record: &ActivityRecord) -> Result<()> {
        self.activity
            .write()
            .map_err(|e| anyhow::anyhow!("Activity lock poisoned: {}", e))?
            .insert(target.clone(), record.clone());
        Ok(())
    }

    fn last_sighting(&self, target: &TargetId) -> Result<Option<ActivityRecord>> {
        self.activity
            .read()
            .map(|activity| activity.get(target).cloned())
            .map_err(|e| anyhow::anyhow!("Activity lock poisoned: {}", e))
    }
}

impl StatusMirror for MemoryStore {
    fn save_status(&self, status: &InstanceStatus) -> Result<()> {
        self.statuses
            .write()
            .map_err(|e| anyhow::anyhow!("Status lock poisoned: {}", e))?
            .insert(status.instance_id, status.clone());
        Ok(())
    }

    fn load_statuses(&self) -> Result<Vec<InstanceStatus>> {
        self.statuses
            .read()
            .map(|statuses| statuses.values().cloned().collect())
            .map_err(|e| anyhow::anyhow!("Status lock poisoned: {}", e))
    }
}
