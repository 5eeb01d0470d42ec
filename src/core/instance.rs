//! Watchdog instance status - Uptime bookkeeping for one member of the fleet

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Memory estimate seeded into a fresh run so it never reports zero
const MIN_MEMORY_ESTIMATE: u64 = 1024;

/// Identifier of a watchdog instance, 1..=fleet size
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub u32);

impl InstanceId {
    pub fn get(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a watchdog instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceState {
    /// Monitoring loop is active
    Running,
    /// Monitoring loop is not active
    Stopped,
    /// Relaunch requested by an external collaborator
    Restarting,
    /// Known but never asked to do anything
    Idle,
}

impl InstanceState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Running => "Running",
            Self::Stopped => "Stopped",
            Self::Restarting => "Restarting",
            Self::Idle => "Idle",
        }
    }
}

/// Status record of one watchdog instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub instance_id: InstanceId,
    pub state: InstanceState,
    /// When the current (or last) run started
    pub start_time: DateTime<Utc>,
    /// Approximate memory attributed to this instance, in bytes
    pub memory_estimate: u64,
    pub monitoring_active: bool,
    pub protected_count: usize,
    /// Running time folded in from all finished runs
    pub accumulated_uptime: Duration,
}

impl InstanceStatus {
    pub fn new(instance_id: InstanceId, now: DateTime<Utc>) -> Self {
        Self {
            instance_id,
            state: InstanceState::Stopped,
            start_time: now,
            memory_estimate: 0,
            monitoring_active: false,
            protected_count: 0,
            accumulated_uptime: Duration::ZERO,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == InstanceState::Running
    }

    /// Time spent in the current run, zero unless running
    pub fn current_uptime(&self, now: DateTime<Utc>) -> Duration {
        if self.is_running() {
            (now - self.start_time).to_std().unwrap_or_default()
        } else {
            Duration::ZERO
        }
    }

    /// Accumulated plus current uptime
    pub fn total_uptime(&self, now: DateTime<Utc>) -> Duration {
        self.accumulated_uptime + self.current_uptime(now)
    }

    /// Begin a new run.
    ///
    /// A record that is still marked running (its previous run was never
    /// stopped) has that run folded in first so its uptime is not lost.
    pub fn mark_running(&mut self, now: DateTime<Utc>, protected_count: usize) {
        self.fold_current_run(now);
        self.state = InstanceState::Running;
        self.start_time = now;
        self.memory_estimate = self.memory_estimate.max(MIN_MEMORY_ESTIMATE);
        self.monitoring_active = true;
        self.protected_count = protected_count;
    }

    /// End the current run, folding its elapsed time into the accumulated uptime
    pub fn mark_stopped(&mut self, now: DateTime<Utc>) {
        self.fold_current_run(now);
        self.state = InstanceState::Stopped;
        self.monitoring_active = false;
    }

    /// Refresh the per-tick fields of a running instance
    pub fn record_tick(&mut self, memory_estimate: u64, protected_count: Option<usize>) {
        self.memory_estimate = memory_estimate.max(MIN_MEMORY_ESTIMATE);
        self.monitoring_active = true;
        if let Some(count) = protected_count {
            self.protected_count = count;
        }
    }

    fn fold_current_run(&mut self, now: DateTime<Utc>) {
        if self.is_running() {
            self.accumulated_uptime += self.current_uptime(now);
        }
    }
}
