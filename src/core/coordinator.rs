//! Coordinator - Owns the fleet's status table and controls its instances

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::clock::Clock;
use super::error::ControlError;
use super::instance::{InstanceId, InstanceStatus};
use super::settings::Settings;
use super::watchdog::{MonitorInstance, WatchdogContext};
use crate::persistence::StatusMirror;

/// Authoritative status records of the fleet.
///
/// Cloning shares the same table. Readers only ever get copies.
#[derive(Clone)]
pub struct StatusTable {
    inner: Arc<RwLock<BTreeMap<InstanceId, InstanceStatus>>>,
    clock: Arc<dyn Clock>,
    mirror: Option<Arc<dyn StatusMirror>>,
    call_timeout: Duration,
}

impl StatusTable {
    /// One stopped record per instance `1..=fleet_size`
    pub fn new(fleet_size: u32, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        let records = (1..=fleet_size)
            .map(|n| (InstanceId(n), InstanceStatus::new(InstanceId(n), now)))
            .collect();
        Self {
            inner: Arc::new(RwLock::new(records)),
            clock,
            mirror: None,
            call_timeout: Duration::from_secs(5),
        }
    }

    /// Push every change to `mirror`, each push bounded by `call_timeout`
    pub fn set_mirror(&mut self, mirror: Arc<dyn StatusMirror>, call_timeout: Duration) {
        self.mirror = Some(mirror);
        self.call_timeout = call_timeout;
    }

    pub fn snapshot(&self, id: InstanceId) -> Option<InstanceStatus> {
        self.inner.read().ok()?.get(&id).cloned()
    }

    /// Copies of every record, sorted by instance id
    pub fn snapshot_all(&self) -> Vec<InstanceStatus> {
        self.inner
            .read()
            .map(|table| table.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn mark_running(&self, id: InstanceId, protected_count: usize) {
        let now = self.clock.now();
        if let Ok(mut table) = self.inner.write() {
            if let Some(status) = table.get_mut(&id) {
                status.mark_running(now, protected_count);
            }
        }
    }

    pub fn mark_stopped(&self, id: InstanceId) {
        let now = self.clock.now();
        if let Ok(mut table) = self.inner.write() {
            if let Some(status) = table.get_mut(&id) {
                status.mark_stopped(now);
            }
        }
    }

    /// Record a finished tick of a running instance.
    ///
    /// The cancellation check happens under the write lock, so once `stop`
    /// has cancelled the token a late tick can no longer land. Returns
    /// whether the record changed.
    pub fn record_tick(
        &self,
        id: InstanceId,
        cancel: &CancellationToken,
        memory_estimate: u64,
        protected_count: Option<usize>,
    ) -> bool {
        let Ok(mut table) = self.inner.write() else {
            return false;
        };
        if cancel.is_cancelled() {
            return false;
        }
        match table.get_mut(&id) {
            Some(status) if status.is_running() => {
                status.record_tick(memory_estimate, protected_count);
                true
            }
            _ => false,
        }
    }

    /// Copy the current record of `id` to the mirror, if there is one.
    ///
    /// The record is read and saved under the read lock, so a publish never
    /// overwrites a newer state with an older one.
    pub async fn publish(&self, id: InstanceId, cancel: Option<CancellationToken>) {
        let Some(mirror) = self.mirror.clone() else {
            return;
        };
        let inner = Arc::clone(&self.inner);

        let saved = crate::persistence::run_blocking(self.call_timeout, move || {
            let table = inner
                .read()
                .map_err(|e| anyhow::anyhow!("Status table lock poisoned: {}", e))?;
            if cancel.is_some_and(|c| c.is_cancelled()) {
                return Ok(());
            }
            match table.get(&id) {
                Some(status) => mirror.save_status(status),
                None => Ok(()),
            }
        })
        .await;

        if let Err(e) = saved {
            warn!("Failed to mirror status of instance {}: {}", id, e);
        }
    }
}

/// A spawned monitoring loop
struct MonitorTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl MonitorTask {
    /// Wait for an already cancelled task, aborting it after `grace`
    async fn join(self, id: InstanceId, grace: Duration) {
        self.cancel.cancel();
        let mut handle = self.handle;
        if tokio::time::timeout(grace, &mut handle).await.is_err() {
            warn!("Instance {} did not stop within {:?}, aborting", id, grace);
            handle.abort();
        }
    }
}

/// Starts, stops and reports on the fleet of watchdog instances
pub struct Coordinator {
    settings: Settings,
    table: StatusTable,
    /// Per-instance control lock and the running task, if any
    controls: BTreeMap<InstanceId, tokio::sync::Mutex<Option<MonitorTask>>>,
    context: WatchdogContext,
}

impl Coordinator {
    pub fn new(settings: Settings, context: WatchdogContext, clock: Arc<dyn Clock>) -> Self {
        let fleet_size = settings.fleet_size;
        let controls = (1..=fleet_size)
            .map(|n| (InstanceId(n), tokio::sync::Mutex::new(None)))
            .collect();

        info!("Coordinator ready for {} watchdog instances", fleet_size);

        Self {
            table: StatusTable::new(fleet_size, clock),
            settings,
            controls,
            context,
        }
    }

    /// Mirror every status change into `mirror`
    pub fn with_status_mirror(mut self, mirror: Arc<dyn StatusMirror>) -> Self {
        let call_timeout = self.settings.call_timeout();
        self.table.set_mirror(mirror, call_timeout);
        self
    }

    pub fn fleet_size(&self) -> u32 {
        self.settings.fleet_size
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Check that `id` belongs to the fleet
    pub fn validate(&self, id: InstanceId) -> Result<InstanceId, ControlError> {
        if self.controls.contains_key(&id) {
            Ok(id)
        } else {
            Err(ControlError::InvalidInstance {
                id: id.get(),
                fleet_size: self.fleet_size(),
            })
        }
    }

    fn control(
        &self,
        id: InstanceId,
    ) -> Result<&tokio::sync::Mutex<Option<MonitorTask>>, ControlError> {
        self.controls
            .get(&id)
            .ok_or(ControlError::InvalidInstance {
                id: id.get(),
                fleet_size: self.fleet_size(),
            })
    }

    /// Start monitoring with instance `id`, replacing any loop it already runs
    pub async fn start(&self, id: InstanceId) -> Result<(), ControlError> {
        let mut slot = self.control(id)?.lock().await;
        self.start_locked(id, &mut slot).await;
        Ok(())
    }

    /// Stop instance `id`, folding its current run into its uptime
    pub async fn stop(&self, id: InstanceId) -> Result<(), ControlError> {
        let mut slot = self.control(id)?.lock().await;
        self.stop_locked(id, &mut slot).await;
        Ok(())
    }

    /// Stop then start `id` without letting another control operation in between
    pub async fn restart(&self, id: InstanceId) -> Result<(), ControlError> {
        let mut slot = self.control(id)?.lock().await;
        self.stop_locked(id, &mut slot).await;
        self.start_locked(id, &mut slot).await;
        info!("Instance {} restarted", id);
        Ok(())
    }

    pub fn get_status(&self, id: InstanceId) -> Result<InstanceStatus, ControlError> {
        self.validate(id)?;
        self.table.snapshot(id).ok_or(ControlError::InvalidInstance {
            id: id.get(),
            fleet_size: self.fleet_size(),
        })
    }

    /// Copies of all status records, sorted by instance id
    pub fn get_all_statuses(&self) -> Vec<InstanceStatus> {
        self.table.snapshot_all()
    }

    /// Instances needed for the protection set: one per target, up to the fleet size
    pub async fn protected_instances(&self) -> anyhow::Result<Vec<InstanceId>> {
        let targets = self.context.read_targets().await?;
        let count = u32::try_from(targets.len())
            .unwrap_or(u32::MAX)
            .min(self.fleet_size());
        Ok((1..=count).map(InstanceId).collect())
    }

    /// Start one instance per protected target, up to the fleet size
    pub async fn start_for_protected(&self) -> anyhow::Result<Vec<InstanceId>> {
        let wanted = self.protected_instances().await?;

        let mut started = Vec::new();
        for id in wanted {
            self.start(id).await?;
            started.push(id);
        }
        info!("Started {} watchdog instances for the protected targets", started.len());
        Ok(started)
    }

    /// Start every instance of the fleet
    pub async fn start_all(&self) -> Vec<InstanceId> {
        let mut started = Vec::new();
        for id in self.controls.keys().copied() {
            match self.start(id).await {
                Ok(()) => started.push(id),
                Err(e) => error!("Failed to start instance {}: {}", id, e),
            }
        }
        started
    }

    /// Stop every instance
    pub async fn shutdown(&self) {
        info!("Shutting down watchdog fleet");
        for id in self.controls.keys().copied() {
            if let Err(e) = self.stop(id).await {
                error!("Failed to stop instance {}: {}", id, e);
            }
        }
    }

    async fn start_locked(&self, id: InstanceId, slot: &mut Option<MonitorTask>) {
        // An unstopped previous loop is replaced; its run is folded by mark_running
        if let Some(previous) = slot.take() {
            previous.join(id, self.settings.shutdown_grace()).await;
        }

        let protected_count = match self.context.read_targets().await {
            Ok(targets) => targets.len(),
            Err(e) => {
                warn!("Instance {} starting without protected count: {}", id, e);
                0
            }
        };

        self.table.mark_running(id, protected_count);
        let cancel = CancellationToken::new();
        let instance = MonitorInstance::new(id, self.context.clone());
        let handle = tokio::spawn(instance.run(cancel.clone(), self.table.clone()));
        *slot = Some(MonitorTask { cancel, handle });

        self.table.publish(id, None).await;
        info!("Instance {} started", id);
    }

    async fn stop_locked(&self, id: InstanceId, slot: &mut Option<MonitorTask>) {
        let task = slot.take();
        if let Some(task) = &task {
            task.cancel.cancel();
        }

        self.table.mark_stopped(id);
        self.table.publish(id, None).await;

        match task {
            Some(task) => {
                task.join(id, self.settings.shutdown_grace()).await;
                info!("Instance {} stopped", id);
            }
            None => debug!("Instance {} was not running", id),
        }
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        for control in self.controls.values() {
            if let Ok(slot) = control.try_lock() {
                if let Some(task) = slot.as_ref() {
                    task.cancel.cancel();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::core::instance::InstanceState;
    use crate::core::mock::{self, MockPeers};
    use crate::persistence::{MemoryStore, StatusMirror};
    use chrono::Utc;

    fn coordinator(store: Arc<MemoryStore>, clock: Arc<ManualClock>) -> Coordinator {
        let ctx = mock::context(
            store.clone(),
            store,
            vec![],
            vec![],
            Arc::new(MockPeers::all_available(5)),
        );
        Coordinator::new(Settings::default(), ctx, clock)
    }

    /// Monitoring loops of `id` that have not finished
    async fn live_loops(coordinator: &Coordinator, id: InstanceId) -> usize {
        match coordinator.controls.get(&id) {
            Some(control) => control
                .lock()
                .await
                .as_ref()
                .map_or(0, |task| usize::from(!task.handle.is_finished())),
            None => 0,
        }
    }

    #[tokio::test]
    async fn test_start_then_stop_accumulates_uptime() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let coordinator = coordinator(Arc::new(MemoryStore::new()), clock.clone());
        let id = InstanceId(1);

        coordinator.start(id).await.unwrap();
        let running = coordinator.get_status(id).unwrap();
        assert_eq!(running.state, InstanceState::Running);
        assert!(running.monitoring_active);
        assert!(running.memory_estimate > 0);

        clock.advance(Duration::from_secs(30));
        coordinator.stop(id).await.unwrap();

        let stopped = coordinator.get_status(id).unwrap();
        assert_eq!(stopped.state, InstanceState::Stopped);
        assert!(!stopped.monitoring_active);
        assert_eq!(stopped.accumulated_uptime, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_restart_folds_running_time() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let coordinator = coordinator(Arc::new(MemoryStore::new()), clock.clone());
        let id = InstanceId(3);

        coordinator.start(id).await.unwrap();
        clock.advance(Duration::from_secs(100));
        coordinator.stop(id).await.unwrap();

        coordinator.start(id).await.unwrap();
        clock.advance(Duration::from_secs(40));
        coordinator.restart(id).await.unwrap();

        let status = coordinator.get_status(id).unwrap();
        assert_eq!(status.state, InstanceState::Running);
        assert_eq!(status.accumulated_uptime, Duration::from_secs(140));
        assert_eq!(status.start_time, clock.now());
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_over_running_instance_carries_uptime() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let coordinator = coordinator(Arc::new(MemoryStore::new()), clock.clone());
        let id = InstanceId(2);

        coordinator.start(id).await.unwrap();
        clock.advance(Duration::from_secs(15));
        coordinator.start(id).await.unwrap();

        let status = coordinator.get_status(id).unwrap();
        assert_eq!(status.accumulated_uptime, Duration::from_secs(15));
        assert_eq!(status.start_time, clock.now());
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_instance_is_rejected() {
        let coordinator = coordinator(
            Arc::new(MemoryStore::new()),
            Arc::new(ManualClock::default()),
        );

        let expected = ControlError::InvalidInstance {
            id: 6,
            fleet_size: 5,
        };
        assert_eq!(coordinator.start(InstanceId(6)).await, Err(expected.clone()));
        assert_eq!(
            coordinator.stop(InstanceId(0)).await.unwrap_err().to_string(),
            "invalid instance id 0: fleet has instances 1..=5"
        );
        assert_eq!(coordinator.get_status(InstanceId(6)), Err(expected));
    }

    #[tokio::test]
    async fn test_start_for_protected_runs_one_instance_per_target() {
        let store = Arc::new(MemoryStore::new().with_targets(["a", "b", "c"]));
        let coordinator = coordinator(store, Arc::new(ManualClock::default()));

        let started = coordinator.start_for_protected().await.unwrap();
        assert_eq!(started, vec![InstanceId(1), InstanceId(2), InstanceId(3)]);

        let statuses = coordinator.get_all_statuses();
        assert_eq!(statuses.len(), 5);
        assert_eq!(statuses.iter().filter(|s| s.is_running()).count(), 3);
        assert!(statuses
            .iter()
            .filter(|s| s.is_running())
            .all(|s| s.protected_count == 3));
        coordinator.shutdown().await;
        assert!(coordinator.get_all_statuses().iter().all(|s| !s.is_running()));
    }

    #[tokio::test]
    async fn test_snapshots_are_copies() {
        let coordinator = coordinator(
            Arc::new(MemoryStore::new()),
            Arc::new(ManualClock::default()),
        );

        let mut snapshot = coordinator.get_all_statuses();
        snapshot[0].state = InstanceState::Restarting;
        snapshot[0].accumulated_uptime = Duration::from_secs(999);

        let fresh = coordinator.get_status(InstanceId(1)).unwrap();
        assert_eq!(fresh.state, InstanceState::Stopped);
        assert_eq!(fresh.accumulated_uptime, Duration::ZERO);
        let ids: Vec<_> = coordinator
            .get_all_statuses()
            .iter()
            .map(|s| s.instance_id.get())
            .collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_cancelled_tick_is_not_recorded() {
        let table = StatusTable::new(2, Arc::new(ManualClock::default()));
        let cancel = CancellationToken::new();
        table.mark_running(InstanceId(1), 0);

        assert!(table.record_tick(InstanceId(1), &cancel, 4096, Some(2)));
        cancel.cancel();
        table.mark_stopped(InstanceId(1));
        assert!(!table.record_tick(InstanceId(1), &cancel, 8192, Some(7)));

        let status = table.snapshot(InstanceId(1)).unwrap();
        assert_eq!(status.memory_estimate, 4096);
        assert_eq!(status.protected_count, 2);
        assert!(!status.monitoring_active);
    }

    #[tokio::test]
    async fn test_status_changes_reach_the_mirror() {
        let store = Arc::new(MemoryStore::new());
        let coordinator = coordinator(store.clone(), Arc::new(ManualClock::default()))
            .with_status_mirror(store.clone());

        coordinator.start(InstanceId(4)).await.unwrap();
        let mirrored = store.load_statuses().unwrap();
        assert_eq!(mirrored.len(), 1);
        assert_eq!(mirrored[0].state, InstanceState::Running);

        coordinator.stop(InstanceId(4)).await.unwrap();
        assert_eq!(
            store.load_statuses().unwrap()[0].state,
            InstanceState::Stopped
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_control_calls_leave_a_single_loop() {
        let clock = Arc::new(ManualClock::default());
        let peers = Arc::new(MockPeers::all_available(5));
        let store = Arc::new(MemoryStore::new());
        let ctx = mock::context(store.clone(), store, vec![], vec![], peers.clone());
        let coordinator = Arc::new(Coordinator::new(Settings::default(), ctx, clock.clone()));
        let id = InstanceId(2);
        // Every live loop holds one more reference to the peer directory
        let idle_refs = Arc::strong_count(&peers);

        let calls: Vec<_> = (0..24)
            .map(|n| {
                let coordinator = Arc::clone(&coordinator);
                tokio::spawn(async move {
                    match n % 3 {
                        0 => coordinator.start(id).await,
                        1 => coordinator.stop(id).await,
                        _ => coordinator.restart(id).await,
                    }
                })
            })
            .collect();

        let mut last = Duration::ZERO;
        while calls.iter().any(|call| !call.is_finished()) {
            clock.advance(Duration::from_secs(1));
            let uptime = coordinator.get_status(id).unwrap().accumulated_uptime;
            assert!(uptime >= last);
            last = uptime;
            tokio::task::yield_now().await;
        }
        for call in calls {
            call.await.unwrap().unwrap();
        }

        let status = coordinator.get_status(id).unwrap();
        assert!(status.accumulated_uptime >= last);
        assert_eq!(status.monitoring_active, status.is_running());
        let live = live_loops(&coordinator, id).await;
        assert_eq!(live, usize::from(status.is_running()));
        assert_eq!(Arc::strong_count(&peers), idle_refs + live);

        coordinator.stop(id).await.unwrap();
        assert_eq!(live_loops(&coordinator, id).await, 0);
        assert_eq!(Arc::strong_count(&peers), idle_refs);
    }

    #[tokio::test]
    async fn test_start_all_then_shutdown() {
        let coordinator = coordinator(
            Arc::new(MemoryStore::new()),
            Arc::new(ManualClock::default()),
        );

        let started = coordinator.start_all().await;
        assert_eq!(started.len(), 5);
        for id in &started {
            assert_eq!(live_loops(&coordinator, *id).await, 1);
        }

        coordinator.shutdown().await;
        for id in &started {
            assert_eq!(live_loops(&coordinator, *id).await, 0);
        }
        assert!(coordinator.get_all_statuses().iter().all(|s| !s.is_running()));
    }

    #[tokio::test]
    async fn test_protected_instances_capped_by_fleet_size() {
        let store = Arc::new(MemoryStore::new().with_targets(["a", "b", "c", "d", "e", "f", "g"]));
        let coordinator = coordinator(store, Arc::new(ManualClock::default()));

        let wanted = coordinator.protected_instances().await.unwrap();
        assert_eq!(wanted, (1..=5).map(InstanceId).collect::<Vec<_>>());
        assert!(coordinator.get_all_statuses().iter().all(|s| !s.is_running()));
    }
}
