//! Watchdog instance - One member of the mesh and its monitoring loop

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::coordinator::StatusTable;
use super::error::WatchdogError;
use super::instance::InstanceId;
use super::monitor::SharedProcessTable;
use super::peers::PeerDirectory;
use super::probe::LivenessProbe;
use super::restart::RestartChain;
use super::target::{ProtectionSet, TargetId};
use crate::persistence::{append_event, run_blocking, EventLog, ProtectionStore};

/// Everything a watchdog instance needs to do its job, shared by the fleet
#[derive(Clone)]
pub struct WatchdogContext {
    pub store: Arc<dyn ProtectionStore>,
    pub events: Arc<dyn EventLog>,
    pub probe: Arc<LivenessProbe>,
    pub restarts: Arc<RestartChain>,
    pub peers: Arc<dyn PeerDirectory>,
    /// Source of the per-tick memory estimate
    pub processes: SharedProcessTable,
    pub tick_interval: Duration,
    /// Upper bound on every store, probe, launch and peer call
    pub call_timeout: Duration,
}

impl WatchdogContext {
    /// Current protection set, bounded by the call timeout
    pub async fn read_targets(&self) -> Result<ProtectionSet, WatchdogError> {
        let store = Arc::clone(&self.store);
        run_blocking(self.call_timeout, move || store.get())
            .await
            .map_err(|e| WatchdogError::ConfigRead(e.to_string()))
    }
}

/// Lifecycle of the loop itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Idle,
    Monitoring,
}

/// What a single tick did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Size of the protection set, `None` if it could not be read
    pub targets: Option<usize>,
    pub restarted: Vec<TargetId>,
    pub failed: Vec<TargetId>,
    pub peers_revived: Vec<InstanceId>,
}

/// One watchdog of the mesh
pub struct MonitorInstance {
    id: InstanceId,
    ctx: WatchdogContext,
    state: MonitorState,
}

impl MonitorInstance {
    pub fn new(id: InstanceId, ctx: WatchdogContext) -> Self {
        Self {
            id,
            ctx,
            state: MonitorState::Idle,
        }
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    /// Run one full pass: protected targets first, then peers.
    ///
    /// Nothing that goes wrong in here ends the loop; failures are logged and
    /// the affected step is skipped until the next tick.
    pub async fn tick(&mut self) -> TickReport {
        self.state = MonitorState::Monitoring;
        let mut report = TickReport::default();

        match self.ctx.read_targets().await {
            Ok(targets) => {
                report.targets = Some(targets.len());
                for target in &targets {
                    self.guard_target(target, &mut report).await;
                }
            }
            Err(e) => {
                // Skip restarts this tick, peers are still checked
                warn!("Instance {}: {}", self.id, e);
                self.log(e.to_string()).await;
            }
        }

        for peer in self.ctx.peers.list_peers(self.id) {
            self.guard_peer(peer, &mut report).await;
        }

        debug!(
            "Instance {} tick done: {} restarted, {} failed, {} peers revived",
            self.id,
            report.restarted.len(),
            report.failed.len(),
            report.peers_revived.len()
        );
        report
    }

    async fn guard_target(&self, target: &TargetId, report: &mut TickReport) {
        let (verdict, errors) = self.ctx.probe.probe_with_errors(target).await;
        for e in errors {
            self.log(e.to_string()).await;
        }
        if verdict.is_alive() {
            return;
        }

        info!("Instance {}: {} is not running, reviving", self.id, target);
        match self.ctx.restarts.revive(self.id, target).await {
            Ok(_) => report.restarted.push(target.clone()),
            Err(_) => report.failed.push(target.clone()),
        }
    }

    async fn guard_peer(&self, peer: InstanceId, report: &mut TickReport) {
        let timeout = self.ctx.call_timeout;
        let checked =
            match tokio::time::timeout(timeout, self.ctx.peers.check_peer_available(peer)).await {
                Ok(result) => result,
                Err(_) => Err(WatchdogError::PeerUnreachable {
                    peer,
                    reason: format!("availability check timed out after {:?}", timeout),
                }),
            };

        match checked {
            Ok(true) => return,
            Ok(false) => {
                warn!("Instance {}: peer {} unavailable", self.id, peer);
                self.log(format!("Peer {} unavailable", peer)).await;
            }
            Err(e) => {
                warn!("Instance {}: {}", self.id, e);
                self.log(e.to_string()).await;
            }
        }

        let revived = match tokio::time::timeout(timeout, self.ctx.peers.revive_peer(peer)).await
        {
            Ok(result) => result,
            Err(_) => Err(WatchdogError::PeerUnreachable {
                peer,
                reason: format!("revival timed out after {:?}", timeout),
            }),
        };

        match revived {
            Ok(()) => {
                self.log(format!("Revived peer {}", peer)).await;
                report.peers_revived.push(peer);
            }
            Err(e) => {
                warn!("Instance {}: {}", self.id, e);
                self.log(e.to_string()).await;
            }
        }
    }

    /// Resident memory reported for this instance, zero if unavailable
    async fn memory_estimate(&self) -> u64 {
        let processes = self.ctx.processes.clone();
        run_blocking(self.ctx.call_timeout, move || Ok(processes.own_memory()))
            .await
            .unwrap_or(0)
    }

    async fn log(&self, message: String) {
        append_event(&self.ctx.events, self.id, message, self.ctx.call_timeout).await;
    }

    /// Tick until cancelled, recording each tick in `table`.
    ///
    /// Cancellation interrupts both an in-flight tick and the sleep between
    /// ticks. Once cancelled the loop never touches `table` again.
    pub async fn run(mut self, cancel: CancellationToken, table: StatusTable) {
        info!("Watchdog instance {} monitoring", self.id);

        loop {
            let report = tokio::select! {
                _ = cancel.cancelled() => break,
                report = self.tick() => report,
            };

            let memory = self.memory_estimate().await;
            if table.record_tick(self.id, &cancel, memory, report.targets) {
                table.publish(self.id, Some(cancel.clone())).await;
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.ctx.tick_interval) => {}
            }
        }

        info!("Watchdog instance {} stopped monitoring", self.id);
    }
}
