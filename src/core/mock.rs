//! Test doubles for probes, launch strategies, stores and peers

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::error::WatchdogError;
use super::instance::InstanceId;
use super::monitor::SharedProcessTable;
use super::peers::PeerDirectory;
use super::probe::{DetectionMethod, Liveness, LivenessProbe};
use super::restart::{LaunchStrategy, RestartChain};
use super::target::{ProtectionSet, TargetId};
use super::watchdog::WatchdogContext;
use crate::persistence::{EventLog, ProtectionStore};

const TEST_TIMEOUT: Duration = Duration::from_millis(500);

/// Context with short timeouts and a tick interval long enough that a
/// spawned loop ticks exactly once during a test
pub fn context(
    store: Arc<dyn ProtectionStore>,
    events: Arc<dyn EventLog>,
    methods: Vec<Arc<dyn DetectionMethod>>,
    strategies: Vec<Arc<dyn LaunchStrategy>>,
    peers: Arc<dyn PeerDirectory>,
) -> WatchdogContext {
    WatchdogContext {
        store,
        events: Arc::clone(&events),
        probe: Arc::new(LivenessProbe::new(methods, TEST_TIMEOUT)),
        restarts: Arc::new(RestartChain::new(strategies, events, TEST_TIMEOUT)),
        peers,
        processes: SharedProcessTable::new(),
        tick_interval: Duration::from_secs(3600),
        call_timeout: TEST_TIMEOUT,
    }
}

/// Detection method with a canned answer
pub struct FixedMethod {
    name: &'static str,
    answer: Option<Liveness>,
}

impl FixedMethod {
    pub fn answering(name: &'static str, answer: Liveness) -> Self {
        Self {
            name,
            answer: Some(answer),
        }
    }

    pub fn failing(name: &'static str) -> Self {
        Self { name, answer: None }
    }
}

#[async_trait]
impl DetectionMethod for FixedMethod {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn check(&self, target: &TargetId) -> Result<Liveness, WatchdogError> {
        self.answer.ok_or_else(|| WatchdogError::Probe {
            method: self.name,
            target: target.clone(),
            reason: "scripted failure".to_string(),
        })
    }
}

/// Detection method that answers only after a delay
pub struct SlowMethod {
    delay: Duration,
    answer: Liveness,
}

impl SlowMethod {
    pub fn new(delay: Duration, answer: Liveness) -> Self {
        Self { delay, answer }
    }
}

#[async_trait]
impl DetectionMethod for SlowMethod {
    fn name(&self) -> &'static str {
        "slow"
    }

    async fn check(&self, _target: &TargetId) -> Result<Liveness, WatchdogError> {
        tokio::time::sleep(self.delay).await;
        Ok(self.answer)
    }
}

enum Script {
    Succeed,
    Fail,
    Hang,
}

/// Launch strategy with a scripted outcome and a call counter
pub struct ScriptedStrategy {
    name: &'static str,
    script: Script,
    calls: AtomicUsize,
}

impl ScriptedStrategy {
    fn new(name: &'static str, script: Script) -> Self {
        Self {
            name,
            script,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn succeeding(name: &'static str) -> Self {
        Self::new(name, Script::Succeed)
    }

    pub fn failing(name: &'static str) -> Self {
        Self::new(name, Script::Fail)
    }

    pub fn hanging(name: &'static str) -> Self {
        Self::new(name, Script::Hang)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LaunchStrategy for ScriptedStrategy {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn attempt(&self, target: &TargetId) -> Result<(), WatchdogError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.script {
            Script::Succeed => Ok(()),
            Script::Fail => Err(WatchdogError::Restart {
                strategy: self.name,
                target: target.clone(),
                reason: "scripted failure".to_string(),
            }),
            Script::Hang => {
                std::future::pending::<()>().await;
                Ok(())
            }
        }
    }
}

/// A pretend system: launching a target makes the probe see it alive
#[derive(Default)]
pub struct FakeWorld {
    alive: Mutex<HashSet<TargetId>>,
}

impl FakeWorld {
    pub fn with_alive<I: IntoIterator<Item = &'static str>>(targets: I) -> Self {
        Self {
            alive: Mutex::new(targets.into_iter().map(TargetId::from).collect()),
        }
    }

    pub fn is_alive(&self, target: &TargetId) -> bool {
        self.alive.lock().unwrap().contains(target)
    }
}

#[async_trait]
impl DetectionMethod for FakeWorld {
    fn name(&self) -> &'static str {
        "fake-world"
    }

    async fn check(&self, target: &TargetId) -> Result<Liveness, WatchdogError> {
        Ok(if self.is_alive(target) {
            Liveness::Alive
        } else {
            Liveness::Dead
        })
    }
}

#[async_trait]
impl LaunchStrategy for FakeWorld {
    fn name(&self) -> &'static str {
        "fake-world"
    }

    async fn attempt(&self, target: &TargetId) -> Result<(), WatchdogError> {
        self.alive.lock().unwrap().insert(target.clone());
        Ok(())
    }
}

/// Peer directory over a fixed fleet with some peers missing
pub struct MockPeers {
    fleet_size: u32,
    unavailable: HashSet<InstanceId>,
    checks: AtomicUsize,
    revived: Mutex<Vec<InstanceId>>,
}

impl MockPeers {
    pub fn with_unavailable<I: IntoIterator<Item = InstanceId>>(
        fleet_size: u32,
        unavailable: I,
    ) -> Self {
        Self {
            fleet_size,
            unavailable: unavailable.into_iter().collect(),
            checks: AtomicUsize::new(0),
            revived: Mutex::new(Vec::new()),
        }
    }

    pub fn all_available(fleet_size: u32) -> Self {
        Self::with_unavailable(fleet_size, std::iter::empty())
    }

    pub fn checks(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }

    pub fn revived(&self) -> Vec<InstanceId> {
        self.revived.lock().unwrap().clone()
    }
}

#[async_trait]
impl PeerDirectory for MockPeers {
    fn list_peers(&self, self_id: InstanceId) -> Vec<InstanceId> {
        (1..=self.fleet_size)
            .map(InstanceId)
            .filter(|id| *id != self_id)
            .collect()
    }

    async fn check_peer_available(&self, peer: InstanceId) -> Result<bool, WatchdogError> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        Ok(!self.unavailable.contains(&peer))
    }

    async fn revive_peer(&self, peer: InstanceId) -> Result<(), WatchdogError> {
        self.revived.lock().unwrap().push(peer);
        Ok(())
    }
}

/// Protection store that is never reachable
pub struct BrokenStore;

impl ProtectionStore for BrokenStore {
    fn get(&self) -> anyhow::Result<ProtectionSet> {
        anyhow::bail!("store offline")
    }

    fn replace_protection_set(&self, _set: &ProtectionSet) -> anyhow::Result<()> {
        anyhow::bail!("store offline")
    }
}
