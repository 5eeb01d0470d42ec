//! Peer directory - Entry points of the other watchdog instances

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::debug;

use super::error::WatchdogError;
use super::instance::InstanceId;
use crate::platform;

/// How to launch one watchdog instance as its own process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerDescriptor {
    pub instance_id: InstanceId,
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl PeerDescriptor {
    /// Shell-like rendering for diagnostics
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.display().to_string())
            .chain(self.args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Static map from instance to its peers' entry points
#[async_trait]
pub trait PeerDirectory: Send + Sync {
    /// Every other instance of the fleet
    fn list_peers(&self, self_id: InstanceId) -> Vec<InstanceId>;

    /// Whether the peer's entry point can currently be launched
    async fn check_peer_available(&self, peer: InstanceId) -> Result<bool, WatchdogError>;

    /// Best-effort launch of the peer's entry point
    async fn revive_peer(&self, peer: InstanceId) -> Result<(), WatchdogError>;
}

/// Peers launched through this program's `instance` subcommand
#[derive(Debug, Clone)]
pub struct EntryPointDirectory {
    descriptors: Vec<PeerDescriptor>,
}

impl EntryPointDirectory {
    pub fn new(descriptors: Vec<PeerDescriptor>) -> Self {
        Self { descriptors }
    }

    /// One descriptor per instance: `program [--data-dir DIR] instance --id N`
    pub fn for_fleet(fleet_size: u32, program: PathBuf, data_dir: Option<PathBuf>) -> Self {
        let descriptors = (1..=fleet_size)
            .map(|n| {
                let mut args = Vec::new();
                if let Some(dir) = &data_dir {
                    args.push("--data-dir".to_string());
                    args.push(dir.display().to_string());
                }
                args.extend(["instance".to_string(), "--id".to_string(), n.to_string()]);
                PeerDescriptor {
                    instance_id: InstanceId(n),
                    program: program.clone(),
                    args,
                }
            })
            .collect();
        Self::new(descriptors)
    }

    pub fn descriptor(&self, id: InstanceId) -> Option<&PeerDescriptor> {
        self.descriptors.iter().find(|d| d.instance_id == id)
    }

    /// Availability of every entry point, in instance order
    pub fn peer_report(&self) -> Vec<(PeerDescriptor, bool)> {
        self.descriptors
            .iter()
            .map(|d| (d.clone(), platform::is_executable(&d.program)))
            .collect()
    }

    fn lookup(&self, peer: InstanceId) -> Result<&PeerDescriptor, WatchdogError> {
        self.descriptor(peer)
            .ok_or_else(|| WatchdogError::PeerUnreachable {
                peer,
                reason: "not part of the fleet".to_string(),
            })
    }
}

#[async_trait]
impl PeerDirectory for EntryPointDirectory {
    fn list_peers(&self, self_id: InstanceId) -> Vec<InstanceId> {
        self.descriptors
            .iter()
            .map(|d| d.instance_id)
            .filter(|id| *id != self_id)
            .collect()
    }

    async fn check_peer_available(&self, peer: InstanceId) -> Result<bool, WatchdogError> {
        let program = self.lookup(peer)?.program.clone();
        tokio::task::spawn_blocking(move || platform::is_executable(&program))
            .await
            .map_err(|e| WatchdogError::PeerUnreachable {
                peer,
                reason: e.to_string(),
            })
    }

    async fn revive_peer(&self, peer: InstanceId) -> Result<(), WatchdogError> {
        let descriptor = self.lookup(peer)?.clone();
        debug!("Reviving peer {}: {}", peer, descriptor.command_line());

        let spawned = tokio::task::spawn_blocking(move || {
            platform::spawn_detached(&descriptor.program, &descriptor.args)
        })
        .await;

        match spawned {
            Ok(Ok(_pid)) => Ok(()),
            Ok(Err(e)) => Err(WatchdogError::PeerUnreachable {
                peer,
                reason: e.to_string(),
            }),
            Err(e) => Err(WatchdogError::PeerUnreachable {
                peer,
                reason: e.to_string(),
            }),
        }
    }
}
