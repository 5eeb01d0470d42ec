//! Liveness probe - Ordered chain of heuristic "is this target running" checks
//!
//! Each detection method answers Alive, Dead or Unknown. The first answer
//! that is not Unknown wins; when every method abstains the target is taken
//! to be dead, which favours a redundant restart over silently giving up.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::clock::Clock;
use super::error::WatchdogError;
use super::monitor::SharedProcessTable;
use super::target::TargetId;
use crate::persistence::{ActivityRecord, ActivityStore};

/// Answer of one detection method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Dead,
    Unknown,
}

/// One way of telling whether a target is running
#[async_trait]
pub trait DetectionMethod: Send + Sync {
    fn name(&self) -> &'static str;

    async fn check(&self, target: &TargetId) -> Result<Liveness, WatchdogError>;
}

/// Final answer of the probe and the method that produced it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeVerdict {
    pub liveness: Liveness,
    /// `None` when every method abstained and the default applied
    pub decided_by: Option<&'static str>,
}

impl ProbeVerdict {
    pub fn is_alive(&self) -> bool {
        self.liveness == Liveness::Alive
    }
}

/// Ordered chain of detection methods
pub struct LivenessProbe {
    methods: Vec<Arc<dyn DetectionMethod>>,
    call_timeout: Duration,
}

impl LivenessProbe {
    pub fn new(methods: Vec<Arc<dyn DetectionMethod>>, call_timeout: Duration) -> Self {
        Self {
            methods,
            call_timeout,
        }
    }

    /// Process scan first, then the recent-activity window
    pub fn standard(
        processes: SharedProcessTable,
        activity: Arc<dyn ActivityStore>,
        clock: Arc<dyn Clock>,
        activity_window: Duration,
        call_timeout: Duration,
    ) -> Self {
        let scan = ProcessScan::new(processes, Arc::clone(&activity), Arc::clone(&clock));
        let recent = RecentActivity::new(activity, clock, activity_window);
        Self::new(vec![Arc::new(scan), Arc::new(recent)], call_timeout)
    }

    pub async fn is_alive(&self, target: &TargetId) -> bool {
        self.probe(target).await.is_alive()
    }

    /// Run the chain and report which method decided.
    ///
    /// A method that fails or exceeds the call timeout is treated as Unknown.
    /// Failures are returned alongside the verdict so callers can log them.
    pub async fn probe_with_errors(
        &self,
        target: &TargetId,
    ) -> (ProbeVerdict, Vec<WatchdogError>) {
        let mut errors = Vec::new();

        for method in &self.methods {
            let answer = match tokio::time::timeout(self.call_timeout, method.check(target)).await
            {
                Ok(Ok(liveness)) => liveness,
                Ok(Err(e)) => {
                    warn!("{}", e);
                    errors.push(e);
                    Liveness::Unknown
                }
                Err(_) => {
                    let e = WatchdogError::Probe {
                        method: method.name(),
                        target: target.clone(),
                        reason: format!("timed out after {:?}", self.call_timeout),
                    };
                    warn!("{}", e);
                    errors.push(e);
                    Liveness::Unknown
                }
            };

            if answer != Liveness::Unknown {
                debug!("{} is {:?} according to {}", target, answer, method.name());
                return (
                    ProbeVerdict {
                        liveness: answer,
                        decided_by: Some(method.name()),
                    },
                    errors,
                );
            }
        }

        debug!("No method could tell whether {} runs, assuming dead", target);
        (
            ProbeVerdict {
                liveness: Liveness::Dead,
                decided_by: None,
            },
            errors,
        )
    }

    pub async fn probe(&self, target: &TargetId) -> ProbeVerdict {
        self.probe_with_errors(target).await.0
    }
}

/// Looks for a matching process in the live process list.
///
/// A hit is recorded as a sighting so the recent-activity method and the
/// entry-point launch strategy can use it later.
pub struct ProcessScan {
    processes: SharedProcessTable,
    activity: Arc<dyn ActivityStore>,
    clock: Arc<dyn Clock>,
}

impl ProcessScan {
    pub fn new(
        processes: SharedProcessTable,
        activity: Arc<dyn ActivityStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            processes,
            activity,
            clock,
        }
    }
}

#[async_trait]
impl DetectionMethod for ProcessScan {
    fn name(&self) -> &'static str {
        "process-scan"
    }

    async fn check(&self, target: &TargetId) -> Result<Liveness, WatchdogError> {
        let processes = self.processes.clone();
        let activity = Arc::clone(&self.activity);
        let now = self.clock.now();
        let wanted = target.clone();

        let outcome = tokio::task::spawn_blocking(move || -> anyhow::Result<Liveness> {
            let Some(sighting) = processes.find_target(&wanted)? else {
                // Not listed is not proof of death: names can differ from ids
                return Ok(Liveness::Unknown);
            };

            let record = ActivityRecord {
                last_seen: now,
                executable: sighting.executable,
                arguments: sighting.arguments,
            };
            if let Err(e) = activity.record_sighting(&wanted, &record) {
                warn!("Failed to record sighting of {}: {}", wanted, e);
            }
            Ok(Liveness::Alive)
        })
        .await;

        match outcome {
            Ok(Ok(liveness)) => Ok(liveness),
            Ok(Err(e)) => Err(WatchdogError::Probe {
                method: self.name(),
                target: target.clone(),
                reason: e.to_string(),
            }),
            Err(e) => Err(WatchdogError::Probe {
                method: self.name(),
                target: target.clone(),
                reason: e.to_string(),
            }),
        }
    }
}

/// Treats a target seen alive within the activity window as alive
pub struct RecentActivity {
    activity: Arc<dyn ActivityStore>,
    clock: Arc<dyn Clock>,
    window: Duration,
}

impl RecentActivity {
    pub fn new(activity: Arc<dyn ActivityStore>, clock: Arc<dyn Clock>, window: Duration) -> Self {
        Self {
            activity,
            clock,
            window,
        }
    }
}

#[async_trait]
impl DetectionMethod for RecentActivity {
    fn name(&self) -> &'static str {
        "recent-activity"
    }

    async fn check(&self, target: &TargetId) -> Result<Liveness, WatchdogError> {
        let activity = Arc::clone(&self.activity);
        let wanted = target.clone();
        let record = tokio::task::spawn_blocking(move || activity.last_sighting(&wanted))
            .await
            .map_err(anyhow::Error::from)
            .and_then(|result| result)
            .map_err(|e| WatchdogError::Probe {
                method: self.name(),
                target: target.clone(),
                reason: e.to_string(),
            })?;

        let Some(record) = record else {
            return Ok(Liveness::Unknown);
        };

        let age = (self.clock.now() - record.last_seen)
            .to_std()
            .unwrap_or_default();
        if age <= self.window {
            Ok(Liveness::Alive)
        } else {
            Ok(Liveness::Dead)
        }
    }
}
