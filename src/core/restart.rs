//! Restart chain - Ordered fallback strategies for relaunching a dead target

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use super::clock::{Clock, SystemClock};
use super::error::WatchdogError;
use super::instance::InstanceId;
use super::target::TargetId;
use crate::persistence::{append_event, ActivityStore, EventLog};
use crate::platform;

/// One way of launching a target
#[async_trait]
pub trait LaunchStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn attempt(&self, target: &TargetId) -> Result<(), WatchdogError>;
}

/// Outcome of a single strategy attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartAttemptResult {
    pub target_id: TargetId,
    /// 1-based position of the strategy in the chain
    pub strategy_index: usize,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

/// Launches the target's program directly.
///
/// Path targets are launched as given, bare names are resolved through PATH.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectLaunch;

#[async_trait]
impl LaunchStrategy for DirectLaunch {
    fn name(&self) -> &'static str {
        "direct"
    }

    async fn attempt(&self, target: &TargetId) -> Result<(), WatchdogError> {
        let program = if target.is_path() {
            Some(PathBuf::from(target.as_str())).filter(|p| platform::is_executable(p))
        } else {
            platform::resolve_program(target.as_str())
        };
        let Some(program) = program else {
            return Err(launch_error(self.name(), target, "no executable found"));
        };

        spawn_off_thread(self.name(), target, program, Vec::new()).await
    }
}

/// Relaunches the target the way it was last seen running
pub struct EntryPointLaunch {
    activity: Arc<dyn ActivityStore>,
}

impl EntryPointLaunch {
    pub fn new(activity: Arc<dyn ActivityStore>) -> Self {
        Self { activity }
    }
}

#[async_trait]
impl LaunchStrategy for EntryPointLaunch {
    fn name(&self) -> &'static str {
        "entry-point"
    }

    async fn attempt(&self, target: &TargetId) -> Result<(), WatchdogError> {
        let activity = Arc::clone(&self.activity);
        let wanted = target.clone();
        let record = tokio::task::spawn_blocking(move || activity.last_sighting(&wanted))
            .await
            .map_err(|e| launch_error(self.name(), target, e))?
            .map_err(|e| launch_error(self.name(), target, e))?;

        let Some((program, arguments)) = record
            .and_then(|record| record.executable.map(|exe| (exe, record.arguments)))
        else {
            return Err(launch_error(self.name(), target, "no recorded entry point"));
        };

        if !platform::is_executable(&program) {
            return Err(launch_error(
                self.name(),
                target,
                format!("{} is not executable", program.display()),
            ));
        }

        spawn_off_thread(self.name(), target, program, arguments).await
    }
}

/// Hands the target to the desktop's default handler
#[derive(Debug, Default, Clone, Copy)]
pub struct DesktopOpen;

#[async_trait]
impl LaunchStrategy for DesktopOpen {
    fn name(&self) -> &'static str {
        "desktop-open"
    }

    async fn attempt(&self, target: &TargetId) -> Result<(), WatchdogError> {
        // A bare name is not something the desktop can open
        if !target.is_path() || !Path::new(target.as_str()).exists() {
            return Err(launch_error(self.name(), target, "not an openable path"));
        }

        open::that_detached(target.as_str()).map_err(|e| launch_error(self.name(), target, e))
    }
}

async fn spawn_off_thread(
    strategy: &'static str,
    target: &TargetId,
    program: PathBuf,
    arguments: Vec<String>,
) -> Result<(), WatchdogError> {
    let spawned =
        tokio::task::spawn_blocking(move || platform::spawn_detached(&program, &arguments)).await;

    match spawned {
        Ok(Ok(_pid)) => Ok(()),
        Ok(Err(e)) => Err(launch_error(strategy, target, e)),
        Err(e) => Err(launch_error(strategy, target, e)),
    }
}

fn launch_error(
    strategy: &'static str,
    target: &TargetId,
    reason: impl std::fmt::Display,
) -> WatchdogError {
    WatchdogError::Restart {
        strategy,
        target: target.clone(),
        reason: reason.to_string(),
    }
}

/// Ordered list of launch strategies, tried until one succeeds
pub struct RestartChain {
    strategies: Vec<Arc<dyn LaunchStrategy>>,
    events: Arc<dyn EventLog>,
    call_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl RestartChain {
    pub fn new(
        strategies: Vec<Arc<dyn LaunchStrategy>>,
        events: Arc<dyn EventLog>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            strategies,
            events,
            call_timeout,
            clock: Arc::new(SystemClock),
        }
    }

    /// Stamp attempt results with `clock` instead of the system clock
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Direct launch, then the recorded entry point, then the desktop handler
    pub fn standard(
        activity: Arc<dyn ActivityStore>,
        events: Arc<dyn EventLog>,
        call_timeout: Duration,
    ) -> Self {
        Self::new(
            vec![
                Arc::new(DirectLaunch),
                Arc::new(EntryPointLaunch::new(activity)),
                Arc::new(DesktopOpen),
            ],
            events,
            call_timeout,
        )
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    /// Try each strategy in order until one succeeds.
    ///
    /// Every attempt is written to the event log on behalf of `source`. When
    /// all strategies fail one more entry records the exhaustion; the caller
    /// retries on its next tick.
    pub async fn revive(
        &self,
        source: InstanceId,
        target: &TargetId,
    ) -> Result<RestartAttemptResult, WatchdogError> {
        for (position, strategy) in self.strategies.iter().enumerate() {
            let index = position + 1;
            let outcome =
                match tokio::time::timeout(self.call_timeout, strategy.attempt(target)).await {
                    Ok(result) => result,
                    Err(_) => Err(launch_error(
                        strategy.name(),
                        target,
                        format!("timed out after {:?}", self.call_timeout),
                    )),
                };

            match outcome {
                Ok(()) => {
                    info!(
                        "Instance {} restarted {} via {} (strategy {})",
                        source,
                        target,
                        strategy.name(),
                        index
                    );
                    self.log(
                        source,
                        format!(
                            "Restarted {} via {} (strategy {})",
                            target,
                            strategy.name(),
                            index
                        ),
                    )
                    .await;
                    return Ok(RestartAttemptResult {
                        target_id: target.clone(),
                        strategy_index: index,
                        success: true,
                        timestamp: self.clock.now(),
                    });
                }
                Err(e) => {
                    warn!("Instance {}: {}", source, e);
                    self.log(
                        source,
                        format!(
                            "Restart of {} via {} (strategy {}) failed: {}",
                            target,
                            strategy.name(),
                            index,
                            e
                        ),
                    )
                    .await;
                }
            }
        }

        let exhausted = WatchdogError::RestartExhausted {
            target: target.clone(),
            attempts: self.strategies.len(),
        };
        warn!("Instance {}: {}", source, exhausted);
        self.log(
            source,
            format!(
                "All {} restart strategies failed for {}",
                self.strategies.len(),
                target
            ),
        )
        .await;
        Err(exhausted)
    }

    async fn log(&self, source: InstanceId, message: String) {
        append_event(&self.events, source, message, self.call_timeout).await;
    }
}
