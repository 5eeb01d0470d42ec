//! Unkill - Keep protected applications running
//!
//! Command line front end: runs the watchdog fleet, a single standalone
//! watchdog instance, or inspects and edits the shared state.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use single_instance::SingleInstance;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use unkill::core::{
    Clock, Coordinator, EntryPointDirectory, InstanceId, LivenessProbe, ProtectionSet,
    RestartChain, Settings, SharedProcessTable, SystemClock, TargetId, WatchdogContext,
};
use unkill::persistence::{ActivityStore, Database, EventLog, ProtectionStore, StatusMirror};
use unkill::{APP_NAME, APP_VERSION};

#[derive(Parser)]
#[command(name = "unkill")]
#[command(version, about = "Keep protected applications running", long_about = None)]
struct Cli {
    /// Directory holding the shared database
    #[arg(long, value_name = "DIR", global = true)]
    data_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the watchdog fleet and run until Ctrl+C
    Run {
        /// Start every instance instead of one per protected target
        #[arg(long)]
        all: bool,
    },

    /// Run one standalone watchdog instance (the peer entry point)
    Instance {
        #[arg(long)]
        id: u32,
    },

    /// Replace the protection set
    Protect {
        #[arg(required = true)]
        targets: Vec<String>,
    },

    /// Clear the protection set
    Unprotect,

    /// Print the protection set
    Targets,

    /// Print the last known status of every instance
    Status,

    /// Print the shared event log, oldest first
    Log,

    /// Print peer entry points and whether they can be launched
    Peers,

    /// Edit the persisted settings
    Configure {
        #[arg(long)]
        fleet_size: Option<u32>,

        /// Seconds between ticks
        #[arg(long, value_name = "SECS")]
        tick_interval: Option<u32>,

        #[arg(long, value_name = "MS")]
        call_timeout_ms: Option<u32>,

        /// Seconds a sighting keeps a target counted as alive
        #[arg(long, value_name = "SECS")]
        activity_window: Option<u32>,

        /// Number of event log entries kept (20 to 25)
        #[arg(long, value_name = "K")]
        log_capacity: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (settings, db) = open_database(cli.data_dir.clone())?;
    init_logging(cli.verbose || settings.debug_logging);

    info!("{} v{} starting...", APP_NAME, APP_VERSION);

    match cli.command {
        Command::Run { all } => run_fleet(settings, db, all).await,
        Command::Instance { id } => run_instance(settings, db, id).await,
        Command::Protect { targets } => {
            let set = targets
                .into_iter()
                .map(|target| TargetId::from(target).into_absolute())
                .collect::<std::io::Result<ProtectionSet>>()
                .context("Failed to resolve a target path")?;
            db.replace_protection_set(&set)?;
            println!("Protecting {} application(s)", set.len());
            Ok(())
        }
        Command::Unprotect => {
            db.replace_protection_set(&ProtectionSet::new())?;
            println!("Protection cleared");
            Ok(())
        }
        Command::Targets => {
            for target in db.get()? {
                println!("{}", target);
            }
            Ok(())
        }
        Command::Status => print_statuses(&db),
        Command::Log => {
            for entry in db.tail()? {
                println!("{}", entry.to_line());
            }
            Ok(())
        }
        Command::Peers => {
            let peers = peer_directory(&settings)?;
            for (descriptor, available) in peers.peer_report() {
                println!(
                    "WATCHDOG{}  {:<11}  {}",
                    descriptor.instance_id,
                    if available { "available" } else { "unavailable" },
                    descriptor.command_line()
                );
            }
            Ok(())
        }
        Command::Configure {
            fleet_size,
            tick_interval,
            call_timeout_ms,
            activity_window,
            log_capacity,
        } => {
            let mut settings = settings;
            if let Some(v) = fleet_size {
                settings.fleet_size = v;
            }
            if let Some(v) = tick_interval {
                settings.tick_interval_secs = v;
            }
            if let Some(v) = call_timeout_ms {
                settings.call_timeout_ms = v;
            }
            if let Some(v) = activity_window {
                settings.activity_window_secs = v;
            }
            if let Some(v) = log_capacity {
                settings.event_log_capacity = v;
            }
            settings.validate();
            db.save_settings(&settings)?;
            println!("{}", serde_json::to_string_pretty(&settings)?);
            Ok(())
        }
    }
}

/// Initialize the logging system
fn init_logging(debug: bool) {
    let default = if debug { "unkill=debug" } else { "unkill=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Open the shared database and load the persisted settings.
///
/// `--data-dir` wins over a data directory stored in the settings.
fn open_database(data_dir: Option<PathBuf>) -> Result<(Settings, Arc<Database>)> {
    let bootstrap = Settings {
        data_directory: data_dir.clone(),
        ..Default::default()
    };
    let db = Database::for_settings(&bootstrap)?;

    let Some(stored) = db.load_settings()? else {
        return Ok((bootstrap, Arc::new(db)));
    };

    let settings = Settings {
        data_directory: data_dir.or_else(|| stored.data_directory.clone()),
        ..stored
    };
    let db = if settings.get_database_path() == db.path() {
        db.with_event_capacity(settings.event_log_capacity)
    } else {
        Database::for_settings(&settings)?
    };
    Ok((settings, Arc::new(db)))
}

fn peer_directory(settings: &Settings) -> Result<EntryPointDirectory> {
    let program = std::env::current_exe().context("Failed to locate the unkill executable")?;
    Ok(EntryPointDirectory::for_fleet(
        settings.fleet_size,
        program,
        Some(settings.get_data_directory()),
    ))
}

/// Wire the real process table, stores, strategies and peers together
fn build_coordinator(settings: Settings, db: Arc<Database>) -> Result<Coordinator> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let processes = SharedProcessTable::new();
    let activity: Arc<dyn ActivityStore> = db.clone();
    let events: Arc<dyn EventLog> = db.clone();

    let probe = LivenessProbe::standard(
        processes.clone(),
        Arc::clone(&activity),
        Arc::clone(&clock),
        settings.activity_window(),
        settings.call_timeout(),
    );
    let restarts = RestartChain::standard(activity, Arc::clone(&events), settings.call_timeout())
        .with_clock(Arc::clone(&clock));

    let context = WatchdogContext {
        store: db.clone(),
        events,
        probe: Arc::new(probe),
        restarts: Arc::new(restarts),
        peers: Arc::new(peer_directory(&settings)?),
        processes,
        tick_interval: settings.tick_interval(),
        call_timeout: settings.call_timeout(),
    };

    let mirror: Arc<dyn StatusMirror> = db;
    Ok(Coordinator::new(settings, context, clock).with_status_mirror(mirror))
}

async fn run_fleet(settings: Settings, db: Arc<Database>, all: bool) -> Result<()> {
    let data_dir = settings.get_data_directory();
    let coordinator = build_coordinator(settings, db)?;

    let wanted = if all {
        (1..=coordinator.fleet_size()).map(InstanceId).collect()
    } else {
        coordinator.protected_instances().await?
    };
    if wanted.is_empty() {
        warn!("Nothing is protected; no watchdog instance started (use `unkill protect` or `--all`)");
    }

    // Held until shutdown, so a peer reviving one of these ids backs off
    let mut locks = Vec::new();
    for id in wanted {
        let lock = instance_lock(&data_dir, id)?;
        if !lock.is_single() {
            info!("Watchdog instance {} already runs in another process", id);
            continue;
        }
        coordinator.start(id).await?;
        locks.push(lock);
    }

    wait_for_shutdown().await;
    coordinator.shutdown().await;
    drop(locks);
    info!("{} shutting down", APP_NAME);
    Ok(())
}

async fn run_instance(settings: Settings, db: Arc<Database>, id: u32) -> Result<()> {
    let id = InstanceId(id);
    // A redundant revival by a peer must not start a second copy
    let lock = instance_lock(&settings.get_data_directory(), id)?;
    if !lock.is_single() {
        info!("Watchdog instance {} is already running", id);
        return Ok(());
    }

    let coordinator = build_coordinator(settings, db)?;
    coordinator.start(id).await?;

    wait_for_shutdown().await;
    coordinator.shutdown().await;
    Ok(())
}

/// Lock owned by whichever process runs instance `id` over `data_dir`
fn instance_lock(data_dir: &Path, id: InstanceId) -> Result<SingleInstance> {
    SingleInstance::new(&instance_lock_name(data_dir, id))
        .context("Failed to create single instance lock")
}

/// Fleets over different data directories never share a lock
fn instance_lock_name(data_dir: &Path, id: InstanceId) -> String {
    let dir = std::fs::canonicalize(data_dir).unwrap_or_else(|_| data_dir.to_path_buf());
    let digest = blake3::hash(dir.to_string_lossy().as_bytes());
    format!("unkill-watchdog-{}-{}", &digest.to_hex()[..16], id)
}

async fn wait_for_shutdown() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
    }
}

fn print_statuses(db: &Database) -> Result<()> {
    let statuses = db.load_statuses()?;
    if statuses.is_empty() {
        println!("No instance has reported yet");
        return Ok(());
    }

    let now = Utc::now();
    println!(
        "{:<10} {:<10} {:>10} {:>10} {:>12}",
        "INSTANCE", "STATE", "TARGETS", "MEMORY", "UPTIME"
    );
    for status in statuses {
        println!(
            "{:<10} {:<10} {:>10} {:>10} {:>12}",
            format!("WATCHDOG{}", status.instance_id),
            status.state.label(),
            status.protected_count,
            format_bytes(status.memory_estimate),
            format_uptime(status.total_uptime(now)),
        );
    }
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    const MB: u64 = 1024 * 1024;
    if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else {
        format!("{} KB", bytes / 1024)
    }
}

fn format_uptime(uptime: Duration) -> String {
    let secs = uptime.as_secs();
    format!("{}h {:02}m {:02}s", secs / 3600, (secs % 3600) / 60, secs % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["unkill", "instance", "--id", "3", "--data-dir", "/tmp/u"])
            .unwrap();
        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/u")));
        assert!(matches!(cli.command, Command::Instance { id: 3 }));
    }

    #[test]
    fn test_protect_requires_a_target() {
        assert!(Cli::try_parse_from(["unkill", "protect"]).is_err());
    }

    #[test]
    fn test_lock_name_depends_on_data_directory() {
        let a = tempfile::TempDir::new().unwrap();
        let b = tempfile::TempDir::new().unwrap();

        let first = instance_lock_name(a.path(), InstanceId(2));
        assert_eq!(first, instance_lock_name(a.path(), InstanceId(2)));
        assert_ne!(first, instance_lock_name(b.path(), InstanceId(2)));
        assert_ne!(first, instance_lock_name(a.path(), InstanceId(3)));
        assert!(first.starts_with("unkill-watchdog-"));
        assert!(first.ends_with("-2"));
    }

    #[test]
    fn test_instance_lock_blocks_a_second_holder() {
        let dir = tempfile::TempDir::new().unwrap();
        let held = instance_lock(dir.path(), InstanceId(1)).unwrap();
        assert!(held.is_single());

        let duplicate = instance_lock(dir.path(), InstanceId(1)).unwrap();
        assert!(!duplicate.is_single());

        let other = tempfile::TempDir::new().unwrap();
        assert!(instance_lock(other.path(), InstanceId(1)).unwrap().is_single());
    }

    #[test]
    fn test_format_uptime() {
        assert_eq!(format_uptime(Duration::from_secs(3725)), "1h 02m 05s");
        assert_eq!(format_uptime(Duration::ZERO), "0h 00m 00s");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(2048), "2 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MB");
    }
}
