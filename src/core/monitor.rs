//! Process table - Live process listing used for liveness and memory estimates

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use sysinfo::{ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System, UpdateKind};
use tracing::trace;

use super::target::TargetId;

/// Minimum time between two full process refreshes
const REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// A running process that matched a target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSighting {
    pub pid: u32,
    pub executable: Option<PathBuf>,
    /// Command line without argv[0]
    pub arguments: Vec<String>,
}

/// Snapshot of the system's processes
pub struct ProcessTable {
    system: System,
    last_refresh: Option<Instant>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            last_refresh: None,
        }
    }

    fn refresh_kind() -> ProcessRefreshKind {
        ProcessRefreshKind::new()
            .with_memory()
            .with_exe(UpdateKind::OnlyIfNotSet)
            .with_cmd(UpdateKind::OnlyIfNotSet)
    }

    /// Refresh the process list, at most once per refresh interval
    pub fn refresh(&mut self) {
        let now = Instant::now();
        if let Some(last) = self.last_refresh {
            if now.duration_since(last) < REFRESH_INTERVAL {
                return;
            }
        }

        self.system
            .refresh_processes_specifics(ProcessesToUpdate::All, true, Self::refresh_kind());
        self.last_refresh = Some(now);
        trace!("Process table refreshed");
    }

    /// Find a live process whose name or executable matches the target
    pub fn find_target(&self, target: &TargetId) -> Option<ProcessSighting> {
        let resolved = resolve_target_path(target);
        self.system
            .processes()
            .iter()
            .filter(|(_, process)| {
                !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead)
            })
            .find(|(_, process)| {
                matches_target(
                    &process.name().to_string_lossy(),
                    process.exe(),
                    target,
                    resolved.as_deref(),
                )
            })
            .map(|(pid, process)| ProcessSighting {
                pid: pid.as_u32(),
                executable: process.exe().map(Path::to_path_buf),
                arguments: process
                    .cmd()
                    .iter()
                    .skip(1)
                    .map(|arg| arg.to_string_lossy().to_string())
                    .collect(),
            })
    }

    /// Resident memory of the watchdog process itself
    pub fn own_memory(&mut self) -> Option<u64> {
        let pid = sysinfo::get_current_pid().ok()?;
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            false,
            ProcessRefreshKind::new().with_memory(),
        );
        self.system.process(pid).map(|p| p.memory())
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

/// The file a path target ends up executing once symlinks are followed.
///
/// The kernel reports a process's executable fully resolved, so a target
/// given through a link only matches through this form.
pub fn resolve_target_path(target: &TargetId) -> Option<PathBuf> {
    if !target.is_path() {
        return None;
    }
    std::fs::canonicalize(target.as_str()).ok()
}

/// Whether a process called `name` running `exe` is the target.
///
/// `resolved` is the target's canonical path, see [`resolve_target_path`].
pub fn matches_target(
    name: &str,
    exe: Option<&Path>,
    target: &TargetId,
    resolved: Option<&Path>,
) -> bool {
    let wanted = target.as_str();
    if target.is_path() {
        return exe.is_some_and(|exe| {
            exe == Path::new(wanted) || resolved.is_some_and(|resolved| exe == resolved)
        });
    }

    name == wanted
        || exe
            .and_then(|exe| exe.file_name())
            .is_some_and(|file| file.to_string_lossy() == wanted)
}

/// Thread-safe wrapper for ProcessTable
pub struct SharedProcessTable {
    inner: Arc<Mutex<ProcessTable>>,
}

impl SharedProcessTable {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ProcessTable::new())),
        }
    }

    /// Refresh and search for the target
    pub fn find_target(&self, target: &TargetId) -> anyhow::Result<Option<ProcessSighting>> {
        let mut table = self
            .inner
            .lock()
            .map_err(|e| anyhow::anyhow!("Process table lock poisoned: {}", e))?;
        table.refresh();
        Ok(table.find_target(target))
    }

    /// Resident memory of this process, zero if it cannot be read
    pub fn own_memory(&self) -> u64 {
        self.inner
            .lock()
            .ok()
            .and_then(|mut table| table.own_memory())
            .unwrap_or(0)
    }
}

impl Default for SharedProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for SharedProcessTable {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_name_matches_process_name() {
        let target = TargetId::from("mpv");
        assert!(matches_target("mpv", None, &target, None));
        assert!(!matches_target("mpvd", None, &target, None));
    }

    #[test]
    fn test_bare_name_matches_executable_file_name() {
        let target = TargetId::from("firefox");
        assert!(matches_target(
            "firefox-bin",
            Some(Path::new("/usr/lib/firefox/firefox")),
            &target,
            None
        ));
    }

    #[test]
    fn test_path_target_requires_exact_executable() {
        let target = TargetId::from("/opt/app/bin/app");
        assert!(matches_target("app", Some(Path::new("/opt/app/bin/app")), &target, None));
        assert!(!matches_target("app", Some(Path::new("/usr/bin/app")), &target, None));
        assert!(!matches_target("app", None, &target, None));
    }

    #[test]
    fn test_linked_path_target_matches_resolved_executable() {
        let target = TargetId::from("/usr/bin/python3");
        let resolved = Path::new("/usr/bin/python3.12");
        assert!(matches_target(
            "python3",
            Some(resolved),
            &target,
            Some(resolved)
        ));
        assert!(!matches_target("python3", Some(resolved), &target, None));
    }

    #[cfg(unix)]
    #[test]
    fn test_finds_process_started_through_symlink() {
        let dir = tempfile::TempDir::new().unwrap();
        let link = dir.path().join("sleeper");
        let sleep = crate::platform::resolve_program("sleep").unwrap();
        std::os::unix::fs::symlink(&sleep, &link).unwrap();

        let mut child = std::process::Command::new(&link).arg("30").spawn().unwrap();
        let target = TargetId::new(link.to_string_lossy().to_string());
        let sighting = SharedProcessTable::new().find_target(&target).unwrap();
        child.kill().unwrap();
        child.wait().unwrap();

        let sighting = sighting.expect("process started through the link was not found");
        assert_eq!(sighting.executable, Some(std::fs::canonicalize(&sleep).unwrap()));
    }

    #[test]
    fn test_finds_own_process() {
        let exe = std::env::current_exe().unwrap();
        let table = SharedProcessTable::new();
        let target = TargetId::new(exe.to_string_lossy().to_string());

        let sighting = table.find_target(&target).unwrap();
        assert!(sighting.is_some());
        assert!(table.own_memory() > 0);
    }
}
