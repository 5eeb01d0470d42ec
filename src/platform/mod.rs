//! Platform-specific process launching and executable lookup

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use tracing::{debug, warn};

/// Spawn `program` detached from the watchdog and return its PID.
///
/// The child is reaped on a background thread so an exited target never
/// lingers as a zombie.
pub fn spawn_detached<I, S>(program: &Path, args: I) -> Result<u32>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    // The child runs from the program's directory; a relative path would
    // then be resolved against the wrong place
    let program = std::path::absolute(program)
        .with_context(|| format!("Failed to resolve {}", program.display()))?;
    let program = program.as_path();

    let mut cmd = Command::new(program);
    cmd.args(args);

    if let Some(parent) = program.parent().filter(|p| !p.as_os_str().is_empty()) {
        cmd.current_dir(parent);
    }

    // Detach from our process group
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        cmd.creation_flags(0x00000008); // DETACHED_PROCESS
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }
    }

    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("Failed to spawn {}", program.display()))?;

    let pid = child.id();
    debug!("Spawned {} with PID {}", program.display(), pid);

    let reaper = std::thread::Builder::new()
        .name(format!("reap-{}", pid))
        .spawn(move || {
            let _ = child.wait();
        });
    if let Err(e) = reaper {
        warn!("Failed to start reaper for PID {}: {}", pid, e);
    }

    Ok(pid)
}

/// Whether `path` is a file the current user may execute
pub fn is_executable(path: &Path) -> bool {
    let Ok(metadata) = std::fs::metadata(path) else {
        return false;
    };
    if !metadata.is_file() {
        return false;
    }

    #[cfg(unix)]
    {
        use std::os::unix::ffi::OsStrExt;
        let Ok(c_path) = std::ffi::CString::new(path.as_os_str().as_bytes()) else {
            return false;
        };
        // access(2) honours the caller's uid/gid and ACLs
        unsafe { libc::access(c_path.as_ptr(), libc::X_OK) == 0 }
    }

    #[cfg(not(unix))]
    {
        true
    }
}

/// Resolve a bare program name through `PATH`
pub fn resolve_program(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .flat_map(|dir| candidates(&dir, name))
        .find(|candidate| is_executable(candidate))
}

#[cfg(windows)]
fn candidates(dir: &Path, name: &str) -> Vec<PathBuf> {
    let exts = std::env::var("PATHEXT").unwrap_or_else(|_| ".EXE;.BAT;.CMD".to_string());
    std::iter::once(dir.join(name))
        .chain(
            exts.split(';')
                .filter(|ext| !ext.is_empty())
                .map(|ext| dir.join(format!("{}{}", name, ext.to_lowercase()))),
        )
        .collect()
}

#[cfg(not(windows))]
fn candidates(dir: &Path, name: &str) -> Vec<PathBuf> {
    vec![dir.join(name)]
}
