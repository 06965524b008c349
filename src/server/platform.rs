//! OS-specific process control.
//!
//! Everything that differs between Unix and Windows lives here: building
//! the spawn command for attached or detached servers, probing whether a
//! PID is alive, and delivering graceful or forced termination.

use crate::error::{Error, Result};
use async_process::{Child, Command, Stdio};
use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

/// Build the platform command for the server executable.
fn base_command(
    executable: &Path,
    args: &[String],
    env: &HashMap<String, String>,
) -> std::process::Command {
    let mut command = std::process::Command::new(executable);
    command.args(args);
    for (key, value) in env {
        command.env(key, value);
    }
    if let Some(dir) = executable.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        command.current_dir(dir);
    }
    command
}

/// Spawn the server with piped output, tied to the supervisor's lifetime.
pub fn spawn_attached(
    executable: &Path,
    args: &[String],
    env: &HashMap<String, String>,
) -> Result<Child> {
    let mut command = Command::from(base_command(executable, args, env));
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    command.spawn().map_err(|e| spawn_error(executable, e))
}

/// Spawn the server so it survives the supervisor's exit.
///
/// Output goes to `log` instead of pipes. On Unix the child is placed in its
/// own process group so terminal signals aimed at the supervisor do not
/// reach it; on Windows it is created detached from the console. The
/// returned handle is not killed when dropped.
pub fn spawn_detached(
    executable: &Path,
    args: &[String],
    env: &HashMap<String, String>,
    log: File,
) -> Result<Child> {
    let mut command = base_command(executable, args, env);

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        use windows_sys::Win32::System::Threading::{CREATE_NEW_PROCESS_GROUP, DETACHED_PROCESS};
        command.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
    }

    let stderr_log = log
        .try_clone()
        .map_err(|e| Error::Process(format!("Failed to duplicate log handle: {}", e)))?;

    let mut command = Command::from(command);
    command
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(stderr_log))
        .kill_on_drop(false);

    command.spawn().map_err(|e| spawn_error(executable, e))
}

fn spawn_error(executable: &Path, e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::NotFound {
        Error::Process(format!(
            "Server executable not found: {}",
            executable.display()
        ))
    } else {
        Error::Process(format!("Failed to start process: {}", e))
    }
}

/// Check if a process with given PID is running.
#[cfg(unix)]
pub fn is_process_running(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }

    // Signal 0 performs the permission and existence checks only.
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Check if a process with given PID is running (Windows).
#[cfg(windows)]
pub fn is_process_running(pid: u32) -> bool {
    use windows_sys::Win32::Foundation::{CloseHandle, STILL_ACTIVE};
    use windows_sys::Win32::System::Threading::{
        GetExitCodeProcess, OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION,
    };

    unsafe {
        let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
        if handle.is_null() {
            return false;
        }

        let mut exit_code: u32 = 0;
        let result = GetExitCodeProcess(handle, &mut exit_code);
        CloseHandle(handle);

        result != 0 && exit_code == STILL_ACTIVE as u32
    }
}

/// Ask the process to shut down cleanly. A process that is already gone
/// is not an error.
#[cfg(unix)]
pub fn terminate(pid: u32) -> Result<()> {
    send_signal(pid, nix::sys::signal::Signal::SIGTERM)
}

/// Kill the process immediately.
#[cfg(unix)]
pub fn force_kill(pid: u32) -> Result<()> {
    send_signal(pid, nix::sys::signal::Signal::SIGKILL)
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: nix::sys::signal::Signal) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let raw = i32::try_from(pid)
        .map_err(|_| Error::Process(format!("PID {} out of range", pid)))?;

    tracing::debug!(pid, ?signal, "Sending signal");
    match kill(Pid::from_raw(raw), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(Error::Process(format!(
            "Failed to send {:?} to {}: {}",
            signal, pid, e
        ))),
    }
}

/// Ask the process to shut down cleanly (Windows).
#[cfg(windows)]
pub fn terminate(pid: u32) -> Result<()> {
    taskkill(pid, false)
}

/// Kill the process immediately (Windows).
#[cfg(windows)]
pub fn force_kill(pid: u32) -> Result<()> {
    taskkill(pid, true)
}

#[cfg(windows)]
fn taskkill(pid: u32, force: bool) -> Result<()> {
    let mut command = std::process::Command::new("taskkill");
    command.args(["/PID", &pid.to_string(), "/T"]);
    if force {
        command.arg("/F");
    }
    command
        .output()
        .map(|_| ())
        .map_err(|e| Error::Process(format!("Failed to run taskkill for {}: {}", pid, e)))
}
