//! Process monitor tests driven by small shell scripts standing in for the
//! dedicated server.
#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use valheim_runner::config::ServerLaunchConfig;
use valheim_runner::error::{Error, Result};
use valheim_runner::server::{
    OutputStream, ParsedEvent, PidFile, PidFileData, ProcessOptions, ProcessState, ServerEvent,
    ServerEventKind, ServerProcess, StartupPhase, platform,
};

const READY_LINE: &str = "02/19/2024 13:37:01: Game server connected";

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).expect("write script");
    let mut permissions = std::fs::metadata(&path).expect("metadata").permissions();
    permissions.set_mode(0o755);
    std::fs::set_permissions(&path, permissions).expect("chmod");
    path
}

fn test_options(dir: &Path, executable: PathBuf) -> ProcessOptions {
    let mut options = ProcessOptions::new(executable);
    options.log_dir = dir.join("logs");
    options.pid_file = dir.join("valheim.pid");
    options.liveness_interval = Duration::from_millis(100);
    options.tail_interval = Duration::from_millis(50);
    options
}

fn launch_config() -> ServerLaunchConfig {
    ServerLaunchConfig::new("Test Hall", 2456, "Midgard", "hunter22")
}

/// Collect events until the given state is reported.
async fn wait_for_state(
    rx: &mut mpsc::UnboundedReceiver<ServerEvent>,
    state: ProcessState,
) -> Vec<ServerEvent> {
    let collect = async {
        let mut seen = Vec::new();
        while let Some(event) = rx.recv().await {
            let reached = event.kind == ServerEventKind::StateChanged { state };
            seen.push(event);
            if reached {
                break;
            }
        }
        seen
    };
    tokio::time::timeout(Duration::from_secs(10), collect)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", state))
}

fn states(events: &[ServerEvent]) -> Vec<ProcessState> {
    events
        .iter()
        .filter_map(|event| match event.kind {
            ServerEventKind::StateChanged { state } => Some(state),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_ready_line_brings_server_online() -> Result<()> {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = write_script(
        dir.path(),
        "server.sh",
        &format!("echo 'Load world: Midgard'\necho '{}'\nexec sleep 30", READY_LINE),
    );
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut process = ServerProcess::new(launch_config(), test_options(dir.path(), script), tx);

    process.start().await?;
    assert!(process.pid().is_some());

    let events = wait_for_state(&mut rx, ProcessState::Online).await;
    assert_eq!(states(&events), vec![ProcessState::Starting, ProcessState::Online]);
    assert!(events.iter().any(|e| matches!(
        &e.kind,
        ServerEventKind::Log { line, stream: OutputStream::Stdout } if line == READY_LINE
    )));
    assert!(events.iter().any(|e| e.kind
        == ServerEventKind::Parsed {
            event: ParsedEvent::ServerReady
        }));
    assert!(events.iter().all(|e| e.server_id == process.id()));
    assert_eq!(process.phase(), Some(StartupPhase::Ready));

    process.stop(Duration::from_secs(5)).await?;
    assert_eq!(process.state(), ProcessState::Offline);
    assert!(process.pid().is_none());
    assert!(!dir.path().join("valheim.pid").exists());

    Ok(())
}

#[tokio::test]
async fn test_unexpected_exit_is_a_crash() -> Result<()> {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = write_script(dir.path(), "server.sh", "echo 'booting'\nexit 3");
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut process = ServerProcess::new(launch_config(), test_options(dir.path(), script), tx);

    process.start().await?;
    let events = wait_for_state(&mut rx, ProcessState::Crashed).await;

    // The last output line arrives before the exit is classified
    let log_index = events
        .iter()
        .position(|e| matches!(&e.kind, ServerEventKind::Log { line, .. } if line == "booting"))
        .expect("log line");
    let error_index = events
        .iter()
        .position(|e| matches!(
            &e.kind,
            ServerEventKind::Error { message } if message.contains("exited unexpectedly")
        ))
        .expect("error event");
    assert!(log_index < error_index);

    assert!(process.wait_for_exit(Duration::from_secs(1)).await);
    assert!(!dir.path().join("valheim.pid").exists());

    // Stopping a crashed server only tidies up
    process.stop(Duration::from_secs(1)).await?;
    assert_eq!(process.state(), ProcessState::Offline);

    Ok(())
}

#[tokio::test]
async fn test_start_twice_is_rejected() -> Result<()> {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = write_script(dir.path(), "server.sh", "exec sleep 30");
    let (tx, _rx) = mpsc::unbounded_channel();
    let mut process = ServerProcess::new(launch_config(), test_options(dir.path(), script), tx);

    process.start().await?;
    assert_eq!(process.state(), ProcessState::Starting);

    let second = process.start().await;
    assert!(matches!(second, Err(Error::AlreadyRunning)));

    process.kill().await?;
    assert_eq!(process.state(), ProcessState::Offline);

    Ok(())
}

#[tokio::test]
async fn test_stop_and_kill_when_offline_do_nothing() -> Result<()> {
    let dir = tempfile::tempdir().expect("tempdir");
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut process = ServerProcess::new(
        launch_config(),
        test_options(dir.path(), dir.path().join("unused")),
        tx,
    );

    process.stop(Duration::from_secs(1)).await?;
    process.kill().await?;

    assert_eq!(process.state(), ProcessState::Offline);
    assert!(rx.try_recv().is_err());

    Ok(())
}

#[tokio::test]
async fn test_missing_executable_reports_crash() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut process = ServerProcess::new(
        launch_config(),
        test_options(dir.path(), dir.path().join("valheim_server.x86_64")),
        tx,
    );

    let result = process.start().await;
    assert!(matches!(result, Err(Error::Process(_))));
    assert_eq!(process.state(), ProcessState::Crashed);

    let mut kinds = Vec::new();
    while let Ok(event) = rx.try_recv() {
        kinds.push(event.kind);
    }
    assert_eq!(kinds.len(), 3);
    assert_eq!(
        kinds[0],
        ServerEventKind::StateChanged {
            state: ProcessState::Starting
        }
    );
    assert!(matches!(&kinds[1], ServerEventKind::Error { message } if message.contains("not found")));
    assert_eq!(
        kinds[2],
        ServerEventKind::StateChanged {
            state: ProcessState::Crashed
        }
    );

    // A crashed monitor may be started again
    assert!(process.state().can_start());
}

#[tokio::test]
async fn test_pid_file_tracks_running_process() -> Result<()> {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = write_script(dir.path(), "server.sh", "exec sleep 30");
    let (tx, _rx) = mpsc::unbounded_channel();
    let options = test_options(dir.path(), script);
    let pid_file = PidFile::new(options.pid_file.clone());
    let mut process = ServerProcess::new(launch_config(), options, tx);

    process.start().await?;

    let data = pid_file.read()?.expect("pid file written");
    assert_eq!(Some(data.pid), process.pid());
    assert_eq!(data.world, "Midgard");
    assert_eq!(data.port, 2456);
    assert_eq!(data.detached, Some(false));
    assert_eq!(data.server_name.as_deref(), Some("Test Hall"));

    process.kill().await?;
    assert!(pid_file.read()?.is_none());

    Ok(())
}

#[tokio::test]
async fn test_detached_server_survives_detach_and_can_be_attached() -> Result<()> {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = write_script(
        dir.path(),
        "server.sh",
        &format!("echo '{}'\nexec sleep 30", READY_LINE),
    );
    let options = test_options(dir.path(), script);
    let pid_file = PidFile::new(options.pid_file.clone());

    let mut config = launch_config();
    config.detached = true;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut process = ServerProcess::new(config, options.clone(), tx);
    process.start().await?;
    assert!(process.is_detached());

    // Output goes to a log file; the tailer replays it from the start
    let events = wait_for_state(&mut rx, ProcessState::Online).await;
    assert!(events.iter().any(|e| matches!(
        &e.kind,
        ServerEventKind::Log { stream: OutputStream::LogFile, .. }
    )));

    let pid = process.pid().expect("pid");
    let data = pid_file.read()?.expect("pid file written");
    assert_eq!(data.pid, pid);
    assert_eq!(data.detached, Some(true));
    assert!(data.log_file.as_ref().is_some_and(|path| path.starts_with(&options.log_dir)));

    process.detach()?;
    assert_eq!(process.state(), ProcessState::Offline);
    assert!(platform::is_process_running(pid));

    // A later invocation finds the server through the PID file
    let data = pid_file.read_running()?.expect("still running");
    let (tx, _rx) = mpsc::unbounded_channel();
    let mut attached = ServerProcess::attach(data, options, tx)?;
    assert_eq!(attached.state(), ProcessState::Online);
    assert_eq!(attached.pid(), Some(pid));
    assert_eq!(attached.config().world, "Midgard");

    attached.stop(Duration::from_secs(5)).await?;
    assert_eq!(attached.state(), ProcessState::Offline);
    assert!(pid_file.read()?.is_none());

    Ok(())
}

#[tokio::test]
async fn test_detach_requires_detached_mode() -> Result<()> {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = write_script(dir.path(), "server.sh", "exec sleep 30");
    let (tx, _rx) = mpsc::unbounded_channel();
    let mut process = ServerProcess::new(launch_config(), test_options(dir.path(), script), tx);

    process.start().await?;
    assert!(matches!(process.detach(), Err(Error::Process(_))));

    process.kill().await?;
    Ok(())
}

#[tokio::test]
async fn test_attach_to_dead_process_fails() {
    let dir = tempfile::tempdir().expect("tempdir");

    let mut child = std::process::Command::new("true").spawn().expect("spawn true");
    let pid = child.id();
    child.wait().expect("wait true");

    let data = PidFileData {
        pid,
        started_at: chrono::Utc::now(),
        world: "Midgard".to_string(),
        port: 2456,
        log_file: None,
        detached: Some(true),
        server_name: None,
    };

    let (tx, _rx) = mpsc::unbounded_channel();
    let result = ServerProcess::attach(data, test_options(dir.path(), dir.path().join("unused")), tx);
    assert!(matches!(result, Err(Error::NotRunning)));
}

#[tokio::test]
async fn test_attached_server_disappearing_is_a_crash() -> Result<()> {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut child = std::process::Command::new("sleep")
        .arg("30")
        .spawn()
        .expect("spawn sleep");

    let data = PidFileData {
        pid: child.id(),
        started_at: chrono::Utc::now(),
        world: "Midgard".to_string(),
        port: 2456,
        log_file: None,
        detached: Some(true),
        server_name: Some("Test Hall".to_string()),
    };

    let (tx, mut rx) = mpsc::unbounded_channel();
    let attached = ServerProcess::attach(data, test_options(dir.path(), dir.path().join("unused")), tx)?;

    // Killed behind the supervisor's back
    child.kill().expect("kill sleep");
    child.wait().expect("reap sleep");

    let events = wait_for_state(&mut rx, ProcessState::Crashed).await;
    assert!(events
        .iter()
        .any(|e| matches!(&e.kind, ServerEventKind::Error { message } if message.contains("no longer running"))));
    assert!(attached.wait_for_exit(Duration::from_secs(1)).await);

    Ok(())
}

#[tokio::test]
async fn test_unkillable_attached_server_still_goes_offline() -> Result<()> {
    // Needs a live process this user may not signal
    use std::os::unix::fs::MetadataExt;
    let euid = nix::unistd::geteuid();
    let owns_init = std::fs::metadata("/proc/1").is_ok_and(|m| m.uid() == euid.as_raw());
    if euid.is_root() || owns_init {
        return Ok(());
    }

    let dir = tempfile::tempdir().expect("tempdir");
    let options = test_options(dir.path(), dir.path().join("unused"));
    let pid_file = PidFile::new(options.pid_file.clone());
    let data = PidFileData {
        pid: 1,
        started_at: chrono::Utc::now(),
        world: "Midgard".to_string(),
        port: 2456,
        log_file: None,
        detached: Some(true),
        server_name: None,
    };
    pid_file.write(&data)?;

    let (tx, _rx) = mpsc::unbounded_channel();
    let mut attached = ServerProcess::attach(data.clone(), options.clone(), tx)?;
    let result = attached.stop(Duration::from_millis(200)).await;
    assert!(matches!(result, Err(Error::Process(_))));
    assert_eq!(attached.state(), ProcessState::Offline);
    assert_eq!(attached.pid(), None);
    // The process is still out there, so its record is kept
    assert!(pid_file.read()?.is_some());

    let (tx, _rx) = mpsc::unbounded_channel();
    let mut attached = ServerProcess::attach(data, options, tx)?;
    assert!(matches!(attached.kill().await, Err(Error::Process(_))));
    assert_eq!(attached.state(), ProcessState::Offline);

    Ok(())
}
