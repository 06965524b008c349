use assert_fs::TempDir;
use assert_fs::prelude::*;
use chrono::Utc;
use predicates::prelude::*;
use std::path::PathBuf;
use valheim_runner::error::{Error, Result};
use valheim_runner::server::{PidFile, PidFileData};

fn record(pid: u32) -> PidFileData {
    PidFileData {
        pid,
        started_at: Utc::now(),
        world: "Midgard".to_string(),
        port: 2456,
        log_file: Some(PathBuf::from("/var/log/valheim/valheim-2024-02-19_13-37-01.log")),
        detached: Some(true),
        server_name: Some("Viking Hall".to_string()),
    }
}

#[test]
fn test_write_then_read() -> Result<()> {
    let dir = tempfile::tempdir().expect("tempdir");
    let pid_file = PidFile::new(dir.path().join("nested").join("valheim.pid"));

    let data = record(std::process::id());
    pid_file.write(&data)?;

    assert_eq!(pid_file.read()?, Some(data.clone()));
    // The supervising test process is certainly alive
    assert_eq!(pid_file.read_running()?, Some(data));
    Ok(())
}

#[test]
fn test_missing_file_reads_as_none() -> Result<()> {
    let dir = tempfile::tempdir().expect("tempdir");
    let pid_file = PidFile::new(dir.path().join("valheim.pid"));

    assert_eq!(pid_file.read()?, None);
    assert_eq!(pid_file.read_running()?, None);
    // Removing a missing file is fine
    pid_file.remove()?;
    Ok(())
}

#[test]
fn test_older_records_without_optional_fields() -> Result<()> {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("valheim.pid");
    std::fs::write(
        &path,
        r#"{"pid": 4242, "startedAt": "2024-02-19T13:37:01Z", "world": "Midgard", "port": 2456}"#,
    )
    .expect("write");

    let data = PidFile::new(&path).read()?.expect("record");
    assert_eq!(data.pid, 4242);
    assert_eq!(data.log_file, None);
    assert_eq!(data.detached, None);
    assert_eq!(data.server_name, None);
    Ok(())
}

#[test]
fn test_stale_record_is_removed() -> Result<()> {
    let temp = TempDir::new().expect("tempdir");
    let child_file = temp.child("valheim.pid");
    let pid_file = PidFile::new(child_file.path());

    let mut child = std::process::Command::new(if cfg!(windows) { "cmd" } else { "true" })
        .args(if cfg!(windows) { vec!["/C", "exit"] } else { vec![] })
        .spawn()
        .expect("spawn");
    let pid = child.id();
    child.wait().expect("wait");

    pid_file.write(&record(pid))?;
    child_file.assert(predicate::str::contains("\"world\": \"Midgard\""));

    assert_eq!(pid_file.read_running()?, None);
    child_file.assert(predicate::path::missing());
    Ok(())
}

#[test]
fn test_corrupt_record() -> Result<()> {
    let temp = TempDir::new().expect("tempdir");
    let child_file = temp.child("valheim.pid");
    child_file.write_str("not json").expect("write");
    let pid_file = PidFile::new(child_file.path());

    assert!(matches!(pid_file.read(), Err(Error::PidFile(_))));

    // Liveness checks treat it as stale
    assert_eq!(pid_file.read_running()?, None);
    child_file.assert(predicate::path::missing());
    Ok(())
}
