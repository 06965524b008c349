use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;
use valheim_runner::server::{LogTailer, TailFrom};

const INTERVAL: Duration = Duration::from_millis(20);

fn append(path: &Path, text: &str) {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .expect("open log");
    file.write_all(text.as_bytes()).expect("append");
}

fn start(path: &Path, from: TailFrom) -> (LogTailer, mpsc::UnboundedReceiver<String>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let tailer = LogTailer::start(path, INTERVAL, from, move |line| {
        let _ = tx.send(line);
    });
    (tailer, rx)
}

async fn next_line(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a line")
        .expect("tailer stopped")
}

#[tokio::test]
async fn test_end_skips_existing_content() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("server.log");
    append(&path, "before attach\n");

    let (_tailer, mut rx) = start(&path, TailFrom::End);
    tokio::time::sleep(INTERVAL * 3).await;

    append(&path, "Game server connected\n");
    assert_eq!(next_line(&mut rx).await, "Game server connected");
}

#[tokio::test]
async fn test_start_replays_and_joins_partial_lines() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("server.log");
    append(&path, "first\nsecond half");

    let (_tailer, mut rx) = start(&path, TailFrom::Start);
    assert_eq!(next_line(&mut rx).await, "first");

    // The unterminated tail is held until its newline arrives
    tokio::time::sleep(INTERVAL * 3).await;
    assert!(rx.try_recv().is_err());

    append(&path, " done\n");
    assert_eq!(next_line(&mut rx).await, "second half done");
}

#[tokio::test]
async fn test_waits_for_missing_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("later.log");

    let (tailer, mut rx) = start(&path, TailFrom::Start);
    tokio::time::sleep(INTERVAL * 3).await;
    assert!(tailer.is_running());

    append(&path, "created\n");
    assert_eq!(next_line(&mut rx).await, "created");
}

#[tokio::test]
async fn test_truncated_file_is_reread() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("server.log");
    append(&path, "a fairly long line from the previous run\n");

    let (_tailer, mut rx) = start(&path, TailFrom::Start);
    assert_eq!(
        next_line(&mut rx).await,
        "a fairly long line from the previous run"
    );

    std::fs::write(&path, "fresh\n").expect("truncate");
    assert_eq!(next_line(&mut rx).await, "fresh");
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("server.log");

    let (mut tailer, _rx) = start(&path, TailFrom::End);
    assert_eq!(tailer.path(), path.as_path());

    tailer.stop();
    tailer.stop();
    assert!(!tailer.is_running());
}
