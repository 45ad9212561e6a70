#![cfg(unix)]

use std::{os::unix::fs::PermissionsExt, path::Path, sync::Arc, time::Duration};

use scanwarden::{
    cache::ResultCache,
    command::ScanRequest,
    db::{Database, FindingFilter},
    executor::{ExecutorConfig, JobExecutor},
    models::{FindingStatus, JobStatus},
    runner::TokioProcessRunner,
};

const FIXTURE: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/fixtures/nuclei_results.json");

/// A stand-in scanner: copies the fixture to the `-output` path, or hangs
/// when the target mentions `slow`.
fn write_fake_scanner(dir: &Path) -> String {
    let path = dir.join("fake-nuclei");
    let script = format!(
        r#"#!/bin/sh
out=""
target=""
while [ $# -gt 0 ]; do
  case "$1" in
    -output) out="$2"; shift ;;
    -target) target="$2"; shift ;;
  esac
  shift
done
echo "[INF] scanning $target"
case "$target" in
  *slow*) exec sleep 30 ;;
esac
cp "{FIXTURE}" "$out"
echo "[INF] done"
"#
    );
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.to_string_lossy().into_owned()
}

async fn executor(dir: &Path) -> JobExecutor {
    let scanner = write_fake_scanner(dir);
    let db = Database::in_memory().await.unwrap();
    JobExecutor::new(
        db,
        Arc::new(TokioProcessRunner::new(vec![scanner.clone()])),
        Arc::new(ResultCache::default()),
        ExecutorConfig {
            scans_dir: dir.join("scans"),
            nuclei_bin: scanner,
            // freshly written scripts can briefly report "text file busy"
            spawn_retries: 3,
            ..ExecutorConfig::default()
        },
    )
}

#[tokio::test]
async fn repeated_scans_update_instead_of_duplicating() {
    let dir = tempfile::tempdir().unwrap();
    let executor = executor(dir.path()).await;
    executor.db().add_target("app.example.com").await.unwrap();

    let first = executor.run_scan(ScanRequest::new("app.example.com")).await.unwrap();
    assert_eq!(first.status, JobStatus::Completed);
    assert_eq!(first.report.inserted, 3);
    assert_eq!(first.new_findings.len(), 3);

    let log = std::fs::read_to_string(executor.log_path(&first.job_id)).unwrap();
    assert!(log.contains("[INF] scanning app.example.com"));
    assert!(log.contains("[INF] done"));

    let second = executor.run_scan(ScanRequest::new("app.example.com")).await.unwrap();
    assert_eq!(second.report.inserted, 0);
    assert_eq!(second.report.updated, 3);
    assert!(second.new_findings.is_empty());

    let findings = executor.db().list_findings(&FindingFilter::default()).await.unwrap();
    assert_eq!(findings.len(), 3);
    assert!(findings.iter().all(|f| f.status == FindingStatus::New));

    let target = executor.db().target_by_address("app.example.com").await.unwrap().unwrap();
    assert!(target.last_scan_date.is_some());
}

#[tokio::test]
async fn stopping_a_hung_scan_kills_it() {
    let dir = tempfile::tempdir().unwrap();
    let executor = executor(dir.path()).await;

    let job_id = executor.spawn_scan(ScanRequest::new("slow.example.com")).await.unwrap();
    // wait for the process to be launched
    let log_path = executor.log_path(&job_id);
    for _ in 0..100 {
        let log = tokio::fs::read_to_string(&log_path).await.unwrap_or_default();
        if log.contains("[INF] scanning") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(executor.stop(&job_id).await.unwrap(), JobStatus::Stopped);
    for _ in 0..100 {
        if !executor.is_running(&job_id) && executor.active_targets().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!executor.is_running(&job_id));
    assert!(executor.active_targets().is_empty());

    let job = executor.db().job(&job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Stopped);
    assert_eq!(executor.stop(&job_id).await.unwrap(), JobStatus::Stopped);
}
