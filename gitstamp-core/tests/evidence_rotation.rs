//! End-to-end exercise of the evidence log through a full
//! append/rotate/preserve/recreate cycle, plus the dangling-log recovery
//! path a crashed tick would leave behind.

use gitstamp_core::EvidenceLog;
use tempfile::tempdir;

fn log_at(dir: &std::path::Path) -> EvidenceLog {
    EvidenceLog::new(
        dir.join("hashes.work"),
        dir.join("hashes.log"),
        dir.join("hashes.stamp"),
    )
}

#[tokio::test]
async fn full_tick_cycle_moves_bytes_through_all_three_files() {
    let dir = tempdir().unwrap();
    let log = log_at(dir.path());

    log.append(&"a".repeat(40)).await.unwrap();
    log.append(&"b".repeat(40)).await.unwrap();

    {
        let _guard = log.lock().await;
        assert!(log.rotate_locked().unwrap().is_some());
        assert!(!log.working_path().exists());
        log.preserve_locked().unwrap();
        log.recreate_working_locked().unwrap();
    }

    let preserved = std::fs::read_to_string(log.preserved_path()).unwrap();
    assert_eq!(
        preserved,
        format!("{}\n{}\n", "a".repeat(40), "b".repeat(40))
    );
    assert!(log.working_path().exists());
    assert_eq!(std::fs::read_to_string(log.working_path()).unwrap(), "");
    assert!(!log.rotated_path().exists());
}

#[tokio::test]
async fn dangling_rotated_log_is_detected_before_a_new_rotation() {
    let dir = tempdir().unwrap();
    let log = log_at(dir.path());

    // Simulate a crash between rotate and preserve: the rotated file is
    // left behind with no working log.
    std::fs::write(log.rotated_path(), format!("{}\n", "c".repeat(40))).unwrap();

    let _guard = log.lock().await;
    let dangling = log.dangling_locked().unwrap();
    assert!(dangling.is_some());

    // A fresh append afterwards still rotates cleanly once the dangling
    // data has been dealt with and the rotated file is cleared.
    std::fs::remove_file(log.rotated_path()).unwrap();
    drop(_guard);

    log.append(&"d".repeat(40)).await.unwrap();
    let _guard = log.lock().await;
    assert!(log.rotate_locked().unwrap().is_some());
}

#[tokio::test]
async fn concurrent_appends_never_interleave_partial_lines() {
    let dir = tempdir().unwrap();
    let log = std::sync::Arc::new(log_at(dir.path()));

    let mut handles = Vec::new();
    for i in 0..20u32 {
        let log = log.clone();
        handles.push(tokio::spawn(async move {
            let commit = format!("{:040x}", i);
            log.append(&commit).await.unwrap();
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let contents = std::fs::read_to_string(log.working_path()).unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 20);
    for line in &lines {
        assert_eq!(line.len(), 40);
    }
}
