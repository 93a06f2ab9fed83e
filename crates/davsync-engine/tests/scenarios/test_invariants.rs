//! Engine-wide invariants: convergence, journal consistency, retry
//! bounds, deletion ordering and cancellation.

use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use davsync_core::domain::RelativePath;
use davsync_core::events::RunStatus;
use davsync_core::ports::RemoteError;

use crate::common::{fixture, rel};

#[tokio::test]
async fn test_convergence_quiescent_inputs_produce_empty_plans() {
    let fx = fixture().await;
    fx.remote.add_file("a.txt", b"stable");
    fx.remote.add_file("d/b.txt", b"also stable");
    std::fs::write(fx.dir.path().join("up.txt"), b"local").unwrap();

    let first = fx
        .folder
        .sync_once(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(first.status, RunStatus::Success);
    assert!(first.items_total > 0);

    // nothing moved since: the next run must be a no-op
    let second = fx
        .folder
        .sync_once(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(second.status, RunStatus::Success);
    assert_eq!(second.items_total, 0);
    assert_eq!(second.bytes_transferred, 0);
}

#[tokio::test]
async fn test_journal_matches_remote_after_success() {
    let fx = fixture().await;
    fx.remote.add_file("d/x.bin", b"payload");
    std::fs::write(fx.dir.path().join("y.bin"), b"other payload").unwrap();

    fx.folder
        .sync_once(&CancellationToken::new())
        .await
        .unwrap();

    for path in ["d", "d/x.bin", "y.bin"] {
        let record = fx.journal.get(&rel(path)).await.unwrap().unwrap();
        let node = fx.remote.node(path).unwrap();
        assert_eq!(
            record.etag.as_ref().unwrap().as_str(),
            node.etag,
            "journal etag matches remote for {path}"
        );
        assert_eq!(
            record.file_id.as_ref().unwrap().as_str(),
            node.file_id,
            "journal file id matches remote for {path}"
        );
        if let Some(data) = &node.data {
            assert_eq!(record.size, data.len() as u64);
        }
    }
}

#[tokio::test]
async fn test_retry_bounds_for_transient_errors() {
    let fx = fixture().await;
    std::fs::write(fx.dir.path().join("flaky.txt"), b"data").unwrap();
    fx.remote.fail_put.lock().unwrap().insert(
        "flaky.txt".to_string(),
        RemoteError::Http {
            status: 503,
            message: "unavailable".to_string(),
        },
    );

    let summary = fx
        .folder
        .sync_once(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.status, RunStatus::Problem);
    assert_eq!(summary.items_failed, 1);
    // initial attempt plus one retry per configured delay, never more
    assert_eq!(fx.remote.put_attempts.load(Ordering::SeqCst), 3);
    // the failure landed on the error blacklist
    let entry = fx
        .journal
        .blacklist_entry(&rel("flaky.txt"))
        .await
        .unwrap()
        .unwrap();
    assert!(entry.error_string.contains("503"));
}

#[tokio::test]
async fn test_blacklisted_item_is_skipped_next_run() {
    let fx = fixture().await;
    std::fs::write(fx.dir.path().join("flaky.txt"), b"data").unwrap();
    fx.remote.fail_put.lock().unwrap().insert(
        "flaky.txt".to_string(),
        RemoteError::Http {
            status: 500,
            message: "boom".to_string(),
        },
    );

    fx.folder
        .sync_once(&CancellationToken::new())
        .await
        .unwrap();
    let attempts_after_first = fx.remote.put_attempts.load(Ordering::SeqCst);

    // the backoff window is still open: the next run must not retry
    fx.folder
        .sync_once(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(
        fx.remote.put_attempts.load(Ordering::SeqCst),
        attempts_after_first
    );
}

#[tokio::test]
async fn test_directory_delete_follows_descendants() {
    let fx = fixture().await;
    fx.remote.add_file("d/sub/x.txt", b"1");
    fx.remote.add_file("d/y.txt", b"2");

    fx.folder
        .sync_once(&CancellationToken::new())
        .await
        .unwrap();

    // the whole tree disappears locally
    std::fs::remove_dir_all(fx.dir.path().join("d")).unwrap();
    fx.remote.delete_order.lock().unwrap().clear();

    let summary = fx
        .folder
        .sync_once(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(summary.status, RunStatus::Success);

    let order = fx.remote.delete_order.lock().unwrap().clone();
    let pos = |p: &str| {
        order
            .iter()
            .position(|x| x == p)
            .unwrap_or_else(|| panic!("{p} was never deleted; order: {order:?}"))
    };
    // no directory DELETE before all of its descendants' DELETEs
    assert!(pos("d/sub/x.txt") < pos("d/sub"));
    assert!(pos("d/y.txt") < pos("d"));
    assert!(pos("d/sub") < pos("d"));

    assert!(fx.remote.node("d").is_none());
    assert!(fx.journal.get(&rel("d")).await.unwrap().is_none());
}

#[tokio::test]
async fn test_abort_terminates_promptly_and_keeps_journal_consistent() {
    let fx = fixture().await;
    for i in 0..20 {
        fx.remote.add_file(&format!("f{i:02}.bin"), b"payload");
    }

    let cancel = CancellationToken::new();
    cancel.cancel();

    let started = std::time::Instant::now();
    let summary = fx.folder.sync_once(&cancel).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(summary.status, RunStatus::Aborted);

    // every journal row that exists refers to consistent remote state
    let records = fx.journal.iterate(&RelativePath::root()).await.unwrap();
    for record in records {
        let node = fx.remote.node(record.path.as_str()).unwrap();
        assert_eq!(record.etag.unwrap().as_str(), node.etag);
    }
}

#[tokio::test]
async fn test_second_run_uploads_nothing_for_unchanged_files() {
    let fx = fixture().await;
    std::fs::write(fx.dir.path().join("stable.txt"), b"unchanged").unwrap();

    fx.folder
        .sync_once(&CancellationToken::new())
        .await
        .unwrap();
    let bytes_after_first = fx.remote.upload_bytes.load(Ordering::SeqCst);

    fx.folder
        .sync_once(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(
        fx.remote.upload_bytes.load(Ordering::SeqCst),
        bytes_after_first
    );
}
