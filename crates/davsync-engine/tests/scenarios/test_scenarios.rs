//! The end-to-end scenarios: first sync, uploads, conflicts, renames,
//! chunked resume and selective sync.

use std::sync::atomic::Ordering;

use tokio_util::sync::CancellationToken;

use davsync_core::config::Config;
use davsync_core::domain::{ItemKind, JournalRecord, RelativePath};
use davsync_core::events::RunStatus;
use davsync_journal::SelectiveSyncList;

use crate::common::{fixture, fixture_with, rel};

#[tokio::test]
async fn test_s1_first_sync_with_remote_tree() {
    let fx = fixture().await;
    fx.remote.add_file("a.txt", b"ten bytes.");
    fx.remote.add_file("d/b.txt", b"twenty bytes exactly");

    let summary = fx
        .folder
        .sync_once(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.status, RunStatus::Success);
    assert_eq!(summary.items_completed, 3); // mkdir d, two downloads

    assert_eq!(
        std::fs::read(fx.dir.path().join("a.txt")).unwrap(),
        b"ten bytes."
    );
    assert_eq!(
        std::fs::read(fx.dir.path().join("d/b.txt")).unwrap(),
        b"twenty bytes exactly"
    );

    let records = fx.journal.iterate(&RelativePath::root()).await.unwrap();
    assert_eq!(records.len(), 3);
    let file = records.iter().find(|r| r.path.as_str() == "a.txt").unwrap();
    assert!(file.etag.is_some());
    assert!(file.file_id.is_some());
}

#[tokio::test]
async fn test_s2_pure_upload() {
    let fx = fixture().await;
    std::fs::write(fx.dir.path().join("x"), b"five!").unwrap();

    let summary = fx
        .folder
        .sync_once(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.status, RunStatus::Success);
    assert_eq!(fx.remote.file_content("x").unwrap(), b"five!");
    assert_eq!(fx.remote.put_attempts.load(Ordering::SeqCst), 1);

    // the new etag landed in the journal
    let record = fx.journal.get(&rel("x")).await.unwrap().unwrap();
    let remote_node = fx.remote.node("x").unwrap();
    assert_eq!(record.etag.unwrap().as_str(), remote_node.etag);
}

#[tokio::test]
async fn test_s3_conflict_keeps_both_versions() {
    let fx = fixture().await;

    // a reconciled baseline for /f on all three sides
    let (etag, file_id) = fx.remote.add_file("f", b"A");
    std::fs::write(fx.dir.path().join("f"), b"A").unwrap();
    let meta = std::fs::metadata(fx.dir.path().join("f")).unwrap();
    let mut record = JournalRecord::new(rel("f"), ItemKind::File);
    record.size = 1;
    record.mtime = meta.modified().ok().map(chrono::DateTime::from);
    record.etag = Some(davsync_core::domain::Etag::new(&etag).unwrap());
    record.file_id = Some(davsync_core::domain::FileId::new(file_id).unwrap());
    record.inode = file_inode(&meta);
    fx.journal.put(&record).await.unwrap();

    // both sides diverge while offline
    std::thread::sleep(std::time::Duration::from_millis(1100));
    std::fs::write(fx.dir.path().join("f"), b"local-change").unwrap();
    fx.remote.add_file("f", b"server-change");

    // the run downloads the server version and preserves the local copy;
    // the follow-up uploads the conflict file
    let summary = fx
        .folder
        .sync_once(&CancellationToken::new())
        .await
        .unwrap();
    assert!(summary.another_sync_needed);
    assert_eq!(
        std::fs::read(fx.dir.path().join("f")).unwrap(),
        b"server-change"
    );

    let conflict_name = std::fs::read_dir(fx.dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().into_string().unwrap())
        .find(|n| n.contains("(conflicted copy"))
        .expect("conflict copy must exist locally");
    assert_eq!(
        std::fs::read(fx.dir.path().join(&conflict_name)).unwrap(),
        b"local-change"
    );
    // the conflict link is recorded
    assert_eq!(
        fx.journal
            .conflict_base(&rel(&conflict_name))
            .await
            .unwrap(),
        Some(rel("f"))
    );

    let follow_up = fx
        .folder
        .sync_once(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(follow_up.status, RunStatus::Success);

    // both files now exist on both sides
    assert_eq!(fx.remote.file_content("f").unwrap(), b"server-change");
    assert_eq!(
        fx.remote.file_content(&conflict_name).unwrap(),
        b"local-change"
    );
}

#[tokio::test]
async fn test_s4_rename_detection_moves_without_reupload() {
    let fx = fixture().await;

    // reconciled file old.bin; then the user renames it locally
    let (etag, file_id) = fx.remote.add_file("old.bin", b"large payload stands in");
    std::fs::write(fx.dir.path().join("new.bin"), b"large payload stands in").unwrap();
    let meta = std::fs::metadata(fx.dir.path().join("new.bin")).unwrap();
    let mut record = JournalRecord::new(rel("old.bin"), ItemKind::File);
    record.size = meta.len();
    record.mtime = meta.modified().ok().map(chrono::DateTime::from);
    record.etag = Some(davsync_core::domain::Etag::new(&etag).unwrap());
    record.file_id = Some(davsync_core::domain::FileId::new(&file_id).unwrap());
    record.inode = file_inode(&meta);
    fx.journal.put(&record).await.unwrap();

    let summary = fx
        .folder
        .sync_once(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.status, RunStatus::Success);
    assert_eq!(
        *fx.remote.moves.lock().unwrap(),
        vec![("old.bin".to_string(), "new.bin".to_string())]
    );
    // zero bytes travelled
    assert_eq!(fx.remote.upload_bytes.load(Ordering::SeqCst), 0);
    assert_eq!(fx.remote.put_attempts.load(Ordering::SeqCst), 0);

    // the journal followed the rename and kept the file id
    assert!(fx.journal.get(&rel("old.bin")).await.unwrap().is_none());
    let moved = fx.journal.get(&rel("new.bin")).await.unwrap().unwrap();
    assert_eq!(moved.file_id.unwrap().as_str(), file_id);
}

#[tokio::test]
async fn test_s5_chunked_upload_resumes_after_interruption() {
    let mut config = Config::default();
    config.propagator.retry_delays_ms = vec![1];
    config.chunks.chunk_threshold_bytes = 64;
    config.chunks.initial_chunk_size_bytes = 50;
    config.chunks.min_chunk_size_bytes = 50;
    config.chunks.max_chunk_size_bytes = 50;
    let fx = fixture_with(config).await;

    // 200 bytes in four 50-byte chunks
    let payload: Vec<u8> = (0..200u32).map(|i| (i % 251) as u8).collect();
    std::fs::write(fx.dir.path().join("big.bin"), &payload).unwrap();

    // the server accepts three chunks, then the connection dies
    *fx.remote.fail_chunks_after.lock().unwrap() = Some(3);
    let summary = fx
        .folder
        .sync_once(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(summary.status, RunStatus::Problem);
    assert_eq!(fx.remote.chunk_uploads.load(Ordering::SeqCst), 3);
    // resumption metadata survived the failure
    assert!(fx.journal.upload_info(&rel("big.bin")).await.unwrap().is_some());

    // next run: only the missing chunk is transmitted
    *fx.remote.fail_chunks_after.lock().unwrap() = None;
    fx.journal.clear_blacklist(&rel("big.bin")).await.unwrap();
    let summary = fx
        .folder
        .sync_once(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.status, RunStatus::Success);
    assert_eq!(fx.remote.chunk_uploads.load(Ordering::SeqCst), 4);
    assert_eq!(fx.remote.upload_bytes.load(Ordering::SeqCst), 200);
    assert_eq!(fx.remote.file_content("big.bin").unwrap(), payload);
    assert!(fx.journal.upload_info(&rel("big.bin")).await.unwrap().is_none());
}

#[tokio::test]
async fn test_s6_selective_sync_exclusion() {
    let fx = fixture().await;
    fx.journal
        .add_to_selective_sync(SelectiveSyncList::Blacklist, &rel("big"))
        .await
        .unwrap();
    fx.remote.add_file("big/huge.bin", b"do not want");
    fx.remote.add_file("small.txt", b"want");

    let summary = fx
        .folder
        .sync_once(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.status, RunStatus::Success);
    assert!(fx.dir.path().join("small.txt").exists());
    assert!(!fx.dir.path().join("big").exists());
    assert!(fx.journal.get(&rel("big/huge.bin")).await.unwrap().is_none());
}

#[cfg(unix)]
fn file_inode(meta: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.ino()
}

#[cfg(not(unix))]
fn file_inode(_meta: &std::fs::Metadata) -> u64 {
    0
}
