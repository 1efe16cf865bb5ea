use std::time::Duration;

use kinema_storage::{CacheFile, CacheFileOptions, FileStatus, StorageError, WaitOutcome};
use rstest::rstest;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

async fn open_file(dir: &TempDir, name: &str) -> CacheFile {
    let opts = CacheFileOptions::new(dir.path().join(name), CancellationToken::new());
    CacheFile::open(opts).await.unwrap()
}

#[rstest]
#[timeout(Duration::from_secs(5))]
#[tokio::test]
async fn write_then_read_roundtrip() {
    let dir = TempDir::new().unwrap();
    let file = open_file(&dir, "data.bin").await;

    file.write_at(0, b"hello world").await.unwrap();

    let bytes = file.read_at(0, 11).await.unwrap();
    assert_eq!(&bytes[..], b"hello world");

    let bytes = file.read_at(6, 5).await.unwrap();
    assert_eq!(&bytes[..], b"world");
}

#[rstest]
#[timeout(Duration::from_secs(5))]
#[tokio::test]
async fn read_uncached_fails_fast() {
    let dir = TempDir::new().unwrap();
    let file = open_file(&dir, "data.bin").await;

    let err = file.read_at(0, 10).await.unwrap_err();
    assert!(matches!(err, StorageError::NotCached { start: 0, end: 10 }));
}

#[rstest]
#[timeout(Duration::from_secs(5))]
#[tokio::test]
async fn read_across_gap_fails_fast() {
    let dir = TempDir::new().unwrap();
    let file = open_file(&dir, "data.bin").await;

    file.write_at(0, &[1u8; 100]).await.unwrap();
    file.write_at(200, &[2u8; 100]).await.unwrap();

    // [0,100) and [200,300) are covered, [100,200) is a hole.
    assert!(file.read_at(0, 100).await.is_ok());
    assert!(file.read_at(200, 100).await.is_ok());
    let err = file.read_at(50, 200).await.unwrap_err();
    assert!(matches!(err, StorageError::NotCached { .. }));
}

#[rstest]
#[timeout(Duration::from_secs(5))]
#[tokio::test]
async fn sealed_file_clamps_reads_and_rejects_writes() {
    let dir = TempDir::new().unwrap();
    let file = open_file(&dir, "data.bin").await;

    file.write_at(0, &[7u8; 50]).await.unwrap();
    file.seal(Some(50)).await.unwrap();

    // Read past EOF clamps.
    let bytes = file.read_at(40, 100).await.unwrap();
    assert_eq!(bytes.len(), 10);

    // Read at EOF yields empty.
    let bytes = file.read_at(50, 10).await.unwrap();
    assert!(bytes.is_empty());

    let err = file.write_at(50, b"more").await.unwrap_err();
    assert!(matches!(err, StorageError::Sealed));

    assert_eq!(
        file.status().await,
        FileStatus::Sealed {
            final_len: Some(50)
        }
    );
}

#[rstest]
#[timeout(Duration::from_secs(5))]
#[tokio::test]
async fn wait_range_resolves_when_bytes_land() {
    let dir = TempDir::new().unwrap();
    let file = open_file(&dir, "data.bin").await;

    let waiter = file.clone();
    let handle = tokio::spawn(async move { waiter.wait_range(0..64).await });

    tokio::time::sleep(Duration::from_millis(20)).await;
    file.write_at(0, &[0u8; 64]).await.unwrap();

    let outcome = handle.await.unwrap().unwrap();
    assert_eq!(outcome, WaitOutcome::Ready);
}

#[rstest]
#[timeout(Duration::from_secs(5))]
#[tokio::test]
async fn wait_range_past_eof_resolves_eof() {
    let dir = TempDir::new().unwrap();
    let file = open_file(&dir, "data.bin").await;

    file.write_at(0, &[0u8; 10]).await.unwrap();
    file.seal(Some(10)).await.unwrap();

    let outcome = file.wait_range(10..20).await.unwrap();
    assert_eq!(outcome, WaitOutcome::Eof);

    // Range straddling EOF only needs the pre-EOF part.
    let outcome = file.wait_range(5..20).await.unwrap();
    assert_eq!(outcome, WaitOutcome::Ready);
}

#[rstest]
#[timeout(Duration::from_secs(5))]
#[tokio::test]
async fn wait_range_cancelled_by_token() {
    let dir = TempDir::new().unwrap();
    let cancel = CancellationToken::new();
    let opts = CacheFileOptions::new(dir.path().join("data.bin"), cancel.clone());
    let file = CacheFile::open(opts).await.unwrap();

    let waiter = file.clone();
    let handle = tokio::spawn(async move { waiter.wait_range(0..100).await });

    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();

    let err = handle.await.unwrap().unwrap_err();
    assert!(matches!(err, StorageError::Cancelled));
}

#[rstest]
#[timeout(Duration::from_secs(5))]
#[tokio::test]
async fn fail_wakes_waiters_and_poisons_reads() {
    let dir = TempDir::new().unwrap();
    let file = open_file(&dir, "data.bin").await;

    let waiter = file.clone();
    let handle = tokio::spawn(async move { waiter.wait_range(0..100).await });

    tokio::time::sleep(Duration::from_millis(20)).await;
    file.fail("network gone").await;

    assert!(matches!(
        handle.await.unwrap().unwrap_err(),
        StorageError::Failed(_)
    ));
    assert!(matches!(
        file.read_at(0, 1).await.unwrap_err(),
        StorageError::Failed(_)
    ));
}

#[rstest]
#[timeout(Duration::from_secs(5))]
#[tokio::test]
async fn restore_publishes_existing_coverage() {
    let dir = TempDir::new().unwrap();

    // First instance writes bytes to disk.
    {
        let file = open_file(&dir, "data.bin").await;
        file.write_at(0, &[9u8; 500]).await.unwrap();
    }

    // Fresh instance knows nothing until coverage is restored.
    let file = open_file(&dir, "data.bin").await;
    assert!(matches!(
        file.read_at(0, 500).await.unwrap_err(),
        StorageError::NotCached { .. }
    ));

    file.restore(&[0..500]).await;
    let bytes = file.read_at(0, 500).await.unwrap();
    assert_eq!(bytes.len(), 500);
    assert!(bytes.iter().all(|&b| b == 9));
}

#[rstest]
#[timeout(Duration::from_secs(5))]
#[tokio::test]
async fn coverage_snapshot_reports_merged_ranges() {
    let dir = TempDir::new().unwrap();
    let file = open_file(&dir, "data.bin").await;

    file.write_at(0, &[1u8; 10]).await.unwrap();
    file.write_at(10, &[1u8; 10]).await.unwrap();
    file.write_at(40, &[1u8; 10]).await.unwrap();

    assert_eq!(file.covered().await, vec![0..20, 40..50]);
    assert!(file.is_covered(0..20).await);
    assert!(!file.is_covered(0..30).await);
}
