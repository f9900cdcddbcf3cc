//! End-to-end transfer scenarios between two nodes on loopback.

mod common;

use common::{link, start_node, test_config, wait_until};
use landrop::{Config, TransferStatus};
use std::time::Duration;

fn write_source(dir: &tempfile::TempDir, name: &str, content: &[u8]) -> std::path::PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, content).unwrap();
    path
}

fn downloads_entries(dir: &tempfile::TempDir) -> Vec<std::path::PathBuf> {
    std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect()
}

#[tokio::test]
async fn accepted_transfer_delivers_identical_file() {
    let a = start_node(test_config()).await;
    let b = start_node(test_config()).await;
    let downloads = tempfile::tempdir().unwrap();
    b.set_download_dir(downloads.path());
    link(&a, &b).await;

    let source_dir = tempfile::tempdir().unwrap();
    let source = write_source(&source_dir, "hello.txt", b"hi");

    let transfer_id = a.send_file(b.peer_id(), &source).await.unwrap();

    wait_until(Duration::from_secs(10), "both sides completed", || async {
        let a_done = a.get_transfer(&transfer_id).map(|t| t.status) == Some(TransferStatus::Completed);
        let b_done = b.get_transfer(&transfer_id).map(|t| t.status) == Some(TransferStatus::Completed);
        a_done && b_done
    })
    .await;

    let delivered = downloads.path().join("hello.txt");
    assert_eq!(std::fs::read(&delivered).unwrap(), b"hi");
    assert!(!downloads.path().join("hello.txt.part").exists());

    let record = b.get_transfer(&transfer_id).unwrap();
    assert_eq!(record.file_size, 2);
    assert_eq!(record.bytes_transferred, 2);
    assert!(record.end_time >= record.start_time);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn rejected_transfer_cancels_both_sides_without_a_file() {
    let a = start_node(test_config()).await;
    let b = start_node(test_config()).await;
    let downloads = tempfile::tempdir().unwrap();
    b.set_download_dir(downloads.path());
    b.on_request(|_| false);
    link(&a, &b).await;

    let source_dir = tempfile::tempdir().unwrap();
    let source = write_source(&source_dir, "hello.txt", b"hi");

    let transfer_id = a.send_file(b.peer_id(), &source).await.unwrap();

    wait_until(Duration::from_secs(10), "both sides canceled", || async {
        let a_state = a.get_transfer(&transfer_id).map(|t| t.status);
        let b_state = b.get_transfer(&transfer_id).map(|t| t.status);
        a_state == Some(TransferStatus::Canceled) && b_state == Some(TransferStatus::Canceled)
    })
    .await;

    let record = a.get_transfer(&transfer_id).unwrap();
    assert_eq!(record.error_message, "Transfer rejected by recipient");
    assert!(downloads_entries(&downloads).is_empty());

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn cancel_mid_transfer_stops_both_sides_quickly() {
    // Small chunks so the 5 MiB body takes many chunk boundaries.
    let sender_config = Config {
        chunk_size: 64 * 1024,
        chunk_pause: Duration::from_millis(20),
        ..test_config()
    };
    let a = start_node(sender_config).await;
    let b = start_node(test_config()).await;
    let downloads = tempfile::tempdir().unwrap();
    b.set_download_dir(downloads.path());
    link(&a, &b).await;

    let source_dir = tempfile::tempdir().unwrap();
    let body: Vec<u8> = (0..5 * 1024 * 1024u32).map(|i| (i % 239) as u8).collect();
    let source = write_source(&source_dir, "big.bin", &body);

    let transfer_id = a.send_file(b.peer_id(), &source).await.unwrap();

    wait_until(Duration::from_secs(10), "2 MiB of progress", || async {
        a.get_transfer(&transfer_id)
            .map(|t| t.bytes_transferred >= 2 * 1024 * 1024)
            .unwrap_or(false)
    })
    .await;

    assert!(a.cancel_transfer(&transfer_id).await);
    // Idempotent.
    assert!(!a.cancel_transfer(&transfer_id).await);

    wait_until(Duration::from_secs(5), "both sides canceled", || async {
        let a_state = a.get_transfer(&transfer_id).map(|t| t.status);
        let b_state = b.get_transfer(&transfer_id).map(|t| t.status);
        a_state == Some(TransferStatus::Canceled) && b_state == Some(TransferStatus::Canceled)
    })
    .await;

    // The receiver buffered in memory; nothing partial reached the disk.
    assert!(downloads_entries(&downloads).is_empty());

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn encrypted_transfer_round_trips() {
    let a = start_node(test_config()).await;
    let b = start_node(test_config()).await;
    let downloads = tempfile::tempdir().unwrap();
    b.set_download_dir(downloads.path());
    link(&a, &b).await;

    a.set_encryption_enabled(true);
    a.set_encryption_password("s3cret");
    b.set_encryption_enabled(true);
    b.set_encryption_password("s3cret");

    let source_dir = tempfile::tempdir().unwrap();
    let body: Vec<u8> = (0..100 * 1024u32).map(|i| (i.wrapping_mul(2654435761) >> 24) as u8).collect();
    let source = write_source(&source_dir, "secret.bin", &body);

    let transfer_id = a.send_file(b.peer_id(), &source).await.unwrap();

    wait_until(Duration::from_secs(10), "both sides completed", || async {
        let a_done = a.get_transfer(&transfer_id).map(|t| t.status) == Some(TransferStatus::Completed);
        let b_done = b.get_transfer(&transfer_id).map(|t| t.status) == Some(TransferStatus::Completed);
        a_done && b_done
    })
    .await;

    assert_eq!(std::fs::read(downloads.path().join("secret.bin")).unwrap(), body);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn wrong_password_fails_receiver_and_cancels_sender() {
    let a = start_node(test_config()).await;
    let b = start_node(test_config()).await;
    let downloads = tempfile::tempdir().unwrap();
    b.set_download_dir(downloads.path());
    link(&a, &b).await;

    a.set_encryption_enabled(true);
    a.set_encryption_password("s3cret");
    b.set_encryption_enabled(true);
    b.set_encryption_password("other");

    let source_dir = tempfile::tempdir().unwrap();
    let source = write_source(&source_dir, "secret.bin", &vec![7u8; 64 * 1024]);

    let transfer_id = a.send_file(b.peer_id(), &source).await.unwrap();

    wait_until(
        Duration::from_secs(10),
        "receiver failed, sender canceled",
        || async {
            let b_failed = b.get_transfer(&transfer_id).map(|t| t.status) == Some(TransferStatus::Failed);
            let a_canceled =
                a.get_transfer(&transfer_id).map(|t| t.status) == Some(TransferStatus::Canceled);
            b_failed && a_canceled
        },
    )
    .await;

    let record = b.get_transfer(&transfer_id).unwrap();
    assert!(
        record.error_message.contains("decryption failed"),
        "unexpected error: {}",
        record.error_message
    );
    assert!(downloads_entries(&downloads).is_empty());

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn zero_byte_file_transfers_and_lands_empty() {
    let a = start_node(test_config()).await;
    let b = start_node(test_config()).await;
    let downloads = tempfile::tempdir().unwrap();
    b.set_download_dir(downloads.path());
    link(&a, &b).await;

    let source_dir = tempfile::tempdir().unwrap();
    let source = write_source(&source_dir, "empty.bin", b"");

    let transfer_id = a.send_file(b.peer_id(), &source).await.unwrap();

    wait_until(Duration::from_secs(10), "both sides completed", || async {
        let a_done = a.get_transfer(&transfer_id).map(|t| t.status) == Some(TransferStatus::Completed);
        let b_done = b.get_transfer(&transfer_id).map(|t| t.status) == Some(TransferStatus::Completed);
        a_done && b_done
    })
    .await;

    let delivered = downloads.path().join("empty.bin");
    assert_eq!(std::fs::read(&delivered).unwrap(), b"");
    let record = b.get_transfer(&transfer_id).unwrap();
    assert!((record.progress_pct - 100.0).abs() < f32::EPSILON);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn colliding_file_names_get_numbered() {
    let a = start_node(test_config()).await;
    let b = start_node(test_config()).await;
    let downloads = tempfile::tempdir().unwrap();
    b.set_download_dir(downloads.path());
    std::fs::write(downloads.path().join("hello.txt"), b"already here").unwrap();
    link(&a, &b).await;

    let source_dir = tempfile::tempdir().unwrap();
    let source = write_source(&source_dir, "hello.txt", b"new content");

    let transfer_id = a.send_file(b.peer_id(), &source).await.unwrap();

    wait_until(Duration::from_secs(10), "receiver completed", || async {
        b.get_transfer(&transfer_id).map(|t| t.status) == Some(TransferStatus::Completed)
    })
    .await;

    assert_eq!(
        std::fs::read(downloads.path().join("hello.txt")).unwrap(),
        b"already here"
    );
    assert_eq!(
        std::fs::read(downloads.path().join("hello_1.txt")).unwrap(),
        b"new content"
    );

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn sending_to_unknown_peer_fails_fast() {
    let a = start_node(test_config()).await;

    let source_dir = tempfile::tempdir().unwrap();
    let source = write_source(&source_dir, "hello.txt", b"hi");

    let err = a.send_file("no-such-peer", &source).await.unwrap_err();
    assert!(err.to_string().contains("unknown peer"), "{err}");
    assert!(a.list_transfers().is_empty());

    let err = a.send_file("no-such-peer", "/no/such/file").await.unwrap_err();
    assert!(err.to_string().contains("file not found"), "{err}");

    a.shutdown().await;
}
