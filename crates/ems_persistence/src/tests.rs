use std::time::Duration;

use tempfile::TempDir;
use tokio::time::timeout;

use crate::backend::{BackendQueue, EphemeralQueue};
use crate::diskqueue::{DiskQueue, QueueOptions};
use crate::metadata::{self, ChannelMeta, Metadata, TopicMeta};

fn small_opts() -> QueueOptions {
    QueueOptions {
        max_bytes_per_file: 1024,
        min_msg_size: 0,
        max_msg_size: 64 * 1024,
        sync_every: 50,
        sync_timeout: Duration::from_millis(50),
    }
}

async fn recv_one(rx: &mut tokio::sync::mpsc::Receiver<Vec<u8>>) -> Vec<u8> {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for a record")
        .expect("read channel closed")
}

#[tokio::test]
async fn put_then_read_round_trips() {
    let dir = TempDir::new().unwrap();
    let q = DiskQueue::new("t", dir.path(), small_opts()).unwrap();
    let mut rx = q.take_reader().unwrap();

    q.put(b"hello".to_vec()).await.unwrap();
    assert_eq!(q.depth(), 1);

    let got = recv_one(&mut rx).await;
    assert_eq!(got, b"hello");

    // depth drops once the record is consumed
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(q.depth(), 0);
}

#[tokio::test]
async fn reader_can_only_be_taken_once() {
    let dir = TempDir::new().unwrap();
    let q = DiskQueue::new("t", dir.path(), small_opts()).unwrap();
    assert!(q.take_reader().is_some());
    assert!(q.take_reader().is_none());
}

#[tokio::test]
async fn order_preserved_across_segment_rolls() {
    let dir = TempDir::new().unwrap();
    // 1 KiB segments, 100-byte messages: forces several rolls
    let q = DiskQueue::new("t", dir.path(), small_opts()).unwrap();
    let mut rx = q.take_reader().unwrap();

    for i in 0..50u8 {
        q.put(vec![i; 100]).await.unwrap();
    }
    assert_eq!(q.depth(), 50);

    for i in 0..50u8 {
        let got = recv_one(&mut rx).await;
        assert_eq!(got, vec![i; 100]);
    }
}

#[tokio::test]
async fn depth_survives_restart() {
    let dir = TempDir::new().unwrap();
    {
        let q = DiskQueue::new("t", dir.path(), small_opts()).unwrap();
        for _ in 0..5 {
            q.put(b"persisted".to_vec()).await.unwrap();
        }
        q.close().await.unwrap();
    }

    let q = DiskQueue::new("t", dir.path(), small_opts()).unwrap();
    assert_eq!(q.depth(), 5);
    let mut rx = q.take_reader().unwrap();
    for _ in 0..5 {
        assert_eq!(recv_one(&mut rx).await, b"persisted");
    }
}

#[tokio::test]
async fn empty_discards_everything_and_removes_segments() {
    let dir = TempDir::new().unwrap();
    let q = DiskQueue::new("t", dir.path(), small_opts()).unwrap();
    for _ in 0..30 {
        q.put(vec![0u8; 100]).await.unwrap();
    }
    q.empty().await.unwrap();
    assert_eq!(q.depth(), 0);

    let segments: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.file_name()
                .to_string_lossy()
                .ends_with(".dat")
                && !e.file_name().to_string_lossy().contains("meta")
        })
        .collect();
    assert!(segments.is_empty(), "segments left behind: {segments:?}");

    // still usable afterwards
    q.put(b"after-empty".to_vec()).await.unwrap();
    let mut rx = q.take_reader().unwrap();
    assert_eq!(recv_one(&mut rx).await, b"after-empty");
}

#[tokio::test]
async fn rejects_oversized_put() {
    let dir = TempDir::new().unwrap();
    let mut opts = small_opts();
    opts.max_msg_size = 10;
    let q = DiskQueue::new("t", dir.path(), opts).unwrap();
    assert!(q.put(vec![0u8; 11]).await.is_err());
    assert_eq!(q.depth(), 0);
}

#[tokio::test]
async fn corrupt_record_is_skipped() {
    let dir = TempDir::new().unwrap();
    {
        let q = DiskQueue::new("t", dir.path(), small_opts()).unwrap();
        for i in 0..12u8 {
            q.put(vec![i; 100]).await.unwrap();
        }
        q.close().await.unwrap();
    }

    // clobber the length prefix of the first record in the first segment
    let seg0 = dir.path().join("t.diskqueue.000000.dat");
    let mut bytes = std::fs::read(&seg0).unwrap();
    bytes[0] = 0xff;
    bytes[1] = 0xff;
    std::fs::write(&seg0, bytes).unwrap();

    let q = DiskQueue::new("t", dir.path(), small_opts()).unwrap();
    let mut rx = q.take_reader().unwrap();
    // reader skips the poisoned segment and keeps serving later ones
    let got = recv_one(&mut rx).await;
    assert_eq!(got.len(), 100);
    assert!(got[0] > 0, "first segment should have been skipped");
}

#[tokio::test]
async fn delete_removes_metadata() {
    let dir = TempDir::new().unwrap();
    let q = DiskQueue::new("t", dir.path(), small_opts()).unwrap();
    q.put(b"x".to_vec()).await.unwrap();
    q.delete().await.unwrap();

    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .collect();
    assert!(leftovers.is_empty(), "files left behind: {leftovers:?}");
}

#[tokio::test]
async fn ephemeral_queue_drops_and_never_yields() {
    let q = EphemeralQueue::new();
    q.put(b"dropped".to_vec()).await.unwrap();
    assert_eq!(q.depth(), 0);

    let mut rx = q.take_reader().unwrap();
    let res = timeout(Duration::from_millis(100), rx.recv()).await;
    assert!(res.is_err(), "ephemeral reader must stay pending");
}

#[test]
fn metadata_round_trip() {
    let dir = TempDir::new().unwrap();
    let meta = Metadata {
        topics: vec![
            TopicMeta {
                name: "orders".into(),
                paused: false,
                channels: vec![
                    ChannelMeta {
                        name: "billing".into(),
                        paused: true,
                    },
                    ChannelMeta {
                        name: "audit".into(),
                        paused: false,
                    },
                ],
            },
            TopicMeta {
                name: "clicks".into(),
                paused: true,
                channels: vec![],
            },
        ],
    };

    metadata::persist(dir.path(), &meta).unwrap();
    let loaded = metadata::load(dir.path()).unwrap().unwrap();
    assert_eq!(loaded, meta);

    // no tmp files survive the rename
    let tmps: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
        .collect();
    assert!(tmps.is_empty());
}

#[test]
fn metadata_missing_is_none() {
    let dir = TempDir::new().unwrap();
    assert!(metadata::load(dir.path()).unwrap().is_none());
}
