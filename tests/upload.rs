mod common;

use common::{context, pool, FakeNet};
use dcxfer::config::NetworkConfig;
use dcxfer::error::XferError;
use dcxfer::progress::{NoopProgress, Progress};
use dcxfer::rpc::Peer;
use dcxfer::transfer::{ItemOutcome, TransferItem};
use dcxfer::{FileIter, ItemOptions, Uploader};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const KIB: u64 = 1024;

fn write_file(dir: &Path, name: &str, size: u64) -> PathBuf {
    let path = dir.join(name);
    let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
    std::fs::write(&path, data).unwrap();
    path
}

fn me() -> Peer {
    Peer {
        id: 7,
        name: "self".into(),
    }
}

/// 记录同时进行的文件数
#[derive(Default)]
struct ActiveItems {
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl Progress for ActiveItems {
    fn on_add(&self, _item: &TransferItem) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn on_progress(&self, _item: &TransferItem, _transferred: u64, _total: u64) {}

    fn on_done(&self, _item: &TransferItem, _result: &Result<ItemOutcome, XferError>) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_three_files_scenario() {
    let dir = TempDir::new().unwrap();
    let files = vec![
        write_file(dir.path(), "a.bin", 600 * KIB),
        write_file(dir.path(), "b.bin", 10 * KIB),
        write_file(dir.path(), "c.bin", 1024 * KIB),
    ];

    let net = FakeNet::new();
    net.set_delay(Duration::from_millis(5));
    let ctx = context(&net, NetworkConfig::default());
    let pool = pool(&ctx, 8).await;
    let progress = Arc::new(ActiveItems::default());

    let uploader = Uploader::new(pool.clone(), progress.clone(), 2);
    let mut iter = FileIter::new(files, me(), 512 * KIB, ItemOptions::default());
    let summary = uploader
        .upload(&mut iter, &CancellationToken::new(), 2)
        .await
        .unwrap();

    assert_eq!(summary.total, 3);
    assert_eq!(summary.succeeded, 3);
    assert!(summary.is_success());
    assert!(progress.peak.load(Ordering::SeqCst) <= 2);

    let mut sent = net.sent.lock().clone();
    sent.sort();
    assert_eq!(
        sent,
        vec![("a.bin".to_string(), 2), ("b.bin".to_string(), 1), ("c.bin".to_string(), 2)]
    );
    // 每个分片恰好写入一次
    assert_eq!(net.saved.len(), 5);
    assert!(net.saved.iter().all(|e| *e.value() == 1));
    assert!(net.peak() <= 4);

    pool.close().await.unwrap();
}

#[tokio::test]
async fn test_in_flight_parts_bounded() {
    for (limit, threads) in [(1usize, 1usize), (2, 3), (3, 2)] {
        let dir = TempDir::new().unwrap();
        let files: Vec<_> = (0..4)
            .map(|i| write_file(dir.path(), &format!("f{}.bin", i), 8 * KIB))
            .collect();

        let net = FakeNet::new();
        net.set_delay(Duration::from_millis(3));
        let ctx = context(&net, NetworkConfig::default());
        let pool = pool(&ctx, 0).await;

        let uploader = Uploader::new(pool, Arc::new(NoopProgress), threads);
        let mut iter = FileIter::new(files, me(), KIB, ItemOptions::default());
        let summary = uploader
            .upload(&mut iter, &CancellationToken::new(), limit)
            .await
            .unwrap();

        assert!(summary.is_success());
        assert_eq!(net.saved.len(), 32);
        assert!(
            net.peak() <= limit * threads,
            "limit={} threads={} peak={}",
            limit,
            threads,
            net.peak()
        );
    }
}

#[tokio::test]
async fn test_remove_source_after_commit() {
    let dir = TempDir::new().unwrap();
    let path = write_file(dir.path(), "a.bin", 3 * KIB);

    let net = FakeNet::new();
    let ctx = context(&net, NetworkConfig::default());
    let pool = pool(&ctx, 8).await;

    let options = ItemOptions {
        remove_source: true,
        ..Default::default()
    };
    let uploader = Uploader::new(pool, Arc::new(NoopProgress), 2);
    let mut iter = FileIter::new(vec![path.clone()], me(), KIB, options);
    let summary = uploader
        .upload(&mut iter, &CancellationToken::new(), 1)
        .await
        .unwrap();

    assert_eq!(summary.succeeded, 1);
    assert!(summary.deletion_failures.is_empty());
    assert!(!path.exists());
    assert_eq!(net.sent.lock().len(), 1);
}

#[tokio::test]
async fn test_deletion_failure_still_succeeds() {
    let dir = TempDir::new().unwrap();
    let path = write_file(dir.path(), "a.bin", 2 * KIB);

    let net = FakeNet::new();
    // 提交时文件已被外部删除，随后的删除会失败
    *net.remove_on_send.lock() = Some(path.clone());
    let ctx = context(&net, NetworkConfig::default());
    let pool = pool(&ctx, 8).await;

    let options = ItemOptions {
        remove_source: true,
        ..Default::default()
    };
    let uploader = Uploader::new(pool, Arc::new(NoopProgress), 2);
    let mut iter = FileIter::new(vec![path], me(), KIB, options);
    let summary = uploader
        .upload(&mut iter, &CancellationToken::new(), 1)
        .await
        .unwrap();

    assert_eq!(summary.succeeded, 1);
    assert!(summary.is_success());
    assert_eq!(summary.deletion_failures.len(), 1);
    assert_eq!(summary.deletion_failures[0].item, "a.bin");
}

#[tokio::test]
async fn test_keep_source_by_default() {
    let dir = TempDir::new().unwrap();
    let path = write_file(dir.path(), "a.bin", KIB);

    let net = FakeNet::new();
    let ctx = context(&net, NetworkConfig::default());
    let pool = pool(&ctx, 8).await;

    let uploader = Uploader::new(pool, Arc::new(NoopProgress), 1);
    let mut iter = FileIter::new(vec![path.clone(), dir.path().join("missing")], me(), KIB, ItemOptions::default());
    let summary = uploader
        .upload(&mut iter, &CancellationToken::new(), 2)
        .await
        .unwrap();

    assert!(path.exists());
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed.len(), 1);
    assert!(summary.failed[0].item.ends_with("missing"));
}
