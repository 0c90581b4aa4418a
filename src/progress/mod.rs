//! 进度跟踪与显示
//!
//! - `Progress`：引擎回调接口
//! - `ProgressState`：原子计数的聚合状态，可被多个任务同时更新
//! - `Reporter`：基于 indicatif 的终端渲染

mod reporter;

pub use reporter::Reporter;

use crate::error::XferError;
use crate::transfer::{ItemOutcome, TransferItem};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// 引擎进度回调
pub trait Progress: Send + Sync {
    fn on_add(&self, item: &TransferItem);

    /// 已完成字节数更新
    fn on_progress(&self, item: &TransferItem, transferred: u64, total: u64);

    fn on_done(&self, item: &TransferItem, result: &Result<ItemOutcome, XferError>);

    /// 未能开始传输的工作项（迭代器报错、任务异常退出）
    fn on_failed(&self, _label: &str, _err: &XferError) {}
}

/// 不显示进度
#[derive(Debug, Default)]
pub struct NoopProgress;

impl Progress for NoopProgress {
    fn on_add(&self, _item: &TransferItem) {}
    fn on_progress(&self, _item: &TransferItem, _transferred: u64, _total: u64) {}
    fn on_done(&self, _item: &TransferItem, _result: &Result<ItemOutcome, XferError>) {}
}

/// 单项状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemStatus {
    Active,
    Succeeded,
    Skipped,
    Failed,
}

/// 单项进度快照
#[derive(Debug, Clone)]
pub struct ItemProgress {
    pub name: String,
    pub transferred: u64,
    pub total: u64,
    pub status: ItemStatus,
}

/// 聚合进度状态
#[derive(Debug, Default)]
pub struct ProgressState {
    items: DashMap<i64, ItemProgress>,
    active: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
    transferred_bytes: AtomicU64,
    total_bytes: AtomicU64,
}

impl ProgressState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn transferred_bytes(&self) -> u64 {
        self.transferred_bytes.load(Ordering::SeqCst)
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::SeqCst)
    }

    pub fn item(&self, id: i64) -> Option<ItemProgress> {
        self.items.get(&id).map(|p| p.clone())
    }
}

impl Progress for ProgressState {
    fn on_add(&self, item: &TransferItem) {
        self.items.insert(
            item.id,
            ItemProgress {
                name: item.name.clone(),
                transferred: 0,
                total: item.size,
                status: ItemStatus::Active,
            },
        );
        self.active.fetch_add(1, Ordering::SeqCst);
        self.total_bytes.fetch_add(item.size, Ordering::SeqCst);
    }

    fn on_progress(&self, item: &TransferItem, transferred: u64, total: u64) {
        if let Some(mut p) = self.items.get_mut(&item.id) {
            // 分片乱序完成时只前进
            if transferred > p.transferred {
                self.transferred_bytes
                    .fetch_add(transferred - p.transferred, Ordering::SeqCst);
                p.transferred = transferred;
            }
            p.total = total;
        }
    }

    fn on_done(&self, item: &TransferItem, result: &Result<ItemOutcome, XferError>) {
        let status = match result {
            Ok(ItemOutcome::Done { .. }) => ItemStatus::Succeeded,
            Ok(ItemOutcome::Skipped) => ItemStatus::Skipped,
            Err(_) => ItemStatus::Failed,
        };
        if let Some(mut p) = self.items.get_mut(&item.id) {
            p.status = status;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
        match status {
            ItemStatus::Failed => self.failed.fetch_add(1, Ordering::SeqCst),
            _ => self.completed.fetch_add(1, Ordering::SeqCst),
        };
    }

    fn on_failed(&self, _label: &str, _err: &XferError) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }
}
