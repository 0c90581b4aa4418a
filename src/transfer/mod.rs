// 传输模块
//
// 上传与下载共用的基础类型和并发引擎：
// - TransferItem：一个待传输的文件（不可变）
// - PartManager：文件的分片划分与完成状态
// - WorkIter：按需产出 TransferItem 的迭代器
// - TransferEngine：两级并发（文件数 × 每文件分片数）执行器

pub mod engine;
pub mod part;

pub use engine::{ItemHandler, Prepared, TransferEngine};
pub use part::{part_count, PartJob, PartManager};

use crate::error::XferError;
use crate::rpc::{FileLocation, Peer};
use async_trait::async_trait;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

/// 传输端点
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    /// 本地文件
    Local(PathBuf),
    /// 远端会话（上传目标）
    Peer(Peer),
    /// 远端媒体（下载来源）
    Media(FileLocation),
}

/// 单项选项
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemOptions {
    /// 以图片形式发送（仅图片文件）
    pub photo: bool,
    /// 上传成功后删除本地文件
    pub remove_source: bool,
    /// 目标已存在且大小相同时跳过
    pub skip_same: bool,
}

/// 待传输文件
#[derive(Debug, Clone)]
pub struct TransferItem {
    /// 远端文件 ID，同一来源在多次运行间保持不变
    pub id: i64,
    pub name: String,
    pub size: u64,
    pub part_size: u64,
    pub source: Location,
    pub destination: Location,
    pub options: ItemOptions,
}

impl TransferItem {
    /// 分片数量
    pub fn parts(&self) -> usize {
        part_count(self.size, self.part_size)
    }
}

/// 工作项迭代器（单次遍历，逐个拉取）
#[async_trait]
pub trait WorkIter: Send {
    /// 下一项；单项错误以 `Some(Err)` 返回，迭代继续
    async fn next(&mut self, cancel: &CancellationToken) -> Option<Result<TransferItem, XferError>>;

    /// 预计总项数（用于进度显示）
    fn total(&self) -> usize;
}

/// 单项完成结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Done {
        /// 删除源文件失败的原因（传输本身成功）
        deletion_failure: Option<String>,
    },
    Skipped,
}

/// 失败记录
#[derive(Debug)]
pub struct ItemFailure {
    pub item: String,
    pub error: XferError,
}

/// 一次运行的汇总
#[derive(Debug, Default)]
pub struct RunSummary {
    pub total: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: Vec<ItemFailure>,
    /// 传输成功但源文件删除失败
    pub deletion_failures: Vec<ItemFailure>,
    pub cancelled: bool,
}

impl RunSummary {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            ..Default::default()
        }
    }

    /// 全部成功
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && !self.cancelled
    }

    pub(crate) fn record(&mut self, item: String, result: Result<ItemOutcome, XferError>) {
        match result {
            Ok(ItemOutcome::Done { deletion_failure }) => {
                self.succeeded += 1;
                if let Some(reason) = deletion_failure {
                    self.deletion_failures.push(ItemFailure {
                        error: XferError::fatal(&item, reason),
                        item,
                    });
                }
            }
            Ok(ItemOutcome::Skipped) => self.skipped += 1,
            Err(error) => self.failed.push(ItemFailure { item, error }),
        }
    }
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "共 {} 项：成功 {}，跳过 {}，失败 {}",
            self.total,
            self.succeeded,
            self.skipped,
            self.failed.len()
        )?;
        if !self.deletion_failures.is_empty() {
            write!(f, "，删除源文件失败 {}", self.deletion_failures.len())?;
        }
        if self.cancelled {
            write!(f, "（已取消）")?;
        }
        Ok(())
    }
}
