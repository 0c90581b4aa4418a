// 两级并发传输引擎
//
// - 外层 Semaphore(limit)：同时进行的文件数，先取许可再向迭代器拉取下一项
// - 内层 Semaphore(threads)：每个文件同时进行的分片数
// - 两级都用 JoinSet 管理任务，同时在途的分片操作不超过 limit × threads
//
// 临时错误只由中间件链重试，到达引擎的错误一律使该文件失败；
// 一个分片失败会取消同一文件的其他分片，其他文件不受影响

use super::{ItemOutcome, PartJob, PartManager, RunSummary, TransferItem, WorkIter};
use crate::error::XferError;
use crate::progress::Progress;
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 传输前的准备结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prepared {
    Transfer,
    /// 无需传输（例如目标已存在）
    Skip,
}

/// 上传 / 下载各自的具体动作
#[async_trait]
pub trait ItemHandler: Send + Sync + 'static {
    /// 传输前准备（创建临时文件、检查目标等）
    async fn prepare(&self, item: &TransferItem, cancel: &CancellationToken) -> Result<Prepared, XferError>;

    /// 传输一个分片
    async fn transfer_part(
        &self,
        item: &TransferItem,
        job: &PartJob,
        cancel: &CancellationToken,
    ) -> Result<(), XferError>;

    /// 全部分片完成后的收尾（提交、重命名、删除源文件等）
    async fn finish(&self, item: &TransferItem, cancel: &CancellationToken) -> Result<ItemOutcome, XferError>;

    /// 失败后的清理
    async fn abort(&self, _item: &TransferItem) {}
}

/// 传输引擎
pub struct TransferEngine {
    progress: Arc<dyn Progress>,
    threads: usize,
}

impl TransferEngine {
    /// # 参数
    /// * `progress` - 进度回调
    /// * `threads` - 每个文件的并发分片数
    pub fn new(progress: Arc<dyn Progress>, threads: usize) -> Self {
        Self {
            progress,
            threads: threads.max(1),
        }
    }

    /// 执行全部工作项
    ///
    /// # 参数
    /// * `iter` - 工作项迭代器
    /// * `handler` - 具体的传输动作
    /// * `cancel` - 取消信号，取消后在途分片在下一个挂起点中止
    /// * `limit` - 同时传输的文件数
    pub async fn run<H: ItemHandler>(
        &self,
        iter: &mut dyn WorkIter,
        handler: Arc<H>,
        cancel: &CancellationToken,
        limit: usize,
    ) -> Result<RunSummary, XferError> {
        let limit = limit.max(1);
        let mut summary = RunSummary::new(iter.total());
        info!(
            "开始传输: 共 {} 项, 并发文件数 {}, 每文件并发分片数 {}",
            summary.total, limit, self.threads
        );

        let items = Arc::new(Semaphore::new(limit));
        let mut join_set: JoinSet<(String, Result<ItemOutcome, XferError>)> = JoinSet::new();

        loop {
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                p = items.clone().acquire_owned() => p.map_err(|_| XferError::Cancelled)?,
            };

            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                n = iter.next(cancel) => n,
            };

            let item = match next {
                None => break,
                Some(Ok(item)) => item,
                Some(Err(e)) => {
                    warn!("跳过无法读取的工作项: {}", e);
                    let label = item_label(&e);
                    self.progress.on_failed(&label, &e);
                    summary.record(label, Err(e));
                    continue;
                }
            };

            self.progress.on_add(&item);
            let handler = handler.clone();
            let progress = self.progress.clone();
            let threads = self.threads;
            let item_cancel = cancel.child_token();
            join_set.spawn(async move {
                let item = Arc::new(item);
                // 处理器 panic 也要走 on_done，进度才能收口
                let result = AssertUnwindSafe(run_item(&item, &handler, progress.as_ref(), threads, &item_cancel))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| Err(XferError::RecoveredCrash(format!("{} 传输任务 panic", item.name))));
                if result.is_err() {
                    handler.abort(&item).await;
                }
                progress.on_done(&item, &result);
                drop(permit);
                (item.name.clone(), result)
            });

            // 非阻塞回收已完成的文件
            while let Some(result) = join_set.try_join_next() {
                handle_item_result(result, self.progress.as_ref(), &mut summary);
            }
        }

        // 等待所有剩余文件完成
        while let Some(result) = join_set.join_next().await {
            handle_item_result(result, self.progress.as_ref(), &mut summary);
        }

        summary.cancelled = cancel.is_cancelled();
        info!("传输结束: {}", summary);
        Ok(summary)
    }
}

fn item_label(e: &XferError) -> String {
    match e {
        XferError::FatalItem { item, .. } => item.clone(),
        _ => "<unknown>".to_string(),
    }
}

fn handle_item_result(
    result: Result<(String, Result<ItemOutcome, XferError>), JoinError>,
    progress: &dyn Progress,
    summary: &mut RunSummary,
) {
    match result {
        Ok((name, outcome)) => {
            if let Err(e) = &outcome {
                error!("{} 传输失败: {}", name, e);
            }
            summary.record(name, outcome);
        }
        Err(e) => {
            // 任务 panic
            error!("传输任务异常退出: {}", e);
            let err = XferError::RecoveredCrash(e.to_string());
            progress.on_failed("<panicked>", &err);
            summary.record("<panicked>".to_string(), Err(err));
        }
    }
}

/// 单个文件：分片并发 + 收尾
async fn run_item<H: ItemHandler>(
    item: &Arc<TransferItem>,
    handler: &Arc<H>,
    progress: &dyn Progress,
    threads: usize,
    cancel: &CancellationToken,
) -> Result<ItemOutcome, XferError> {
    if handler.prepare(item, cancel).await? == Prepared::Skip {
        debug!("跳过: {}", item.name);
        return Ok(ItemOutcome::Skipped);
    }

    let manager = Mutex::new(PartManager::new(item.id, item.size, item.part_size));
    let semaphore = Arc::new(Semaphore::new(threads));
    let mut join_set: JoinSet<Result<usize, XferError>> = JoinSet::new();
    let mut first_error: Option<XferError> = None;

    debug!("{}: {} 个分片, 并发数 {}", item.name, item.parts(), threads);

    loop {
        if cancel.is_cancelled() {
            first_error.get_or_insert(XferError::Cancelled);
            break;
        }

        let permit = tokio::select! {
            _ = cancel.cancelled() => {
                first_error.get_or_insert(XferError::Cancelled);
                break;
            }
            p = semaphore.clone().acquire_owned() => p.map_err(|_| XferError::Cancelled)?,
        };

        let Some(job) = manager.lock().next_pending() else {
            break;
        };

        let part_item = item.clone();
        let part_cancel = cancel.clone();
        let part_handler = handler.clone();
        join_set.spawn(async move {
            let index = job.index;
            let result = tokio::select! {
                _ = part_cancel.cancelled() => Err(XferError::Cancelled),
                r = part_handler.transfer_part(&part_item, &job, &part_cancel) => r,
            };
            drop(permit);
            result.map(|_| index)
        });

        while let Some(result) = join_set.try_join_next() {
            if let Err(e) = on_part_done(result, &manager, item, progress) {
                first_error.get_or_insert(e);
                cancel.cancel();
            }
        }
        if first_error.is_some() {
            break;
        }
    }

    while let Some(result) = join_set.join_next().await {
        if let Err(e) = on_part_done(result, &manager, item, progress) {
            if first_error.is_none() {
                cancel.cancel();
            }
            first_error.get_or_insert(e);
        }
    }

    if let Some(e) = first_error {
        return Err(e);
    }
    if !manager.lock().is_completed() {
        return Err(XferError::fatal(&item.name, "存在未完成的分片"));
    }

    handler.finish(item, cancel).await
}

fn on_part_done(
    result: Result<Result<usize, XferError>, JoinError>,
    manager: &Mutex<PartManager>,
    item: &TransferItem,
    progress: &dyn Progress,
) -> Result<(), XferError> {
    match result {
        Ok(Ok(index)) => {
            let transferred = {
                let mut m = manager.lock();
                if !m.mark_completed(index) {
                    warn!("{}: 分片 #{} 重复确认", item.name, index);
                }
                m.transferred_bytes()
            };
            progress.on_progress(item, transferred, item.size);
            Ok(())
        }
        Ok(Err(e)) => Err(e),
        Err(e) => Err(XferError::RecoveredCrash(format!("分片任务异常退出: {}", e))),
    }
}
