// 下载引擎
//
// 与上传对称：
// 1. MessageIter 产出带媒体的消息
// 2. 预分配 `<name>.tmp`，分片连接到文件所在 DC 并发读取，按偏移写入
// 3. 全部完成后重命名为最终文件，失败时删除临时文件

pub mod chunk;
pub mod iter;

pub use iter::MessageIter;

use crate::dcpool::DcPool;
use crate::error::XferError;
use crate::progress::Progress;
use crate::rpc::{FileLocation, Request, Response};
use crate::transfer::{
    ItemHandler, ItemOutcome, Location, PartJob, Prepared, RunSummary, TransferEngine,
    TransferItem, WorkIter,
};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct Downloader {
    pool: Arc<DcPool>,
    engine: TransferEngine,
}

impl Downloader {
    /// # 参数
    /// * `pool` - DC 连接池，按文件所在 DC 取连接
    /// * `progress` - 进度回调
    /// * `threads` - 每个文件的并发分片数
    pub fn new(pool: Arc<DcPool>, progress: Arc<dyn Progress>, threads: usize) -> Self {
        Self {
            pool,
            engine: TransferEngine::new(progress, threads),
        }
    }

    /// 下载迭代器中的全部文件
    pub async fn download(
        &self,
        iter: &mut dyn WorkIter,
        cancel: &CancellationToken,
        limit: usize,
    ) -> Result<RunSummary, XferError> {
        let handler = Arc::new(DownloadHandler {
            pool: self.pool.clone(),
        });
        self.engine.run(iter, handler, cancel, limit).await
    }
}

struct DownloadHandler {
    pool: Arc<DcPool>,
}

fn endpoints(item: &TransferItem) -> Result<(&FileLocation, &Path), XferError> {
    match (&item.source, &item.destination) {
        (Location::Media(location), Location::Local(path)) => Ok((location, path)),
        _ => Err(XferError::fatal(&item.name, "下载项必须是 远端媒体 -> 本地文件")),
    }
}

#[async_trait]
impl ItemHandler for DownloadHandler {
    async fn prepare(&self, item: &TransferItem, _cancel: &CancellationToken) -> Result<Prepared, XferError> {
        let (_, path) = endpoints(item)?;

        if item.options.skip_same {
            if let Ok(meta) = tokio::fs::metadata(path).await {
                if meta.is_file() && meta.len() == item.size {
                    debug!("目标已存在且大小相同，跳过: {:?}", path);
                    return Ok(Prepared::Skip);
                }
            }
        }

        chunk::prepare_file(&chunk::tmp_path(path), item.size)
            .await
            .map_err(|e| XferError::fatal(&item.name, format!("{:#}", e)))?;
        Ok(Prepared::Transfer)
    }

    async fn transfer_part(
        &self,
        item: &TransferItem,
        job: &PartJob,
        cancel: &CancellationToken,
    ) -> Result<(), XferError> {
        if job.is_empty() {
            return Ok(());
        }
        let (location, path) = endpoints(item)?;

        let conn = self.pool.connection(cancel, location.dc).await?;
        let request = Request::GetFile {
            location: location.clone(),
            offset: job.range.start,
            limit: job.len() as usize,
        };
        let data = match conn.invoke(request, cancel).await {
            Ok(Response::FileData(data)) => data,
            Ok(other) => return Err(XferError::fatal(&item.name, format!("意外的响应: {:?}", other))),
            Err(e) => return Err(XferError::from_rpc(&item.name, e)),
        };
        if data.len() as u64 != job.len() {
            return Err(XferError::fatal(
                &item.name,
                format!("分片 #{} 长度不符: 期望 {}, 实际 {}", job.index, job.len(), data.len()),
            ));
        }

        chunk::write_part(&chunk::tmp_path(path), job.range.start, &data)
            .await
            .map_err(|e| XferError::fatal(&item.name, format!("{:#}", e)))
    }

    async fn finish(&self, item: &TransferItem, _cancel: &CancellationToken) -> Result<ItemOutcome, XferError> {
        let (_, path) = endpoints(item)?;
        tokio::fs::rename(chunk::tmp_path(path), path)
            .await
            .map_err(|e| XferError::fatal(&item.name, format!("重命名临时文件失败: {}", e)))?;
        info!("下载完成: {:?}", path);
        Ok(ItemOutcome::Done { deletion_failure: None })
    }

    async fn abort(&self, item: &TransferItem) {
        if let Ok((_, path)) = endpoints(item) {
            let tmp = chunk::tmp_path(path);
            match chunk::remove_tmp(&tmp).await {
                Ok(true) => debug!("已清理临时文件: {:?}", tmp),
                Ok(false) => {}
                Err(e) => warn!("{}: {:#}", item.name, e),
            }
        }
    }
}
