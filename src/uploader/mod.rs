// 上传引擎
//
// 上传流程：
// 1. FileIter 逐个产出本地文件
// 2. 分片并发上传（SaveFilePart，以 (file_id, part) 为幂等键）
// 3. 全部分片确认后提交（SendMedia）
// 4. 需要时删除本地源文件，删除失败不影响上传结果

pub mod chunk;
pub mod iter;

pub use iter::FileIter;

use crate::dcpool::DcPool;
use crate::error::XferError;
use crate::progress::Progress;
use crate::rpc::{InputFile, Request, Response};
use crate::transfer::{
    ItemHandler, ItemOutcome, Location, PartJob, Prepared, RunSummary, TransferEngine,
    TransferItem, WorkIter,
};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct Uploader {
    pool: Arc<DcPool>,
    engine: TransferEngine,
}

impl Uploader {
    /// # 参数
    /// * `pool` - DC 连接池，上传走主 DC
    /// * `progress` - 进度回调
    /// * `threads` - 每个文件的并发分片数
    pub fn new(pool: Arc<DcPool>, progress: Arc<dyn Progress>, threads: usize) -> Self {
        Self {
            pool,
            engine: TransferEngine::new(progress, threads),
        }
    }

    /// 上传迭代器中的全部文件
    pub async fn upload(
        &self,
        iter: &mut dyn WorkIter,
        cancel: &CancellationToken,
        limit: usize,
    ) -> Result<RunSummary, XferError> {
        let handler = Arc::new(UploadHandler {
            pool: self.pool.clone(),
        });
        self.engine.run(iter, handler, cancel, limit).await
    }
}

struct UploadHandler {
    pool: Arc<DcPool>,
}

fn local_source(item: &TransferItem) -> Result<&Path, XferError> {
    match &item.source {
        Location::Local(path) => Ok(path),
        other => Err(XferError::fatal(&item.name, format!("上传来源必须是本地文件: {:?}", other))),
    }
}

#[async_trait]
impl ItemHandler for UploadHandler {
    async fn prepare(&self, item: &TransferItem, _cancel: &CancellationToken) -> Result<Prepared, XferError> {
        let path = local_source(item)?;
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| XferError::fatal(&item.name, format!("文件不可读: {}", e)))?;
        if meta.len() != item.size {
            return Err(XferError::fatal(
                &item.name,
                format!("文件大小已变化: {} -> {}", item.size, meta.len()),
            ));
        }
        Ok(Prepared::Transfer)
    }

    async fn transfer_part(
        &self,
        item: &TransferItem,
        job: &PartJob,
        cancel: &CancellationToken,
    ) -> Result<(), XferError> {
        let path = local_source(item)?;
        let data = chunk::read_part(path, job.index, &job.range)
            .await
            .map_err(|e| XferError::fatal(&item.name, format!("{:#}", e)))?;

        let conn = self.pool.default(cancel).await?;
        let request = Request::SaveFilePart {
            file_id: item.id,
            part: job.index,
            total_parts: item.parts(),
            data: Arc::new(data),
        };
        match conn.invoke(request, cancel).await {
            Ok(Response::PartSaved) => Ok(()),
            Ok(other) => Err(XferError::fatal(&item.name, format!("意外的响应: {:?}", other))),
            Err(e) => Err(XferError::from_rpc(&item.name, e)),
        }
    }

    async fn finish(&self, item: &TransferItem, cancel: &CancellationToken) -> Result<ItemOutcome, XferError> {
        let Location::Peer(peer) = &item.destination else {
            return Err(XferError::fatal(&item.name, "上传目标必须是会话"));
        };

        let conn = self.pool.default(cancel).await?;
        let request = Request::SendMedia {
            peer: peer.clone(),
            file: InputFile {
                id: item.id,
                parts: item.parts(),
                name: item.name.clone(),
            },
            photo: item.options.photo,
        };
        let message = match conn.invoke(request, cancel).await {
            Ok(Response::Sent(message)) => message,
            Ok(other) => return Err(XferError::fatal(&item.name, format!("意外的响应: {:?}", other))),
            Err(e) => return Err(XferError::from_rpc(&item.name, e)),
        };
        info!("上传完成: {} -> {} (msg_id={})", item.name, peer.name, message.id);

        if !item.options.remove_source {
            return Ok(ItemOutcome::Done { deletion_failure: None });
        }

        let path = local_source(item)?;
        let deletion_failure = match tokio::fs::remove_file(path).await {
            Ok(()) => None,
            Err(e) => {
                warn!("删除源文件失败: {:?}: {}", path, e);
                Some(format!("删除源文件失败: {}", e))
            }
        };
        Ok(ItemOutcome::Done { deletion_failure })
    }
}
