// 上传工作项迭代器
//
// 输入是展开后的本地文件列表，逐个读取元数据生成 TransferItem。
// 文件 ID 由 (规范路径, 大小, 修改时间) 决定，中断后重新运行会得到相同的 ID，
// 已上传的分片可以按 (file_id, part) 覆盖

use crate::error::XferError;
use crate::rpc::Peer;
use crate::transfer::{ItemOptions, Location, TransferItem, WorkIter};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// 可以作为图片发送的扩展名
const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp", "gif", "bmp"];

pub struct FileIter {
    files: Vec<PathBuf>,
    cursor: usize,
    peer: Peer,
    part_size: u64,
    options: ItemOptions,
}

impl FileIter {
    /// # 参数
    /// * `files` - 展开后的文件列表
    /// * `peer` - 目标会话
    /// * `part_size` - 分片大小
    /// * `options` - photo 只对图片生效
    pub fn new(files: Vec<PathBuf>, peer: Peer, part_size: u64, options: ItemOptions) -> Self {
        Self {
            files,
            cursor: 0,
            peer,
            part_size,
            options,
        }
    }

    async fn build(&self, path: &Path) -> Result<TransferItem, XferError> {
        let label = path.display().to_string();
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| XferError::fatal(&label, format!("读取文件信息失败: {}", e)))?;
        if !meta.is_file() {
            return Err(XferError::fatal(&label, "不是普通文件"));
        }

        let canonical = tokio::fs::canonicalize(path)
            .await
            .map_err(|e| XferError::fatal(&label, e))?;
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_nanos())
            .unwrap_or(0);

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| label.clone());

        let mut options = self.options.clone();
        options.photo = options.photo && is_image(path);

        Ok(TransferItem {
            id: file_id(&canonical, meta.len(), mtime),
            name,
            size: meta.len(),
            part_size: self.part_size,
            source: Location::Local(canonical),
            destination: Location::Peer(self.peer.clone()),
            options,
        })
    }
}

#[async_trait]
impl WorkIter for FileIter {
    async fn next(&mut self, cancel: &CancellationToken) -> Option<Result<TransferItem, XferError>> {
        if cancel.is_cancelled() {
            return None;
        }
        let path = self.files.get(self.cursor)?.clone();
        self.cursor += 1;

        let item = self.build(&path).await;
        if let Ok(item) = &item {
            debug!("上传项: {} (id={:016x}, {} bytes)", item.name, item.id, item.size);
        }
        Some(item)
    }

    fn total(&self) -> usize {
        self.files.len()
    }
}

/// 同一文件（未修改）多次运行得到相同的 ID
pub fn file_id(canonical: &Path, size: u64, mtime_nanos: u128) -> i64 {
    let mut ctx = md5::Context::new();
    ctx.consume(canonical.to_string_lossy().as_bytes());
    ctx.consume(size.to_le_bytes());
    ctx.consume(mtime_nanos.to_le_bytes());
    let digest = ctx.compute();

    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest.0[..8]);
    i64::from_le_bytes(bytes) & i64::MAX
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}
