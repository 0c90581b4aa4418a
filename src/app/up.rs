// up 命令：上传本地文件到会话

use super::{close_pool, connect, resolve_peer, with_progress};
use crate::bootstrap::BootstrapContext;
use crate::config::AppConfig;
use crate::error::XferError;
use crate::filesystem;
use crate::transfer::{ItemOptions, RunSummary, WorkIter};
use crate::uploader::{FileIter, Uploader};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Clone, Default)]
pub struct UploadArgs {
    /// 文件或目录
    pub paths: Vec<PathBuf>,
    /// 排除规则（glob）
    pub excludes: Vec<String>,
    /// 目标会话，空表示自己
    pub chat: String,
    /// 图片以图片形式发送
    pub photo: bool,
    /// 上传成功后删除本地文件
    pub remove: bool,
}

/// 执行上传
pub async fn run(
    config: &AppConfig,
    ctx: &BootstrapContext,
    args: UploadArgs,
    cancel: &CancellationToken,
) -> Result<RunSummary, XferError> {
    let files = filesystem::walk(&args.paths, &args.excludes)?;
    info!("待上传文件: {} 个", files.len());
    if files.is_empty() {
        return Ok(RunSummary::new(0));
    }

    let session = connect(ctx, cancel).await?;
    let result = async {
        let peer = resolve_peer(&session, &args.chat, cancel).await?;
        let options = ItemOptions {
            photo: args.photo,
            remove_source: args.remove,
            skip_same: false,
        };
        let mut iter = FileIter::new(files, peer, config.transfer.part_size, options);
        let expected = iter.total();

        with_progress(expected, |reporter| {
            let uploader = Uploader::new(session.pool.clone(), reporter, config.transfer.threads);
            async move { uploader.upload(&mut iter, cancel, config.transfer.limit).await }
        })
        .await
    }
    .await;

    close_pool(&session.pool).await;
    result
}
