// dl 命令：下载会话中的媒体

use super::{close_pool, connect, parse_ranges, resolve_peer, with_progress};
use crate::bootstrap::BootstrapContext;
use crate::config::AppConfig;
use crate::downloader::{Downloader, MessageIter};
use crate::error::XferError;
use crate::transfer::{ItemOptions, RunSummary, WorkIter};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default)]
pub struct DownloadArgs {
    /// 来源会话，空表示自己
    pub chat: String,
    /// 消息 ID 范围，如 `1-100`
    pub ranges: Vec<String>,
    /// 下载目录
    pub dir: PathBuf,
    /// 目标已存在且大小相同时跳过
    pub skip_same: bool,
}

/// 执行下载
pub async fn run(
    config: &AppConfig,
    ctx: &BootstrapContext,
    args: DownloadArgs,
    cancel: &CancellationToken,
) -> Result<RunSummary, XferError> {
    let ranges = parse_ranges(&args.ranges)?;
    if ranges.is_empty() {
        return Err(XferError::Config("至少需要一个消息范围".to_string()));
    }

    let session = connect(ctx, cancel).await?;
    let result = async {
        let peer = resolve_peer(&session, &args.chat, cancel).await?;
        let options = ItemOptions {
            skip_same: args.skip_same,
            ..Default::default()
        };
        let mut iter = MessageIter::new(
            session.pool.clone(),
            peer,
            &ranges,
            args.dir.clone(),
            config.transfer.part_size,
            options,
        );
        let expected = iter.total();

        with_progress(expected, |reporter| {
            let downloader = Downloader::new(session.pool.clone(), reporter, config.transfer.threads);
            async move { downloader.download(&mut iter, cancel, config.transfer.limit).await }
        })
        .await
    }
    .await;

    close_pool(&session.pool).await;
    result
}
