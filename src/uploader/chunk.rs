// 上传分片读取

use anyhow::{Context, Result};
use std::ops::Range;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

/// 读取文件的一段
///
/// # 参数
/// * `path` - 本地文件
/// * `index` - 分片序号（仅用于日志）
/// * `range` - 字节范围
///
/// # 返回
/// 分片数据，长度恰好为 range 的长度
pub async fn read_part(path: &Path, index: usize, range: &Range<u64>) -> Result<Vec<u8>> {
    let mut file = File::open(path)
        .await
        .with_context(|| format!("打开上传文件失败: {:?}", path))?;

    file.seek(std::io::SeekFrom::Start(range.start))
        .await
        .context("文件定位失败")?;

    let mut buffer = vec![0u8; (range.end - range.start) as usize];
    file.read_exact(&mut buffer)
        .await
        .context("读取分片数据失败（文件可能已被修改）")?;

    debug!(
        "读取分片 #{}: bytes={}..{}, 大小={} bytes",
        index,
        range.start,
        range.end,
        buffer.len()
    );
    Ok(buffer)
}
