// 下载分片写入

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

/// 下载中的临时文件：`<name>.tmp`
pub fn tmp_path(path: &Path) -> PathBuf {
    let mut raw = path.as_os_str().to_owned();
    raw.push(".tmp");
    PathBuf::from(raw)
}

/// 创建临时文件并预分配空间
pub async fn prepare_file(path: &Path, size: u64) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .context("创建父目录失败")?;
    }
    let file = File::create(path).await.context("创建文件失败")?;
    file.set_len(size).await.context("预分配文件空间失败")?;
    debug!("文件准备完成: {:?}, 大小: {} bytes", path, size);
    Ok(())
}

/// 在指定偏移写入一个分片
pub async fn write_part(path: &Path, offset: u64, data: &[u8]) -> Result<()> {
    let mut file = File::options()
        .write(true)
        .open(path)
        .await
        .context("打开输出文件失败")?;
    file.seek(std::io::SeekFrom::Start(offset))
        .await
        .context("文件定位失败")?;
    file.write_all(data).await.context("写入文件失败")?;
    file.flush().await.context("刷新文件缓冲失败")?;
    Ok(())
}

/// 删除临时文件，文件不存在时返回 false
pub async fn remove_tmp(path: &Path) -> Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).with_context(|| format!("删除临时文件失败: {:?}", path)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_out_of_order_writes() {
        let dir = TempDir::new().unwrap();
        let path = tmp_path(&dir.path().join("out.bin"));
        assert!(path.to_string_lossy().ends_with("out.bin.tmp"));

        prepare_file(&path, 10).await.unwrap();
        write_part(&path, 5, b"world").await.unwrap();
        write_part(&path, 0, b"hello").await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"helloworld");
    }

    #[tokio::test]
    async fn test_remove_tmp() {
        let dir = TempDir::new().unwrap();
        let path = tmp_path(&dir.path().join("out.bin"));

        assert!(!remove_tmp(&path).await.unwrap());
        prepare_file(&path, 4).await.unwrap();
        assert!(remove_tmp(&path).await.unwrap());
        assert!(!path.exists());

        // 目录无法按文件删除，错误需要上报
        std::fs::create_dir(&path).unwrap();
        assert!(remove_tmp(&path).await.is_err());
    }
}
