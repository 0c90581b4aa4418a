// 本地路径展开
//
// 上传前把命令行给出的文件 / 目录展开为文件列表：
// - 目录递归遍历，不跟随符号链接，同一目录内按文件名排序
// - 排除规则为 glob，匹配文件名或完整路径均可，匹配到的目录整体跳过
// - 同一文件（按规范路径）只出现一次

use crate::error::XferError;
use glob::Pattern;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// 展开路径
///
/// # 参数
/// * `paths` - 文件或目录
/// * `excludes` - 排除规则（glob）
///
/// # 返回
/// 去重后的文件列表，保持输入顺序
pub fn walk(paths: &[PathBuf], excludes: &[String]) -> Result<Vec<PathBuf>, XferError> {
    let patterns = excludes
        .iter()
        .map(|p| Pattern::new(p).map_err(|e| XferError::Config(format!("非法的排除规则 {:?}: {}", p, e))))
        .collect::<Result<Vec<_>, _>>()?;

    let mut seen = HashSet::new();
    let mut files = Vec::new();

    for root in paths {
        if !root.exists() {
            return Err(XferError::Config(format!("路径不存在: {:?}", root)));
        }

        let walker = WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| entry.depth() == 0 || !is_excluded(entry.path(), &patterns));

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("遍历目录出错，已跳过: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_file() || is_excluded(entry.path(), &patterns) {
                continue;
            }

            let path = entry.into_path();
            let key = std::fs::canonicalize(&path).unwrap_or_else(|_| path.clone());
            if seen.insert(key) {
                files.push(path);
            }
        }
    }

    debug!("路径展开完成: {} 个文件", files.len());
    Ok(files)
}

fn is_excluded(path: &Path, patterns: &[Pattern]) -> bool {
    let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
    patterns
        .iter()
        .any(|p| p.matches(&name) || p.matches_path(path))
}
