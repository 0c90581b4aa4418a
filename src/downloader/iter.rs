// 下载工作项迭代器
//
// 按消息 ID 分批（每批 100 条）懒加载，没有媒体的消息直接跳过。
// 某一批拉取失败时只产出一个错误，后续批次继续

use crate::dcpool::DcPool;
use crate::error::XferError;
use crate::rpc::{Message, Peer, Request, Response};
use crate::transfer::{ItemOptions, Location, TransferItem, WorkIter};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// 每次拉取的消息数
pub const BATCH_SIZE: usize = 100;

pub struct MessageIter {
    pool: Arc<DcPool>,
    peer: Peer,
    ids: IdRanges,
    pending: VecDeque<TransferItem>,
    dest_dir: PathBuf,
    part_size: u64,
    options: ItemOptions,
}

impl MessageIter {
    /// # 参数
    /// * `pool` - 消息列表从主 DC 拉取
    /// * `peer` - 来源会话
    /// * `ranges` - 消息 ID 范围（闭区间），重叠的范围会合并，重复的 ID 只下载一次
    /// * `dest_dir` - 下载目录
    pub fn new(
        pool: Arc<DcPool>,
        peer: Peer,
        ranges: &[RangeInclusive<i64>],
        dest_dir: PathBuf,
        part_size: u64,
        options: ItemOptions,
    ) -> Self {
        Self {
            pool,
            peer,
            ids: IdRanges::new(ranges),
            pending: VecDeque::new(),
            dest_dir,
            part_size,
            options,
        }
    }

    fn to_item(&self, message: Message) -> Option<TransferItem> {
        let media = message.media?;
        let name = format!("{}_{}", message.id, sanitize_file_name(&media.name));
        Some(TransferItem {
            id: message.id,
            destination: Location::Local(self.dest_dir.join(&name)),
            name,
            size: media.size,
            part_size: self.part_size,
            source: Location::Media(media.location),
            options: self.options.clone(),
        })
    }

    async fn fetch(&self, ids: Vec<i64>, cancel: &CancellationToken) -> Result<Vec<Message>, XferError> {
        let conn = self.pool.default(cancel).await?;
        let request = Request::GetMessages {
            peer: self.peer.clone(),
            ids,
        };
        match conn.invoke(request, cancel).await {
            Ok(Response::Messages(messages)) => Ok(messages),
            Ok(other) => Err(XferError::fatal(&self.peer.name, format!("意外的响应: {:?}", other))),
            Err(e) => Err(XferError::from_rpc(&self.peer.name, e)),
        }
    }
}

#[async_trait]
impl WorkIter for MessageIter {
    async fn next(&mut self, cancel: &CancellationToken) -> Option<Result<TransferItem, XferError>> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                return Some(Ok(item));
            }
            if cancel.is_cancelled() {
                return None;
            }
            let batch = self.ids.next_batch(BATCH_SIZE);
            if batch.is_empty() {
                return None;
            }
            let label = format!(
                "{}#{}..{}",
                self.peer.name,
                batch.first().copied().unwrap_or_default(),
                batch.last().copied().unwrap_or_default()
            );

            match self.fetch(batch, cancel).await {
                Ok(messages) => {
                    let count = messages.len();
                    for message in messages {
                        if let Some(item) = self.to_item(message) {
                            self.pending.push_back(item);
                        }
                    }
                    debug!("拉取消息 {}: {} 条, 含媒体 {} 条", label, count, self.pending.len());
                }
                Err(e) => {
                    warn!("拉取消息失败 {}: {}", label, e);
                    let reason = e.to_string();
                    return Some(Err(match e {
                        XferError::Cancelled => XferError::Cancelled,
                        _ => XferError::fatal(label, reason),
                    }));
                }
            }
        }
    }

    fn total(&self) -> usize {
        self.ids.total()
    }
}

/// 合并后的消息 ID 范围，按需逐批取出
#[derive(Debug, Clone)]
struct IdRanges {
    ranges: Vec<RangeInclusive<i64>>,
    index: usize,
    /// 当前范围内下一个待取的 ID
    next: Option<i64>,
    total: usize,
}

impl IdRanges {
    fn new(ranges: &[RangeInclusive<i64>]) -> Self {
        let ranges = merge_ranges(ranges);
        let total = ranges
            .iter()
            .map(|r| (*r.end() as i128 - *r.start() as i128 + 1) as u128)
            .fold(0usize, |acc, n| acc.saturating_add(usize::try_from(n).unwrap_or(usize::MAX)));
        let next = ranges.first().map(|r| *r.start());
        Self {
            ranges,
            index: 0,
            next,
            total,
        }
    }

    fn total(&self) -> usize {
        self.total
    }

    fn next_batch(&mut self, size: usize) -> Vec<i64> {
        let mut batch = Vec::with_capacity(size);
        while batch.len() < size {
            let (Some(range), Some(id)) = (self.ranges.get(self.index), self.next) else {
                break;
            };
            batch.push(id);
            self.next = if id < *range.end() {
                Some(id + 1)
            } else {
                self.index += 1;
                self.ranges.get(self.index).map(|r| *r.start())
            };
        }
        batch
    }
}

/// 排序并合并重叠或相邻的范围，空范围丢弃
fn merge_ranges(ranges: &[RangeInclusive<i64>]) -> Vec<RangeInclusive<i64>> {
    let mut sorted: Vec<_> = ranges.iter().filter(|r| !r.is_empty()).cloned().collect();
    sorted.sort_by_key(|r| *r.start());

    let mut merged: Vec<RangeInclusive<i64>> = Vec::with_capacity(sorted.len());
    for range in sorted {
        match merged.last_mut() {
            Some(last) if *range.start() <= last.end().saturating_add(1) => {
                if range.end() > last.end() {
                    *last = *last.start()..=*range.end();
                }
            }
            _ => merged.push(range),
        }
    }
    merged
}

/// 远端文件名只保留最后一段
fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default().trim();
    if base.is_empty() || base == "." || base == ".." {
        "file".to_string()
    } else {
        base.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("a.txt"), "a.txt");
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name(".."), "file");
        assert_eq!(sanitize_file_name(""), "file");
    }

    #[test]
    fn test_merge_ranges() {
        let merged = merge_ranges(&[8..=12, 1..=3, 2..=5, 6..=6, 20..=20, 9..=10]);
        assert_eq!(merged, vec![1..=6, 8..=12, 20..=20]);
        assert!(merge_ranges(&[]).is_empty());
    }

    #[test]
    fn test_batches_are_lazy_and_deduplicated() {
        let mut ids = IdRanges::new(&[1..=150, 100..=205, 300..=300]);
        assert_eq!(ids.total(), 206);

        let first = ids.next_batch(BATCH_SIZE);
        assert_eq!(first, (1..=100).collect::<Vec<_>>());
        let second = ids.next_batch(BATCH_SIZE);
        assert_eq!(second.first(), Some(&101));
        assert_eq!(second.last(), Some(&200));
        let third = ids.next_batch(BATCH_SIZE);
        assert_eq!(third, vec![201, 202, 203, 204, 205, 300]);
        assert!(ids.next_batch(BATCH_SIZE).is_empty());
    }

    #[test]
    fn test_huge_range_not_materialized() {
        let mut ids = IdRanges::new(&[1..=9_000_000_000]);
        assert_eq!(ids.total() as u64, 9_000_000_000);
        assert_eq!(ids.next_batch(3), vec![1, 2, 3]);
        assert_eq!(ids.next_batch(2), vec![4, 5]);

        let mut edge = IdRanges::new(&[i64::MAX - 1..=i64::MAX]);
        assert_eq!(edge.next_batch(BATCH_SIZE), vec![i64::MAX - 1, i64::MAX]);
        assert!(edge.next_batch(BATCH_SIZE).is_empty());
    }
}
