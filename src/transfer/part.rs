// 分片管理
//
// 分片规则：
// - 按 part_size 等分，最后一片可以更短
// - 空文件也有一个长度为 0 的分片（提交时至少需要一个分片）
// - 已完成的分片不会再次调度

use bit_set::BitSet;
use std::ops::Range;
use tracing::debug;

/// 计算分片数量
pub fn part_count(total_size: u64, part_size: u64) -> usize {
    if total_size == 0 || part_size == 0 {
        return 1;
    }
    total_size.div_ceil(part_size) as usize
}

/// 一个分片任务
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartJob {
    pub item_id: i64,
    pub index: usize,
    pub range: Range<u64>,
}

impl PartJob {
    pub fn len(&self) -> u64 {
        self.range.end - self.range.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 单个文件的分片状态
#[derive(Debug)]
pub struct PartManager {
    item_id: i64,
    ranges: Vec<Range<u64>>,
    completed: BitSet,
    active: BitSet,
    total_size: u64,
}

impl PartManager {
    /// # 参数
    /// * `item_id` - 所属文件
    /// * `total_size` - 文件大小
    /// * `part_size` - 分片大小
    pub fn new(item_id: i64, total_size: u64, part_size: u64) -> Self {
        let ranges = Self::calculate_ranges(total_size, part_size);
        debug!(
            "创建分片管理器: item={}, 文件大小={} bytes, 分片大小={} bytes, 分片数量={}",
            item_id,
            total_size,
            part_size,
            ranges.len()
        );
        Self {
            item_id,
            completed: BitSet::with_capacity(ranges.len()),
            active: BitSet::with_capacity(ranges.len()),
            ranges,
            total_size,
        }
    }

    fn calculate_ranges(total_size: u64, part_size: u64) -> Vec<Range<u64>> {
        if total_size == 0 || part_size == 0 {
            return vec![0..total_size];
        }
        let mut ranges = Vec::with_capacity(part_count(total_size, part_size));
        let mut offset = 0u64;
        while offset < total_size {
            let end = std::cmp::min(offset + part_size, total_size);
            ranges.push(offset..end);
            offset = end;
        }
        ranges
    }

    /// 取出下一个待传输分片并标记为进行中
    pub fn next_pending(&mut self) -> Option<PartJob> {
        let index = (0..self.ranges.len())
            .find(|i| !self.completed.contains(*i) && !self.active.contains(*i))?;
        self.active.insert(index);
        Some(PartJob {
            item_id: self.item_id,
            index,
            range: self.ranges[index].clone(),
        })
    }

    /// 标记完成，重复确认返回 false
    pub fn mark_completed(&mut self, index: usize) -> bool {
        self.active.remove(index);
        index < self.ranges.len() && self.completed.insert(index)
    }

    pub fn part_count(&self) -> usize {
        self.ranges.len()
    }

    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// 已完成的字节数
    pub fn transferred_bytes(&self) -> u64 {
        self.completed
            .iter()
            .map(|i| self.ranges[i].end - self.ranges[i].start)
            .sum()
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn is_completed(&self) -> bool {
        self.completed.len() == self.ranges.len()
    }
}
