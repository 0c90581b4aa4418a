// 终端进度条
//
// 每个进行中的文件一条进度条，外加一条总进度

use super::{Progress, ProgressState};
use crate::error::XferError;
use crate::transfer::{ItemOutcome, TransferItem};
use dashmap::DashMap;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

const RENDER_INTERVAL: Duration = Duration::from_millis(100);

pub struct Reporter {
    multi: MultiProgress,
    overall: ProgressBar,
    bars: DashMap<i64, ProgressBar>,
    state: Arc<ProgressState>,
    expected: AtomicUsize,
    done: Notify,
}

impl Reporter {
    /// # 参数
    /// * `visible` - false 时不输出到终端（非交互环境、测试）
    pub fn new(visible: bool) -> Arc<Self> {
        let target = if visible {
            ProgressDrawTarget::stderr()
        } else {
            ProgressDrawTarget::hidden()
        };
        let multi = MultiProgress::with_draw_target(target);
        let overall = multi.add(ProgressBar::new(0));
        overall.set_style(
            ProgressStyle::with_template("{prefix:.bold} [{bar:30.green/white}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        overall.set_prefix("总进度");

        Arc::new(Self {
            multi,
            overall,
            bars: DashMap::new(),
            state: ProgressState::new(),
            expected: AtomicUsize::new(0),
            done: Notify::new(),
        })
    }

    /// 设置预期的文件总数
    pub fn set_expected(&self, n: usize) {
        self.expected.store(n, Ordering::SeqCst);
        self.overall.set_length(n as u64);
        self.done.notify_waiters();
    }

    pub fn state(&self) -> &Arc<ProgressState> {
        &self.state
    }

    /// 已结束的项数（成功、跳过、失败）
    pub fn finished_count(&self) -> usize {
        self.state.completed() + self.state.failed()
    }

    /// 所有预期的文件都已结束
    pub fn is_finished(&self) -> bool {
        self.finished_count() >= self.expected.load(Ordering::SeqCst) && self.state.active() == 0
    }

    /// 定时刷新汇总信息，直到全部结束或被取消
    pub async fn render(&self, cancel: &CancellationToken) {
        loop {
            self.overall.set_message(format!(
                "{} / {}",
                indicatif::HumanBytes(self.state.transferred_bytes()),
                indicatif::HumanBytes(self.state.total_bytes())
            ));
            if self.is_finished() {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(RENDER_INTERVAL) => {}
            }
        }
    }

    /// 等待所有预期的文件结束
    pub async fn wait(&self) {
        loop {
            let notified = self.done.notified();
            if self.is_finished() {
                return;
            }
            notified.await;
        }
    }

    /// 结束所有进度条
    pub fn close(&self) {
        for bar in self.bars.iter() {
            bar.finish_and_clear();
        }
        self.bars.clear();
        self.overall.finish();
    }
}

impl Progress for Reporter {
    fn on_add(&self, item: &TransferItem) {
        self.state.on_add(item);

        let bar = self.multi.add(ProgressBar::new(item.size));
        bar.set_style(
            ProgressStyle::with_template(
                "{msg:30!} [{bar:30.cyan/blue}] {bytes}/{total_bytes} {bytes_per_sec}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
        );
        bar.set_message(item.name.clone());
        self.bars.insert(item.id, bar);
    }

    fn on_progress(&self, item: &TransferItem, transferred: u64, total: u64) {
        self.state.on_progress(item, transferred, total);
        if let Some(bar) = self.bars.get(&item.id) {
            bar.set_length(total);
            bar.set_position(transferred);
        }
    }

    fn on_done(&self, item: &TransferItem, result: &Result<ItemOutcome, XferError>) {
        self.state.on_done(item, result);
        if let Some((_, bar)) = self.bars.remove(&item.id) {
            match result {
                Ok(_) => bar.finish_and_clear(),
                Err(e) => bar.abandon_with_message(format!("{}: {}", item.name, e)),
            }
        }
        self.overall.inc(1);
        self.done.notify_waiters();
    }

    fn on_failed(&self, label: &str, err: &XferError) {
        self.state.on_failed(label, err);
        self.overall.inc(1);
        self.done.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::{ItemOptions, Location};
    use std::path::PathBuf;

    fn item(id: i64) -> TransferItem {
        TransferItem {
            id,
            name: format!("f{}", id),
            size: 10,
            part_size: 10,
            source: Location::Local(PathBuf::from("a")),
            destination: Location::Local(PathBuf::from("b")),
            options: ItemOptions::default(),
        }
    }

    #[tokio::test]
    async fn test_wait_returns_after_expected_items() {
        let reporter = Reporter::new(false);
        reporter.set_expected(2);

        let r = reporter.clone();
        let waiter = tokio::spawn(async move { r.wait().await });

        for id in 1..=2 {
            let it = item(id);
            reporter.on_add(&it);
            reporter.on_progress(&it, 10, 10);
            reporter.on_done(&it, &Ok(ItemOutcome::Done { deletion_failure: None }));
        }

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(reporter.is_finished());
        reporter.render(&CancellationToken::new()).await;
        reporter.close();
    }

    #[tokio::test]
    async fn test_wait_counts_items_that_never_started() {
        let reporter = Reporter::new(false);
        reporter.set_expected(2);

        let r = reporter.clone();
        let waiter = tokio::spawn(async move { r.wait().await });

        let it = item(1);
        reporter.on_add(&it);
        reporter.on_done(&it, &Ok(ItemOutcome::Done { deletion_failure: None }));
        assert!(!reporter.is_finished());

        reporter.on_failed("gone.bin", &XferError::fatal("gone.bin", "文件不存在"));

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reporter.state().failed(), 1);
        assert_eq!(reporter.finished_count(), 2);
    }
}
