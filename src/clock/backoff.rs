// 指数退避
//
// 每次 next_backoff 返回 current_interval 上下浮动 randomization_factor 的随机值，
// 然后 current_interval *= multiplier（不超过 max_interval）。
// 从 start_time 起经过的时间加上下一次等待超过 max_elapsed_time 时返回 None

use super::Clock;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

pub const DEFAULT_INITIAL_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_RANDOMIZATION_FACTOR: f64 = 0.5;

/// 重连退避的增长倍数
pub const RECONNECT_MULTIPLIER: f64 = 1.1;

/// 重连退避的最大间隔
pub const RECONNECT_MAX_INTERVAL: Duration = Duration::from_secs(10);

/// 指数退避状态
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub initial_interval: Duration,
    pub randomization_factor: f64,
    pub multiplier: f64,
    pub max_interval: Duration,
    /// None 表示不限时
    pub max_elapsed_time: Option<Duration>,
    current_interval: Duration,
    start_time: SystemTime,
    clock: Arc<dyn Clock>,
}

impl ExponentialBackoff {
    pub fn new(
        clock: Arc<dyn Clock>,
        multiplier: f64,
        max_interval: Duration,
        max_elapsed_time: Option<Duration>,
    ) -> Self {
        let start_time = clock.now();
        Self {
            initial_interval: DEFAULT_INITIAL_INTERVAL,
            randomization_factor: DEFAULT_RANDOMIZATION_FACTOR,
            multiplier,
            max_interval,
            max_elapsed_time,
            current_interval: DEFAULT_INITIAL_INTERVAL,
            start_time,
            clock,
        }
    }

    /// 关闭随机抖动（测试用）
    pub fn without_jitter(mut self) -> Self {
        self.randomization_factor = 0.0;
        self
    }

    /// 回到初始状态，重新计时
    pub fn reset(&mut self) {
        self.current_interval = self.initial_interval;
        self.start_time = self.clock.now();
    }

    pub fn current_interval(&self) -> Duration {
        self.current_interval
    }

    /// 自 reset 以来经过的时间
    pub fn elapsed(&self) -> Duration {
        self.clock
            .now()
            .duration_since(self.start_time)
            .unwrap_or_default()
    }

    /// 下一次等待时长，None 表示放弃
    pub fn next_backoff(&mut self) -> Option<Duration> {
        let next = randomize(self.randomization_factor, self.current_interval);
        self.increment();

        if let Some(max_elapsed) = self.max_elapsed_time {
            if self.elapsed() + next > max_elapsed {
                return None;
            }
        }
        Some(next)
    }

    fn increment(&mut self) {
        let next = self.current_interval.as_secs_f64() * self.multiplier;
        if next >= self.max_interval.as_secs_f64() {
            self.current_interval = self.max_interval;
        } else {
            self.current_interval = Duration::from_secs_f64(next);
        }
    }
}

fn randomize(factor: f64, interval: Duration) -> Duration {
    if factor <= 0.0 {
        return interval;
    }
    let delta = factor * interval.as_secs_f64();
    let min = interval.as_secs_f64() - delta;
    let max = interval.as_secs_f64() + delta;
    Duration::from_secs_f64(rand::thread_rng().gen_range(min..=max))
}

/// 退避工厂：每次重连序列新建一个独立的退避状态
#[derive(Debug, Clone)]
pub struct BackoffFactory {
    clock: Arc<dyn Clock>,
    max_elapsed_time: Option<Duration>,
}

impl BackoffFactory {
    /// # 参数
    /// * `reconnect_timeout` - 重连总时限，零表示不限
    pub fn new(clock: Arc<dyn Clock>, reconnect_timeout: Duration) -> Self {
        Self {
            clock,
            max_elapsed_time: (!reconnect_timeout.is_zero()).then_some(reconnect_timeout),
        }
    }

    pub fn build(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(
            self.clock.clone(),
            RECONNECT_MULTIPLIER,
            RECONNECT_MAX_INTERVAL,
            self.max_elapsed_time,
        )
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::testing::ManualClock;
    use proptest::prelude::*;

    #[test]
    fn test_interval_grows_and_caps() {
        let clock = Arc::new(ManualClock::new());
        let mut b = ExponentialBackoff::new(clock, 2.0, Duration::from_secs(3), None).without_jitter();

        assert_eq!(b.next_backoff(), Some(Duration::from_millis(500)));
        assert_eq!(b.next_backoff(), Some(Duration::from_secs(1)));
        assert_eq!(b.next_backoff(), Some(Duration::from_secs(2)));
        assert_eq!(b.next_backoff(), Some(Duration::from_secs(3)));
        assert_eq!(b.next_backoff(), Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_done_after_max_elapsed() {
        let clock = Arc::new(ManualClock::new());
        let mut b = ExponentialBackoff::new(
            clock.clone(),
            RECONNECT_MULTIPLIER,
            RECONNECT_MAX_INTERVAL,
            Some(Duration::from_secs(5)),
        )
        .without_jitter();

        assert!(b.next_backoff().is_some());
        clock.advance(Duration::from_secs(6));
        assert_eq!(b.next_backoff(), None);

        b.reset();
        assert_eq!(b.next_backoff(), Some(DEFAULT_INITIAL_INTERVAL));
    }

    #[test]
    fn test_factory_zero_timeout_is_unbounded() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new());
        let factory = BackoffFactory::new(clock, Duration::ZERO);
        let b = factory.build();
        assert_eq!(b.max_elapsed_time, None);
        assert_eq!(b.multiplier, RECONNECT_MULTIPLIER);
        assert_eq!(b.max_interval, RECONNECT_MAX_INTERVAL);
    }

    proptest! {
        #[test]
        fn prop_interval_monotonic_and_bounded(steps in 1usize..200, max_ms in 500u64..20_000) {
            let clock = Arc::new(ManualClock::new());
            let max = Duration::from_millis(max_ms);
            let mut b = ExponentialBackoff::new(clock, RECONNECT_MULTIPLIER, max, None);
            let mut last = b.current_interval();
            for _ in 0..steps {
                let wait = b.next_backoff().unwrap();
                prop_assert!(wait.as_secs_f64() <= max.as_secs_f64() * 1.5 + 1e-6);
                let cur = b.current_interval();
                prop_assert!(cur >= last);
                prop_assert!(cur <= max);
                last = cur;
            }
        }
    }
}
