// 时钟与退避策略
//
// 所有"当前时间"和"等待"都通过 Clock 获取，
// 这样 NTP 校准后的时间能贯穿退避、流控等待和限速器

pub mod backoff;
pub mod ntp;

pub use backoff::{BackoffFactory, ExponentialBackoff};
pub use ntp::SyncedClock;

use async_trait::async_trait;
use std::fmt::Debug;
use std::time::{Duration, SystemTime};

/// 时间来源
#[async_trait]
pub trait Clock: Send + Sync + Debug {
    /// 当前时间
    fn now(&self) -> SystemTime;

    /// 等待指定时长
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// 系统时钟
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}
