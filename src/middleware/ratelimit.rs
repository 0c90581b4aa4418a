// 令牌桶限速（测试网络要求）

use super::{Middleware, Next};
use crate::clock::Clock;
use crate::rpc::{Call, Response, RpcError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// 测试网络限速：每 100ms 一个令牌
pub const TEST_NETWORK_INTERVAL: Duration = Duration::from_millis(100);

/// 测试网络限速：桶容量
pub const TEST_NETWORK_BURST: u32 = 5;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

pub struct RateLimiter {
    clock: Arc<dyn Clock>,
    interval: Duration,
    burst: u32,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(clock: Arc<dyn Clock>, interval: Duration, burst: u32) -> Self {
        let burst = burst.max(1);
        Self {
            clock,
            interval,
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// 尝试取一个令牌，失败时返回还需等待的时长
    fn try_take(&self) -> Result<(), Duration> {
        let mut bucket = self.bucket.lock();
        let now = Instant::now();
        let refill = (now - bucket.last_refill).as_secs_f64() / self.interval.as_secs_f64();
        bucket.tokens = (bucket.tokens + refill).min(self.burst as f64);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            Err(self.interval.mul_f64(1.0 - bucket.tokens))
        }
    }

    async fn acquire(&self, call: &Call) -> Result<(), RpcError> {
        loop {
            let wait = match self.try_take() {
                Ok(()) => return Ok(()),
                Err(wait) => wait,
            };
            tokio::select! {
                _ = call.cancel.cancelled() => return Err(RpcError::Cancelled),
                _ = self.clock.sleep(wait) => {}
            }
        }
    }
}

#[async_trait]
impl Middleware for RateLimiter {
    fn name(&self) -> &'static str {
        "rate_limiter"
    }

    async fn intercept(&self, call: Call, next: Next<'_>) -> Result<Response, RpcError> {
        self.acquire(&call).await?;
        next.run(call).await
    }
}
