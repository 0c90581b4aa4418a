// FLOOD_WAIT 处理
//
// 服务端要求等待时，记录该 DC 的"解封时间"，等到之后再重发；
// 同一 DC 上的后续调用先等到解封时间，其他 DC 不受影响

use super::{Middleware, Next};
use crate::clock::Clock;
use crate::rpc::{Call, DcId, Response, RpcError};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// 默认最长等待（超过则直接返回错误）
pub const DEFAULT_CEILING: Duration = Duration::from_secs(300);

pub struct FloodWaiter {
    clock: Arc<dyn Clock>,
    ceiling: Duration,
    blocked_until: DashMap<DcId, Instant>,
}

impl FloodWaiter {
    pub fn new(clock: Arc<dyn Clock>, ceiling: Duration) -> Self {
        Self {
            clock,
            ceiling,
            blocked_until: DashMap::new(),
        }
    }

    /// 某个 DC 是否仍处于等待期
    pub fn is_blocked(&self, dc: DcId) -> bool {
        self.blocked_until
            .get(&dc)
            .map(|until| *until > Instant::now())
            .unwrap_or(false)
    }

    fn block(&self, dc: DcId, wait: Duration) {
        let until = Instant::now() + wait;
        self.blocked_until
            .entry(dc)
            .and_modify(|d| {
                if *d < until {
                    *d = until;
                }
            })
            .or_insert(until);
    }

    async fn wait_unblocked(&self, call: &Call) -> Result<(), RpcError> {
        // 取出后立即释放分片锁
        let until = self.blocked_until.get(&call.dc).map(|d| *d);
        let Some(until) = until else {
            return Ok(());
        };

        let now = Instant::now();
        if until <= now {
            self.blocked_until.remove_if(&call.dc, |_, d| *d <= now);
            return Ok(());
        }

        debug!("dc={} 处于 FLOOD_WAIT，等待 {:?}", call.dc, until - now);
        tokio::select! {
            _ = call.cancel.cancelled() => Err(RpcError::Cancelled),
            _ = self.clock.sleep(until - now) => Ok(()),
        }
    }
}

#[async_trait]
impl Middleware for FloodWaiter {
    fn name(&self) -> &'static str {
        "flood_waiter"
    }

    async fn intercept(&self, call: Call, next: Next<'_>) -> Result<Response, RpcError> {
        loop {
            self.wait_unblocked(&call).await?;

            let err = match next.run(call.clone()).await {
                Err(e) => e,
                ok => return ok,
            };
            let Some(secs) = err.flood_wait() else {
                return Err(err);
            };

            let wait = Duration::from_secs(secs);
            if wait > self.ceiling {
                warn!(
                    "{} 需要等待 {}s，超过上限 {:?} (dc={})",
                    call.request.name(),
                    secs,
                    self.ceiling,
                    call.dc
                );
                return Err(err);
            }

            warn!("{} 触发 FLOOD_WAIT，dc={} 暂停 {}s", call.request.name(), call.dc, secs);
            self.block(call.dc, wait);
        }
    }
}
