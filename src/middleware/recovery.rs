// 崩溃恢复 + 断线重连等待
//
// - 内层调用 panic：捕获后转为 RpcError::Crashed，不让整个进程崩溃
// - 连接断开 / 崩溃：按退避策略等待后重发，直到退避放弃

use super::{Middleware, Next};
use crate::clock::BackoffFactory;
use crate::rpc::{Call, Response, RpcError};
use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use tracing::{debug, error, warn};

pub struct Recovery {
    backoff: BackoffFactory,
}

impl Recovery {
    pub fn new(backoff: BackoffFactory) -> Self {
        Self { backoff }
    }
}

#[async_trait]
impl Middleware for Recovery {
    fn name(&self) -> &'static str {
        "recovery"
    }

    async fn intercept(&self, call: Call, next: Next<'_>) -> Result<Response, RpcError> {
        let mut backoff = self.backoff.build();
        let mut attempt = 1u32;

        loop {
            let result = match AssertUnwindSafe(next.run(call.clone())).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => {
                    let msg = panic_message(panic.as_ref());
                    error!("{} 调用崩溃 (dc={}): {}", call.request.name(), call.dc, msg);
                    Err(RpcError::Crashed(msg))
                }
            };

            let err = match result {
                Err(e) if e.needs_recovery() => e,
                other => return other,
            };

            let Some(wait) = backoff.next_backoff() else {
                warn!(
                    "{} 恢复失败，已等待 {:?} (dc={}): {}",
                    call.request.name(),
                    backoff.elapsed(),
                    call.dc,
                    err
                );
                return Err(err);
            };

            debug!(
                "{} 第 {} 次恢复，{:?} 后重试 (dc={}): {}",
                call.request.name(),
                attempt,
                wait,
                call.dc,
                err
            );
            attempt += 1;

            tokio::select! {
                _ = call.cancel.cancelled() => return Err(RpcError::Cancelled),
                _ = self.backoff.clock().sleep(wait) => {}
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "未知 panic".to_string()
    }
}
