// 有限次数重试：只处理网络类临时错误，不等待

use super::{Middleware, Next};
use crate::rpc::{Call, Response, RpcError};
use async_trait::async_trait;
use tracing::debug;

/// 默认最大尝试次数
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

pub struct BoundedRetry {
    max_attempts: u32,
}

impl BoundedRetry {
    /// # 参数
    /// * `max_attempts` - 总尝试次数（含第一次），至少为 1
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }
}

#[async_trait]
impl Middleware for BoundedRetry {
    fn name(&self) -> &'static str {
        "bounded_retry"
    }

    async fn intercept(&self, call: Call, next: Next<'_>) -> Result<Response, RpcError> {
        let mut attempt = 1;
        loop {
            match next.run(call.clone()).await {
                Err(e) if e.is_transient_network() && attempt < self.max_attempts => {
                    debug!(
                        "{} 失败，第 {}/{} 次重试 (dc={}): {}",
                        call.request.name(),
                        attempt,
                        self.max_attempts,
                        call.dc,
                        e
                    );
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::testing::*;
    use crate::middleware::{Chain, ChainBuilder};
    use crate::rpc::Invoker;

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let terminal = ScriptedInvoker::new(vec![
            Err(RpcError::Network("reset".into())),
            Err(RpcError::Timeout),
        ]);
        let chain = Chain::new(ChainBuilder::new().retry(5).build(), terminal.clone());
        assert!(matches!(chain.invoke(ping(2)).await, Ok(Response::Pong)));
        assert_eq!(terminal.calls(), 3);
    }

    #[tokio::test]
    async fn test_budget_exhausted() {
        let script = (0..10).map(|_| Err(RpcError::Timeout)).collect();
        let terminal = ScriptedInvoker::new(script);
        let chain = Chain::new(ChainBuilder::new().retry(5).build(), terminal.clone());
        assert!(matches!(chain.invoke(ping(2)).await, Err(RpcError::Timeout)));
        assert_eq!(terminal.calls(), 5);
    }

    #[tokio::test]
    async fn test_fatal_not_retried() {
        let terminal = ScriptedInvoker::new(vec![Err(RpcError::rpc(403, "CHAT_WRITE_FORBIDDEN"))]);
        let chain = Chain::new(ChainBuilder::new().retry(5).build(), terminal.clone());
        assert!(chain.invoke(ping(2)).await.is_err());
        assert_eq!(terminal.calls(), 1);
    }

    #[tokio::test]
    async fn test_flood_wait_left_to_waiter() {
        let terminal = ScriptedInvoker::new(vec![Err(RpcError::FloodWait(3))]);
        let chain = Chain::new(ChainBuilder::new().retry(5).build(), terminal.clone());
        assert!(matches!(chain.invoke(ping(2)).await, Err(RpcError::FloodWait(3))));
        assert_eq!(terminal.calls(), 1);
    }
}
