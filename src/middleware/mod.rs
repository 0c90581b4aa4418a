// 调用中间件链
//
// 中间件在客户端构建时组装一次，之后所有连接共享同一份只读链：
//
//   [调用方追加的中间件..., Recovery, BoundedRetry(n), FloodWaiter, (RateLimiter)] -> 连接
//
// 每个中间件只做一件事：拿到调用，决定何时、调用几次 next

pub mod flood;
pub mod ratelimit;
pub mod recovery;
pub mod retry;

pub use flood::FloodWaiter;
pub use ratelimit::RateLimiter;
pub use recovery::Recovery;
pub use retry::BoundedRetry;

use crate::clock::{BackoffFactory, Clock};
use crate::rpc::{Call, Invoker, Response, RpcError};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// 调用拦截器
#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &'static str;

    /// 处理一次调用，通过 `next.run` 交给链上的下一环
    async fn intercept(&self, call: Call, next: Next<'_>) -> Result<Response, RpcError>;
}

/// 链上剩余的部分（可多次调用以实现重试）
#[derive(Clone, Copy)]
pub struct Next<'a> {
    stages: &'a [Arc<dyn Middleware>],
    terminal: &'a dyn Invoker,
}

impl<'a> Next<'a> {
    pub fn run(self, call: Call) -> BoxFuture<'a, Result<Response, RpcError>> {
        match self.stages.split_first() {
            Some((stage, rest)) => stage.intercept(
                call,
                Next {
                    stages: rest,
                    terminal: self.terminal,
                },
            ),
            None => self.terminal.invoke(call),
        }
    }
}

/// 共享的中间件列表
pub type Middlewares = Arc<[Arc<dyn Middleware>]>;

/// 中间件链 + 终点，本身也是一个 Invoker
#[derive(Clone)]
pub struct Chain {
    stages: Middlewares,
    terminal: Arc<dyn Invoker>,
}

impl Chain {
    pub fn new(stages: Middlewares, terminal: Arc<dyn Invoker>) -> Self {
        Self { stages, terminal }
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }
}

#[async_trait]
impl Invoker for Chain {
    async fn invoke(&self, call: Call) -> Result<Response, RpcError> {
        debug!("调用 {} (dc={})", call.request.name(), call.dc);
        Next {
            stages: &self.stages,
            terminal: self.terminal.as_ref(),
        }
        .run(call)
        .await
    }
}

/// 按顺序组装中间件
#[derive(Default)]
pub struct ChainBuilder {
    stages: Vec<Arc<dyn Middleware>>,
}

impl ChainBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加调用方提供的中间件
    pub fn extend(mut self, extra: impl IntoIterator<Item = Arc<dyn Middleware>>) -> Self {
        self.stages.extend(extra);
        self
    }

    pub fn recovery(mut self, backoff: BackoffFactory) -> Self {
        self.stages.push(Arc::new(Recovery::new(backoff)));
        self
    }

    pub fn retry(mut self, max_attempts: u32) -> Self {
        self.stages.push(Arc::new(BoundedRetry::new(max_attempts)));
        self
    }

    pub fn flood_wait(mut self, clock: Arc<dyn Clock>, ceiling: Duration) -> Self {
        self.stages.push(Arc::new(FloodWaiter::new(clock, ceiling)));
        self
    }

    pub fn rate_limit(mut self, clock: Arc<dyn Clock>, interval: Duration, burst: u32) -> Self {
        self.stages
            .push(Arc::new(RateLimiter::new(clock, interval, burst)));
        self
    }

    pub fn build(self) -> Middlewares {
        self.stages.into()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 按脚本依次返回结果的终点，脚本耗尽后返回 Pong
    #[derive(Default)]
    pub struct ScriptedInvoker {
        script: Mutex<VecDeque<Result<Response, RpcError>>>,
        pub calls: AtomicUsize,
    }

    impl ScriptedInvoker {
        pub fn new(script: Vec<Result<Response, RpcError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
            })
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Invoker for ScriptedInvoker {
        async fn invoke(&self, _call: Call) -> Result<Response, RpcError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script.lock().pop_front().unwrap_or(Ok(Response::Pong))
        }
    }

    pub fn ping(dc: crate::rpc::DcId) -> Call {
        Call {
            dc,
            request: crate::rpc::Request::Ping,
            cancel: tokio_util::sync::CancellationToken::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use parking_lot::Mutex;

    struct Tag(&'static str, Arc<Mutex<Vec<&'static str>>>);

    #[async_trait]
    impl Middleware for Tag {
        fn name(&self) -> &'static str {
            self.0
        }

        async fn intercept(&self, call: Call, next: Next<'_>) -> Result<Response, RpcError> {
            self.1.lock().push(self.0);
            next.run(call).await
        }
    }

    #[tokio::test]
    async fn test_chain_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let stages = ChainBuilder::new()
            .extend([
                Arc::new(Tag("a", seen.clone())) as Arc<dyn Middleware>,
                Arc::new(Tag("b", seen.clone())),
            ])
            .retry(3)
            .build();

        let terminal = ScriptedInvoker::new(vec![]);
        let chain = Chain::new(stages, terminal.clone());
        assert_eq!(chain.stage_names(), vec!["a", "b", "bounded_retry"]);

        chain.invoke(ping(2)).await.unwrap();
        assert_eq!(*seen.lock(), vec!["a", "b"]);
        assert_eq!(terminal.calls(), 1);
    }

    #[tokio::test]
    async fn test_empty_chain_reaches_terminal() {
        let terminal = ScriptedInvoker::new(vec![Err(RpcError::rpc(400, "BAD"))]);
        let chain = Chain::new(ChainBuilder::new().build(), terminal.clone());
        assert!(chain.invoke(ping(1)).await.is_err());
        assert_eq!(terminal.calls(), 1);
    }
}
