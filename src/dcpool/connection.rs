// 池中的单条连接

use crate::middleware::Chain;
use crate::rpc::{Call, Conn, DcId, Invoker, Request, Response, RpcError};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Connecting = 0,
    Ready = 1,
    Closed = 2,
}

impl ConnState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnState::Connecting,
            1 => ConnState::Ready,
            _ => ConnState::Closed,
        }
    }
}

pub struct Connection {
    dc: DcId,
    state: AtomicU8,
    raw: Arc<dyn Conn>,
    invoker: Chain,
    last_used: AtomicU64,
}

impl Connection {
    pub(crate) fn new(dc: DcId, raw: Arc<dyn Conn>, invoker: Chain) -> Self {
        Self {
            dc,
            state: AtomicU8::new(ConnState::Ready as u8),
            raw,
            invoker,
            last_used: AtomicU64::new(0),
        }
    }

    pub fn dc(&self) -> DcId {
        self.dc
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn touch(&self, tick: u64) {
        self.last_used.fetch_max(tick, Ordering::Relaxed);
    }

    pub(crate) fn last_used(&self) -> u64 {
        self.last_used.load(Ordering::Relaxed)
    }

    /// 在此连接上发起调用（经过中间件链）
    pub async fn invoke(&self, request: Request, cancel: &CancellationToken) -> Result<Response, RpcError> {
        if self.state() == ConnState::Closed {
            return Err(RpcError::Closed);
        }
        self.invoker
            .invoke(Call {
                dc: self.dc,
                request,
                cancel: cancel.clone(),
            })
            .await
    }

    /// 关闭连接（幂等，只有第一次真正关闭）
    pub async fn close(&self) -> Result<(), RpcError> {
        let prev = self.state.swap(ConnState::Closed as u8, Ordering::SeqCst);
        if prev == ConnState::Closed as u8 {
            return Ok(());
        }
        debug!("关闭 DC {} 连接", self.dc);
        self.raw.close().await
    }
}

#[async_trait::async_trait]
impl Invoker for Connection {
    async fn invoke(&self, call: Call) -> Result<Response, RpcError> {
        Connection::invoke(self, call.request, &call.cancel).await
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("dc", &self.dc)
            .field("state", &self.state())
            .field("last_used", &self.last_used())
            .finish()
    }
}
