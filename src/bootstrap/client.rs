// 客户端：持有凭证、DC 地址表和共享中间件链，负责向单个 DC 拨号

use super::dcs::{self, DcOption};
use super::proxy::Dialer;
use crate::clock::BackoffFactory;
use crate::error::XferError;
use crate::middleware::{Chain, Middlewares};
use crate::rpc::{
    AppCredentials, Call, Conn, ConnInvoker, DcId, DeviceConfig, DialTarget, ErrorKind, Invoker,
    Request, Response, RpcError, Transport,
};
use crate::storage::SessionStorage;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 客户端选项
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub home_dc: DcId,
    pub dc_list: Vec<DcOption>,
    pub dial_timeout: Duration,
    /// 重连间隔下限
    pub retry_interval: Duration,
    /// None 表示无限次重试（直到退避放弃）
    pub max_retries: Option<u32>,
    pub device: DeviceConfig,
    pub dialer: Dialer,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            home_dc: dcs::HOME_DC,
            dc_list: dcs::PRODUCTION.to_vec(),
            dial_timeout: Duration::from_secs(10),
            retry_interval: Duration::from_secs(5),
            max_retries: None,
            device: super::DEVICE,
            dialer: Dialer::Direct,
        }
    }
}

struct ClientInner {
    app: AppCredentials,
    mode: String,
    login: bool,
    options: ClientOptions,
    transport: Arc<dyn Transport>,
    middlewares: Middlewares,
    session: SessionStorage,
    backoff: BackoffFactory,
    dials: AtomicUsize,
}

/// 已配置好的客户端（可克隆，内部共享）
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        app: AppCredentials,
        mode: String,
        login: bool,
        options: ClientOptions,
        transport: Arc<dyn Transport>,
        middlewares: Middlewares,
        session: SessionStorage,
        backoff: BackoffFactory,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                app,
                mode,
                login,
                options,
                transport,
                middlewares,
                session,
                backoff,
                dials: AtomicUsize::new(0),
            }),
        }
    }

    pub fn app(&self) -> AppCredentials {
        self.inner.app
    }

    /// 凭证模式名
    pub fn mode(&self) -> &str {
        &self.inner.mode
    }

    pub fn is_login(&self) -> bool {
        self.inner.login
    }

    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    pub fn home_dc(&self) -> DcId {
        self.inner.options.home_dc
    }

    /// 中间件名称（按执行顺序）
    pub fn middleware_names(&self) -> Vec<&'static str> {
        self.inner.middlewares.iter().map(|m| m.name()).collect()
    }

    /// 发起过的拨号次数（含重试）
    pub fn dial_count(&self) -> usize {
        self.inner.dials.load(Ordering::SeqCst)
    }

    /// 用共享中间件链包装一条连接
    pub fn wrap(&self, conn: Arc<dyn Conn>) -> Chain {
        Chain::new(self.inner.middlewares.clone(), Arc::new(ConnInvoker(conn)))
    }

    /// 连接到指定 DC
    ///
    /// 拨号超时和网络错误按重连退避无限重试，直到退避放弃或被取消；
    /// 致命错误（如凭证被拒）立即返回
    pub async fn dial(&self, dc: DcId, cancel: &CancellationToken) -> Result<Arc<dyn Conn>, XferError> {
        let inner = &self.inner;
        let option = dcs::find(&inner.options.dc_list, dc).ok_or_else(|| XferError::Dial {
            dc,
            reason: "不在 DC 列表中".to_string(),
        })?;
        let session = inner.session.load()?;

        let mut backoff = inner.backoff.build();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            inner.dials.fetch_add(1, Ordering::SeqCst);

            let target = DialTarget {
                dc,
                addr: option.addr.to_string(),
                app: inner.app,
                device: inner.options.device.clone(),
                dialer: inner.options.dialer.clone(),
                session: session.clone(),
                login: inner.login,
            };

            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(XferError::Cancelled),
                r = tokio::time::timeout(inner.options.dial_timeout, inner.transport.connect(target)) => r,
            };

            let err = match result {
                Ok(Ok(conn)) => {
                    if let Some(data) = conn.session() {
                        if session.as_deref() != Some(data.as_slice()) {
                            inner.session.store(&data)?;
                            debug!("会话已保存: dc={}", dc);
                        }
                    }
                    info!("已连接 DC {} ({}), 第 {} 次尝试", dc, option.addr, attempt);
                    return Ok(conn);
                }
                Ok(Err(e)) => e,
                Err(_) => RpcError::Timeout,
            };

            if err.kind() == ErrorKind::Fatal {
                return Err(XferError::Dial {
                    dc,
                    reason: err.to_string(),
                });
            }
            if let Some(max) = inner.options.max_retries {
                if attempt > max {
                    return Err(XferError::Dial {
                        dc,
                        reason: format!("重试 {} 次后仍失败: {}", max, err),
                    });
                }
            }
            let Some(wait) = backoff.next_backoff() else {
                return Err(XferError::Dial {
                    dc,
                    reason: format!("重连超时: {}", err),
                });
            };

            warn!("连接 DC {} 失败 (第 {} 次): {}，{:?} 后重试", dc, attempt, err, wait);
            tokio::select! {
                _ = cancel.cancelled() => return Err(XferError::Cancelled),
                _ = inner.backoff.clock().sleep(wait) => {}
            }
        }
    }

    /// 确认当前会话已授权
    ///
    /// 登录模式下跳过；未授权时提示先登录
    pub async fn ensure_authorized(&self, invoker: &dyn Invoker, cancel: &CancellationToken) -> Result<(), XferError> {
        if self.inner.login {
            return Ok(());
        }
        let call = Call {
            dc: self.home_dc(),
            request: Request::AuthStatus,
            cancel: cancel.clone(),
        };
        match invoker.invoke(call).await {
            Ok(Response::Authorized(true)) => Ok(()),
            Ok(Response::Authorized(false)) => Err(XferError::Config(
                "当前命名空间未登录，请先执行 login".to_string(),
            )),
            Ok(_) => Err(XferError::from_rpc("auth", RpcError::UnexpectedResponse("Authorized"))),
            Err(e) => Err(XferError::from_rpc("auth", e)),
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("app", &self.inner.app.id)
            .field("mode", &self.inner.mode)
            .field("login", &self.inner.login)
            .field("home_dc", &self.inner.options.home_dc)
            .finish()
    }
}
