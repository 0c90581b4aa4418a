//! 客户端启动
//!
//! 按固定顺序完成：打开命名空间 -> 选择时钟 -> 读取凭证模式 -> 解析代理 -> 组装选项。
//! 凭证模式、代理等配置错误都在任何网络调用之前返回

pub mod apps;
pub mod client;
pub mod dcs;
pub mod proxy;

pub use client::{Client, ClientOptions};
pub use proxy::Dialer;

use crate::clock::{BackoffFactory, Clock, SyncedClock, SystemClock};
use crate::config::NetworkConfig;
use crate::error::XferError;
use crate::middleware::{ChainBuilder, Middleware};
use crate::middleware::ratelimit::{TEST_NETWORK_BURST, TEST_NETWORK_INTERVAL};
use crate::middleware::retry::DEFAULT_MAX_ATTEMPTS;
use crate::rpc::{DeviceConfig, Transport};
use crate::storage::{keys, Kv, SessionStorage, Storage};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::info;

/// 设备标识
pub const DEVICE: DeviceConfig = DeviceConfig {
    device_model: "dcxfer",
    system_version: std::env::consts::OS,
    app_version: env!("CARGO_PKG_VERSION"),
    lang_code: "en",
    system_lang_code: "en",
};

/// 单次运行的启动上下文
pub struct BootstrapContext {
    network: NetworkConfig,
    storage: Storage,
    transport: Arc<dyn Transport>,
    clock: OnceCell<Arc<dyn Clock>>,
}

impl BootstrapContext {
    pub fn new(network: NetworkConfig, storage: Storage, transport: Arc<dyn Transport>) -> Self {
        Self {
            network,
            storage,
            transport,
            clock: OnceCell::new(),
        }
    }

    /// 指定时钟（跳过 NTP）
    pub fn with_clock(self, clock: Arc<dyn Clock>) -> Self {
        Self {
            clock: OnceCell::new_with(Some(clock)),
            ..self
        }
    }

    pub fn network(&self) -> &NetworkConfig {
        &self.network
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// 本次运行使用的时钟，只解析一次
    pub async fn clock(&self) -> Result<Arc<dyn Clock>, XferError> {
        self.clock
            .get_or_try_init(|| clock(&self.network))
            .await
            .cloned()
    }
}

/// 选择时钟：配置了 NTP 服务器时先同步
pub async fn clock(network: &NetworkConfig) -> Result<Arc<dyn Clock>, XferError> {
    let host = network.ntp.trim();
    if host.is_empty() {
        return Ok(Arc::new(SystemClock));
    }
    let synced = SyncedClock::sync(host, crate::clock::ntp::SYNC_TIMEOUT).await?;
    Ok(Arc::new(synced))
}

/// 重连退避
pub fn backoff(clock: Arc<dyn Clock>, network: &NetworkConfig) -> BackoffFactory {
    BackoffFactory::new(clock, network.reconnect_timeout())
}

/// 默认中间件：[Recovery, BoundedRetry(5), FloodWaiter]
pub async fn default_middlewares(ctx: &BootstrapContext) -> Result<Vec<Arc<dyn Middleware>>, XferError> {
    let clock = ctx.clock().await?;
    Ok(ChainBuilder::new()
        .recovery(backoff(clock.clone(), &ctx.network))
        .retry(DEFAULT_MAX_ATTEMPTS)
        .flood_wait(clock, ctx.network.flood_wait_ceiling())
        .build()
        .to_vec())
}

/// 创建客户端
///
/// # 参数
/// * `login` - 登录模式（忽略已保存的会话）
/// * `middlewares` - 完整的中间件列表，按执行顺序
///
/// # 返回
/// 客户端和当前命名空间的 KV
pub async fn new_client(
    ctx: &BootstrapContext,
    login: bool,
    middlewares: Vec<Arc<dyn Middleware>>,
) -> Result<(Client, Kv), XferError> {
    let kv = ctx.storage.namespace(&ctx.network.namespace)?;
    let clock = ctx.clock().await?;

    let mode = match kv.get(keys::app())? {
        Some(raw) => String::from_utf8_lossy(&raw).into_owned(),
        None => apps::APP_BUILTIN.to_string(),
    };
    let mut app = apps::lookup(&mode).ok_or_else(|| {
        XferError::Config(format!("找不到凭证模式: {}，请尝试重新登录", mode))
    })?;

    let dialer = Dialer::parse(&ctx.network.proxy)?;

    let mut options = ClientOptions {
        dialer,
        ..ClientOptions::default()
    };
    let mut builder = ChainBuilder::new().extend(middlewares);

    if ctx.network.test {
        app = apps::TEST_APP;
        options.home_dc = dcs::HOME_DC;
        options.dc_list = dcs::TEST.to_vec();
        // 测试网络限流严格，额外限速
        builder = builder.rate_limit(clock.clone(), TEST_NETWORK_INTERVAL, TEST_NETWORK_BURST);
    }

    info!(
        "创建客户端: app={}, mode={}, login={}, namespace={}",
        app.id,
        mode,
        login,
        kv.namespace()
    );

    let client = Client::new(
        app,
        mode,
        login,
        options,
        ctx.transport.clone(),
        builder.build(),
        SessionStorage::new(kv.clone(), login),
        backoff(clock, &ctx.network),
    );
    Ok((client, kv))
}

/// 使用已保存会话的客户端，调用方中间件排在默认中间件之前
pub async fn no_login(
    ctx: &BootstrapContext,
    extra: Vec<Arc<dyn Middleware>>,
) -> Result<(Client, Kv), XferError> {
    let mut middlewares = extra;
    middlewares.extend(default_middlewares(ctx).await?);
    new_client(ctx, false, middlewares).await
}

/// 登录模式的客户端
pub async fn login(
    ctx: &BootstrapContext,
    extra: Vec<Arc<dyn Middleware>>,
) -> Result<(Client, Kv), XferError> {
    let mut middlewares = extra;
    middlewares.extend(default_middlewares(ctx).await?);
    new_client(ctx, true, middlewares).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::LoopbackTransport;
    use tempfile::TempDir;

    fn ctx(dir: &TempDir, network: NetworkConfig) -> BootstrapContext {
        let storage = Storage::open_in_memory().unwrap();
        let transport = Arc::new(LoopbackTransport::new(dir.path(), dcs::ids(dcs::PRODUCTION)));
        BootstrapContext::new(network, storage, transport)
    }

    #[tokio::test]
    async fn test_default_client() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx(&dir, NetworkConfig::default());
        let (client, kv) = no_login(&ctx, vec![]).await.unwrap();

        assert_eq!(client.mode(), apps::APP_BUILTIN);
        assert_eq!(client.home_dc(), 2);
        assert_eq!(kv.namespace(), "default");
        assert_eq!(
            client.middleware_names(),
            vec!["recovery", "bounded_retry", "flood_waiter"]
        );
        assert_eq!(client.options().dial_timeout, std::time::Duration::from_secs(10));
        assert_eq!(client.options().max_retries, None);
        assert_eq!(client.dial_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_mode_fails_before_network() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx(&dir, NetworkConfig::default());
        ctx.storage()
            .namespace("default")
            .unwrap()
            .set(keys::app(), b"nonexistent")
            .unwrap();

        let err = no_login(&ctx, vec![]).await.unwrap_err();
        match err {
            XferError::Config(msg) => {
                assert!(msg.contains("nonexistent"));
                assert!(msg.contains("重新登录"));
            }
            other => panic!("意外的错误: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_bad_proxy() {
        let dir = TempDir::new().unwrap();
        let network = NetworkConfig {
            proxy: "ftp://nope".to_string(),
            ..NetworkConfig::default()
        };
        let err = no_login(&ctx(&dir, network), vec![]).await.unwrap_err();
        assert!(matches!(err, XferError::Proxy(_)));
    }

    #[tokio::test]
    async fn test_test_network_mode() {
        let dir = TempDir::new().unwrap();
        let network = NetworkConfig {
            test: true,
            ..NetworkConfig::default()
        };
        let (client, _) = login(&ctx(&dir, network), vec![]).await.unwrap();
        assert_eq!(client.app(), apps::TEST_APP);
        assert_eq!(client.options().dc_list, dcs::TEST.to_vec());
        assert_eq!(client.middleware_names().last(), Some(&"rate_limiter"));
        assert!(client.is_login());
    }

    #[tokio::test]
    async fn test_login_persists_session() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx(&dir, NetworkConfig::default());
        let (client, kv) = login(&ctx, vec![]).await.unwrap();

        let cancel = tokio_util::sync::CancellationToken::new();
        client.dial(2, &cancel).await.unwrap();
        assert!(kv.get(keys::session()).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_dial_unknown_dc() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx(&dir, NetworkConfig::default());
        let (client, _) = no_login(&ctx, vec![]).await.unwrap();
        let cancel = tokio_util::sync::CancellationToken::new();
        let err = match client.dial(42, &cancel).await {
            Err(e) => e,
            Ok(_) => panic!("DC 42 不应拨号成功"),
        };
        assert!(matches!(err, XferError::Dial { dc: 42, .. }));
        assert_eq!(client.dial_count(), 0);
    }
}
