//! 命令执行
//!
//! 每个命令的流程相同：
//! 打开存储 -> 创建客户端 -> 建立连接池 -> 校验授权 -> 执行 -> 关闭连接池

pub mod dl;
pub mod login;
pub mod up;

pub use dl::DownloadArgs;
pub use up::UploadArgs;

use crate::bootstrap::{self, dcs, BootstrapContext};
use crate::config::AppConfig;
use crate::dcpool::DcPool;
use crate::error::XferError;
use crate::progress::Reporter;
use crate::rpc::loopback::SELF_PEER;
use crate::rpc::{LoopbackTransport, Peer, Request, Response};
use crate::storage::{Kv, PeerCache, Storage};
use crate::transfer::RunSummary;
use std::future::Future;
use std::io::IsTerminal;
use std::ops::RangeInclusive;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 按配置创建启动上下文
pub fn context(config: &AppConfig) -> Result<BootstrapContext, XferError> {
    let storage = Storage::open(&config.storage.path)?;
    let dc_list = if config.network.test {
        dcs::TEST
    } else {
        dcs::PRODUCTION
    };
    let transport = LoopbackTransport::new(&config.storage.remote_dir, dcs::ids(dc_list));
    Ok(BootstrapContext::new(config.network.clone(), storage, Arc::new(transport)))
}

/// 已授权的连接池
pub struct Session {
    pub pool: Arc<DcPool>,
    pub kv: Kv,
}

/// 创建客户端和连接池，并确认已登录
pub async fn connect(ctx: &BootstrapContext, cancel: &CancellationToken) -> Result<Session, XferError> {
    let (client, kv) = bootstrap::no_login(ctx, Vec::new()).await?;
    let pool = Arc::new(DcPool::new(client, ctx.network().pool_size));

    let authorized = async {
        let conn = pool.default(cancel).await?;
        pool.client().ensure_authorized(conn.as_ref(), cancel).await
    }
    .await;
    if let Err(e) = authorized {
        close_pool(&pool).await;
        return Err(e);
    }

    Ok(Session { pool, kv })
}

/// 解析会话名，空表示自己；结果缓存在当前命名空间
pub async fn resolve_peer(
    session: &Session,
    chat: &str,
    cancel: &CancellationToken,
) -> Result<Peer, XferError> {
    let name = match chat.trim() {
        "" => SELF_PEER,
        name => name,
    };
    let cache = PeerCache::new(session.kv.clone());
    if let Some(peer) = cache.get(name)? {
        debug!("对端缓存命中: {} -> {}", name, peer.id);
        return Ok(peer);
    }

    let conn = session.pool.default(cancel).await?;
    let request = Request::ResolvePeer {
        username: name.to_string(),
    };
    let peer = match conn.invoke(request, cancel).await {
        Ok(Response::Peer(peer)) => peer,
        Ok(other) => return Err(XferError::fatal(name, format!("意外的响应: {:?}", other))),
        Err(e) => return Err(XferError::from_rpc(name, e)),
    };
    cache.put(name, &peer)?;
    info!("解析对端: {} -> {}", name, peer.id);
    Ok(peer)
}

/// 解析消息 ID 范围：`42` 或 `1-100`
pub fn parse_ranges(raw: &[String]) -> Result<Vec<RangeInclusive<i64>>, XferError> {
    raw.iter()
        .flat_map(|s| s.split(','))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            let invalid = || XferError::Config(format!("非法的消息范围: {}", s));
            let (start, end) = match s.split_once('-') {
                Some((a, b)) => (a.trim(), b.trim()),
                None => (s, s),
            };
            let start: i64 = start.parse().map_err(|_| invalid())?;
            let end: i64 = end.parse().map_err(|_| invalid())?;
            if start <= 0 || end < start {
                return Err(invalid());
            }
            Ok(start..=end)
        })
        .collect()
}

/// 执行传输，同时渲染进度
///
/// # 参数
/// * `expected` - 预计的项数（下载时为上限）
/// * `run` - 传输过程，进度通过传入的 Reporter 上报
pub async fn with_progress<F, Fut>(expected: usize, run: F) -> Result<RunSummary, XferError>
where
    F: FnOnce(Arc<Reporter>) -> Fut,
    Fut: Future<Output = Result<RunSummary, XferError>>,
{
    let reporter = Reporter::new(std::io::stderr().is_terminal());
    reporter.set_expected(expected);

    let render_cancel = CancellationToken::new();
    let render = {
        let reporter = reporter.clone();
        let token = render_cancel.clone();
        tokio::spawn(async move { reporter.render(&token).await })
    };

    let result = run(reporter.clone()).await;

    match &result {
        Ok(summary) => {
            // 迭代器可能提前结束（无媒体的消息、取消），按实际处理的项数收口
            reporter.set_expected(summary.succeeded + summary.skipped + summary.failed.len());
            reporter.wait().await;
        }
        Err(_) => render_cancel.cancel(),
    }
    if let Err(e) = render.await {
        warn!("进度渲染任务异常退出: {}", e);
    }
    reporter.close();
    result
}

/// 关闭连接池，错误只记录
pub async fn close_pool(pool: &DcPool) {
    if let Err(e) = pool.close().await {
        warn!("{}", e);
    }
}
