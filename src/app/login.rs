// login 命令与命名空间管理

use crate::bootstrap::{self, apps, BootstrapContext};
use crate::dcpool::DcPool;
use crate::error::XferError;
use crate::rpc::loopback::SELF_PEER;
use crate::rpc::{Peer, Request, Response};
use crate::storage::keys;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// 登录并保存凭证模式
///
/// # 参数
/// * `mode` - 凭证模式，见 `apps::modes()`
///
/// # 返回
/// 当前登录的账号
pub async fn run(ctx: &BootstrapContext, mode: &str, cancel: &CancellationToken) -> Result<Peer, XferError> {
    if apps::lookup(mode).is_none() {
        return Err(XferError::Config(format!(
            "未知的凭证模式: {}，可选: {}",
            mode,
            apps::modes().join(", ")
        )));
    }

    // 客户端按已保存的模式选择凭证，需要先写入；登录失败时恢复原来的模式
    let kv = ctx.storage().namespace(&ctx.network().namespace)?;
    let previous = kv.get(keys::app())?;
    kv.set(keys::app(), mode.as_bytes())?;

    match login_with_saved_mode(ctx, cancel).await {
        Ok(me) => {
            info!("登录成功: namespace={}, mode={}, id={}", kv.namespace(), mode, me.id);
            Ok(me)
        }
        Err(e) => {
            let restored = match &previous {
                Some(value) => kv.set(keys::app(), value),
                None => kv.delete(keys::app()).map(|_| ()),
            };
            if let Err(re) = restored {
                warn!("恢复凭证模式失败: {}", re);
            }
            Err(e)
        }
    }
}

async fn login_with_saved_mode(ctx: &BootstrapContext, cancel: &CancellationToken) -> Result<Peer, XferError> {
    let (client, _) = bootstrap::login(ctx, Vec::new()).await?;
    let pool = DcPool::new(client, ctx.network().pool_size);

    let result = async {
        let conn = pool.default(cancel).await?;
        let request = Request::ResolvePeer {
            username: SELF_PEER.to_string(),
        };
        match conn.invoke(request, cancel).await {
            Ok(Response::Peer(me)) => Ok(me),
            Ok(other) => Err(XferError::fatal("login", format!("意外的响应: {:?}", other))),
            Err(e) => Err(XferError::from_rpc("login", e)),
        }
    }
    .await;

    super::close_pool(&pool).await;
    result
}

/// 所有命名空间
pub fn namespaces(ctx: &BootstrapContext) -> Result<Vec<String>, XferError> {
    ctx.storage().namespaces()
}
