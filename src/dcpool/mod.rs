//! DC 连接池
//!
//! 每个 DC 最多一条连接，按需建立：
//! - 已就绪的连接放在 DashMap 中，读取时不加全局锁
//! - 同一 DC 的拨号由该 DC 的异步锁串行化，第二个请求者等待并复用结果
//! - 容量已满时，新连接拨号成功后回收最久未使用、且没有外部持有者的非主 DC 连接
//!
//! 连接以 `Arc<Connection>` 的形式借出，Arc 之外的持有者即为"租约"

mod connection;

pub use connection::{ConnState, Connection};

use crate::bootstrap::Client;
use crate::error::XferError;
use crate::rpc::DcId;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct DcPool {
    client: Client,
    /// 0 表示不限
    capacity: usize,
    conns: DashMap<DcId, Arc<Connection>>,
    dialing: DashMap<DcId, Arc<Mutex<()>>>,
    /// 容量检查与插入需要原子完成
    admission: parking_lot::Mutex<()>,
    tick: AtomicU64,
}

impl DcPool {
    /// # 参数
    /// * `client` - 已配置好的客户端
    /// * `capacity` - 最大连接数，0 表示不限
    pub fn new(client: Client, capacity: usize) -> Self {
        info!("创建 DC 连接池: home_dc={}, capacity={}", client.home_dc(), capacity);
        Self {
            client,
            capacity,
            conns: DashMap::new(),
            dialing: DashMap::new(),
            admission: parking_lot::Mutex::new(()),
            tick: AtomicU64::new(0),
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn home_dc(&self) -> DcId {
        self.client.home_dc()
    }

    /// 当前连接数
    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// 是否持有某个 DC 的连接
    pub fn contains(&self, dc: DcId) -> bool {
        self.conns.contains_key(&dc)
    }

    /// 主 DC 连接
    pub async fn default(&self, cancel: &CancellationToken) -> Result<Arc<Connection>, XferError> {
        self.connection(cancel, self.home_dc()).await
    }

    /// 指定 DC 的连接，不存在则建立
    pub async fn connection(&self, cancel: &CancellationToken, dc: DcId) -> Result<Arc<Connection>, XferError> {
        if let Some(conn) = self.lease(dc) {
            return Ok(conn);
        }

        let lock = self
            .dialing
            .entry(dc)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = tokio::select! {
            _ = cancel.cancelled() => return Err(XferError::Cancelled),
            g = lock.lock() => g,
        };

        // 等锁期间可能已被其他请求者建立
        if let Some(conn) = self.lease(dc) {
            return Ok(conn);
        }

        self.check_room(dc)?;

        let raw = self.client.dial(dc, cancel).await?;
        let conn = Arc::new(Connection::new(dc, raw.clone(), self.client.wrap(raw)));
        conn.touch(self.next_tick());

        // 拨号成功后才回收旧连接；拨号期间其他 DC 可能占满了位置
        let admitted = {
            let _admission = self.admission.lock();
            let victim = if self.at_capacity() {
                self.pick_victim(dc).map(Some)
            } else {
                Some(None)
            };
            if victim.is_some() {
                self.conns.insert(dc, conn.clone());
            }
            victim
        };
        match admitted {
            Some(Some(victim)) => self.close_one(victim).await,
            Some(None) => {}
            None => {
                self.close_one(conn).await;
                return Err(XferError::DcUnavailable {
                    dc,
                    reason: format!("连接池已满 ({})，且没有可回收的连接", self.capacity),
                });
            }
        }

        debug!("DC {} 连接已加入连接池 (共 {} 条)", dc, self.conns.len());
        Ok(conn)
    }

    /// 关闭所有连接，汇总全部错误
    pub async fn close(&self) -> Result<(), XferError> {
        let dcs: Vec<DcId> = self.conns.iter().map(|e| *e.key()).collect();
        let mut errors = Vec::new();
        for dc in dcs {
            if let Some((_, conn)) = self.conns.remove(&dc) {
                if let Err(e) = conn.close().await {
                    errors.push(format!("dc{}: {}", dc, e));
                }
            }
        }

        if errors.is_empty() {
            info!("DC 连接池已关闭");
            Ok(())
        } else {
            warn!("DC 连接池关闭时出现 {} 个错误", errors.len());
            Err(XferError::Close(errors))
        }
    }

    fn next_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn lease(&self, dc: DcId) -> Option<Arc<Connection>> {
        let conn = self.conns.get(&dc).map(|c| c.clone())?;
        if conn.state() == ConnState::Closed {
            return None;
        }
        conn.touch(self.next_tick());
        Some(conn)
    }

    fn at_capacity(&self) -> bool {
        self.capacity > 0 && self.conns.len() >= self.capacity
    }

    /// 拨号前检查：容量已满且没有可回收连接时直接返回 DcUnavailable
    ///
    /// 只检查不回收，拨号失败时不会丢掉健康的连接
    fn check_room(&self, dc: DcId) -> Result<(), XferError> {
        if !self.at_capacity() || self.has_victim(dc) {
            return Ok(());
        }
        Err(XferError::DcUnavailable {
            dc,
            reason: format!("连接池已满 ({})，且没有可回收的连接", self.capacity),
        })
    }

    fn is_evictable(&self, dc: DcId, incoming: DcId, conn: &Arc<Connection>) -> bool {
        dc != self.home_dc() && dc != incoming && Arc::strong_count(conn) == 1
    }

    fn has_victim(&self, incoming: DcId) -> bool {
        self.conns
            .iter()
            .any(|e| self.is_evictable(*e.key(), incoming, e.value()))
    }

    /// 选出并移除回收对象：非主 DC、无外部持有者、最久未使用
    fn pick_victim(&self, incoming: DcId) -> Option<Arc<Connection>> {
        let candidate = self
            .conns
            .iter()
            .filter(|e| self.is_evictable(*e.key(), incoming, e.value()))
            .min_by_key(|e| e.value().last_used())
            .map(|e| *e.key())?;
        // 迭代器已释放，可以安全移除
        self.conns
            .remove_if(&candidate, |_, c| Arc::strong_count(c) == 1)
            .map(|(_, c)| c)
    }

    async fn close_one(&self, conn: Arc<Connection>) {
        info!("回收 DC {} 连接", conn.dc());
        if let Err(e) = conn.close().await {
            warn!("回收 DC {} 连接时出错: {}", conn.dc(), e);
        }
    }
}

impl std::fmt::Debug for DcPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DcPool")
            .field("capacity", &self.capacity)
            .field("dcs", &self.conns.iter().map(|e| *e.key()).collect::<Vec<_>>())
            .finish()
    }
}
