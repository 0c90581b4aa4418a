// 集成测试共用的假网络
//
// 记录拨号、调用、并发峰值和分片写入次数，行为可以按需注入

#![allow(dead_code)]

use async_trait::async_trait;
use dashmap::DashMap;
use dcxfer::bootstrap::{self, BootstrapContext};
use dcxfer::clock::SystemClock;
use dcxfer::config::NetworkConfig;
use dcxfer::rpc::{
    Call, Conn, DcId, DialTarget, FileLocation, Media, Message, Peer, Request, Response, RpcError,
    Transport,
};
use dcxfer::{DcPool, Storage};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
pub struct FakeNet {
    pub dials: AtomicUsize,
    pub closes: AtomicUsize,
    pub fail_close: AtomicBool,
    in_flight: AtomicUsize,
    pub peak: AtomicUsize,
    /// (file_id, part) -> 写入次数
    pub saved: DashMap<(i64, usize), usize>,
    /// 已提交的文件 (name, parts)
    pub sent: Mutex<Vec<(String, usize)>>,
    /// 分片调用的模拟耗时
    pub delay: Mutex<Duration>,
    /// 第一次写入某个分片时返回 FLOOD_WAIT
    pub flood_on: DashMap<(i64, usize), u64>,
    /// 提交时删除的文件（模拟外部删除）
    pub remove_on_send: Mutex<Option<PathBuf>>,
}

impl FakeNet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    async fn handle(&self, call: &Call) -> Result<Response, RpcError> {
        match &call.request {
            Request::Ping => Ok(Response::Pong),
            Request::AuthStatus => Ok(Response::Authorized(true)),
            Request::ResolvePeer { username } => Ok(Response::Peer(Peer {
                id: 7,
                name: username.clone(),
            })),
            Request::SaveFilePart { file_id, part, .. } => {
                let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                let delay = *self.delay.lock();
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                self.in_flight.fetch_sub(1, Ordering::SeqCst);

                if let Some((_, secs)) = self.flood_on.remove(&(*file_id, *part)) {
                    return Err(RpcError::FloodWait(secs));
                }
                *self.saved.entry((*file_id, *part)).or_insert(0) += 1;
                Ok(Response::PartSaved)
            }
            Request::SendMedia { peer, file, .. } => {
                if let Some(path) = self.remove_on_send.lock().take() {
                    let _ = std::fs::remove_file(path);
                }
                self.sent.lock().push((file.name.clone(), file.parts));
                Ok(Response::Sent(Message {
                    id: 1,
                    peer: peer.clone(),
                    date: 0,
                    media: Some(Media {
                        name: file.name.clone(),
                        size: 0,
                        photo: false,
                        location: FileLocation {
                            peer: peer.name.clone(),
                            msg_id: 1,
                            dc: call.dc,
                        },
                    }),
                }))
            }
            Request::GetMessages { .. } => Ok(Response::Messages(Vec::new())),
            Request::GetFile { .. } => Ok(Response::FileData(Vec::new())),
        }
    }
}

/// 假 Transport
#[derive(Clone)]
pub struct FakeTransport(pub Arc<FakeNet>);

struct FakeConn {
    dc: DcId,
    net: Arc<FakeNet>,
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(&self, target: DialTarget) -> Result<Arc<dyn Conn>, RpcError> {
        self.0.dials.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeConn {
            dc: target.dc,
            net: self.0.clone(),
        }))
    }
}

#[async_trait]
impl Conn for FakeConn {
    async fn invoke(&self, call: Call) -> Result<Response, RpcError> {
        assert_eq!(call.dc, self.dc);
        self.net.handle(&call).await
    }

    async fn close(&self) -> Result<(), RpcError> {
        self.net.closes.fetch_add(1, Ordering::SeqCst);
        if self.net.fail_close.load(Ordering::SeqCst) {
            return Err(RpcError::Network(format!("close dc {}", self.dc)));
        }
        Ok(())
    }
}

/// 内存存储 + 系统时钟的启动上下文
pub fn context(net: &Arc<FakeNet>, network: NetworkConfig) -> BootstrapContext {
    let storage = Storage::open_in_memory().unwrap();
    BootstrapContext::new(network, storage, Arc::new(FakeTransport(net.clone())))
        .with_clock(Arc::new(SystemClock))
}

/// 使用默认中间件的连接池
pub async fn pool(ctx: &BootstrapContext, capacity: usize) -> Arc<DcPool> {
    let (client, _) = bootstrap::no_login(ctx, Vec::new()).await.unwrap();
    Arc::new(DcPool::new(client, capacity))
}
