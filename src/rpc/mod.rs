// 协议能力抽象
//
// 底层线协议不在本 crate 范围内，这里只定义编排层需要的能力：
// - Transport：向某个 DC 建立一条已认证的连接
// - Invoker：在连接上发起一次类型化调用
// - Conn：Transport 返回的原始连接（可关闭、可导出会话）
//
// loopback 子模块提供一个基于本地目录的实现，用于演练和测试

pub mod error;
pub mod loopback;

pub use error::{ErrorKind, RpcError};
pub use loopback::LoopbackTransport;

use crate::bootstrap::proxy::Dialer;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// 数据中心（端点）ID
pub type DcId = i32;

/// 应用凭证
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppCredentials {
    pub id: i32,
    pub hash: &'static str,
}

/// 设备标识
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub device_model: &'static str,
    pub system_version: &'static str,
    pub app_version: &'static str,
    pub lang_code: &'static str,
    pub system_lang_code: &'static str,
}

/// 会话对端（用户 / 群组 / 频道）
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Peer {
    pub id: i64,
    pub name: String,
}

/// 已上传分片组成的文件引用
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputFile {
    pub id: i64,
    pub parts: usize,
    pub name: String,
}

/// 远端文件位置（文件可能存放在非主 DC）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileLocation {
    pub peer: String,
    pub msg_id: i64,
    pub dc: DcId,
}

/// 消息附带的媒体
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Media {
    pub name: String,
    pub size: u64,
    pub photo: bool,
    pub location: FileLocation,
}

/// 消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub peer: Peer,
    pub date: i64,
    pub media: Option<Media>,
}

/// 请求
#[derive(Debug, Clone)]
pub enum Request {
    Ping,
    /// 查询当前会话是否已授权
    AuthStatus,
    /// 解析对端，"self" 表示自己
    ResolvePeer { username: String },
    /// 上传一个分片，以 (file_id, part) 为幂等键
    SaveFilePart {
        file_id: i64,
        part: usize,
        total_parts: usize,
        data: Arc<Vec<u8>>,
    },
    /// 将已上传的分片组装为文件并发送
    SendMedia {
        peer: Peer,
        file: InputFile,
        photo: bool,
    },
    GetMessages { peer: Peer, ids: Vec<i64> },
    /// 按偏移读取文件
    GetFile {
        location: FileLocation,
        offset: u64,
        limit: usize,
    },
}

impl Request {
    /// 请求名（用于日志）
    pub fn name(&self) -> &'static str {
        match self {
            Request::Ping => "ping",
            Request::AuthStatus => "auth.status",
            Request::ResolvePeer { .. } => "contacts.resolve",
            Request::SaveFilePart { .. } => "upload.saveFilePart",
            Request::SendMedia { .. } => "messages.sendMedia",
            Request::GetMessages { .. } => "messages.get",
            Request::GetFile { .. } => "upload.getFile",
        }
    }
}

/// 响应
#[derive(Debug, Clone)]
pub enum Response {
    Pong,
    Authorized(bool),
    Peer(Peer),
    PartSaved,
    Sent(Message),
    Messages(Vec<Message>),
    FileData(Vec<u8>),
}

/// 一次调用：目标 DC + 请求 + 取消信号
#[derive(Debug, Clone)]
pub struct Call {
    pub dc: DcId,
    pub request: Request,
    pub cancel: CancellationToken,
}

/// 发起调用的能力
#[async_trait]
pub trait Invoker: Send + Sync {
    async fn invoke(&self, call: Call) -> Result<Response, RpcError>;
}

/// Transport 建立的原始连接
#[async_trait]
pub trait Conn: Send + Sync {
    async fn invoke(&self, call: Call) -> Result<Response, RpcError>;

    async fn close(&self) -> Result<(), RpcError>;

    /// 连接建立后需要持久化的会话数据
    fn session(&self) -> Option<Vec<u8>> {
        None
    }
}

/// 拨号参数
#[derive(Debug, Clone)]
pub struct DialTarget {
    pub dc: DcId,
    pub addr: String,
    pub app: AppCredentials,
    pub device: DeviceConfig,
    pub dialer: Dialer,
    pub session: Option<Vec<u8>>,
    /// 登录模式：允许在没有会话的情况下建立新会话
    pub login: bool,
}

/// 建立连接的能力
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, target: DialTarget) -> Result<Arc<dyn Conn>, RpcError>;
}

/// 将 Conn 适配为 Invoker（作为中间件链的终点）
pub struct ConnInvoker(pub Arc<dyn Conn>);

#[async_trait]
impl Invoker for ConnInvoker {
    async fn invoke(&self, call: Call) -> Result<Response, RpcError> {
        self.0.invoke(call).await
    }
}
