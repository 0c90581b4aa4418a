//! 本地目录模拟的远端网络
//!
//! 目录结构：
//!
//! ```text
//! {root}/
//! ├── parts/{file_id}/{part}           # 已上传分片，按 (file_id, part) 幂等覆盖
//! └── chats/{peer}/
//!     ├── messages/{msg_id}.json       # 消息元数据
//!     └── media/{msg_id}.bin           # 组装后的文件
//! ```
//!
//! 媒体文件按消息 ID 分散到不同 DC，读取时必须连接到文件所在 DC，
//! 否则返回 FILE_MIGRATE，与真实网络的多 DC 行为一致
//!
//! 配置了代理时，每条连接都会先经代理建立到 DC 地址的隧道并保持到关闭，
//! 代理不可用时拨号失败

use super::{Call, Conn, DcId, DialTarget, FileLocation, Media, Message, Peer, Request, Response};
use super::{RpcError, Transport};
use async_trait::async_trait;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// 自己的会话对端名
pub const SELF_PEER: &str = "self";

/// 代理隧道的建立超时
const TUNNEL_TIMEOUT: Duration = Duration::from_secs(10);

/// 本地目录模拟的 Transport
#[derive(Debug, Clone)]
pub struct LoopbackTransport {
    state: Arc<LoopbackState>,
}

#[derive(Debug)]
struct LoopbackState {
    root: PathBuf,
    dcs: Vec<DcId>,
    /// 提交（组装文件、分配消息 ID）串行化
    commit_lock: Mutex<()>,
}

impl LoopbackTransport {
    /// 创建本地网络
    ///
    /// # 参数
    /// * `root` - 数据目录
    /// * `dcs` - 可用的 DC 列表
    pub fn new(root: impl Into<PathBuf>, dcs: Vec<DcId>) -> Self {
        let root = root.into();
        info!("本地模拟网络: root={:?}, dcs={:?}", root, dcs);
        Self {
            state: Arc::new(LoopbackState {
                root,
                dcs,
                commit_lock: Mutex::new(()),
            }),
        }
    }

    /// 数据目录
    pub fn root(&self) -> &Path {
        &self.state.root
    }

    /// 预先创建一个对端（群组/频道）
    pub async fn create_peer(&self, name: &str) -> std::io::Result<Peer> {
        let name = sanitize_peer(name)
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "非法对端名"))?;
        fs::create_dir_all(self.state.chat_dir(&name).join("messages")).await?;
        fs::create_dir_all(self.state.chat_dir(&name).join("media")).await?;
        Ok(peer_of(&name))
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn connect(&self, target: DialTarget) -> Result<Arc<dyn Conn>, RpcError> {
        if !self.state.dcs.contains(&target.dc) {
            return Err(RpcError::Network(format!("无法连接 DC {} ({})", target.dc, target.addr)));
        }

        let session = match (&target.session, target.login) {
            (Some(s), _) => Some(s.clone()),
            (None, true) => Some(uuid::Uuid::new_v4().as_bytes().to_vec()),
            (None, false) => None,
        };

        let tunnel = if target.dialer.is_direct() {
            None
        } else {
            let stream = target.dialer.dial(&target.addr, TUNNEL_TIMEOUT).await?;
            debug!("代理隧道已建立: dc={}, addr={}", target.dc, target.addr);
            Some(stream)
        };

        debug!(
            "本地网络连接建立: dc={}, app={}, authorized={}",
            target.dc,
            target.app.id,
            session.is_some()
        );

        Ok(Arc::new(LoopbackConn {
            dc: target.dc,
            state: self.state.clone(),
            session,
            tunnel: parking_lot::Mutex::new(tunnel),
        }))
    }
}

/// 单条本地连接
struct LoopbackConn {
    dc: DcId,
    state: Arc<LoopbackState>,
    session: Option<Vec<u8>>,
    /// 经代理建立的隧道，关闭连接时释放
    tunnel: parking_lot::Mutex<Option<TcpStream>>,
}

#[async_trait]
impl Conn for LoopbackConn {
    async fn invoke(&self, call: Call) -> Result<Response, RpcError> {
        if call.cancel.is_cancelled() {
            return Err(RpcError::Cancelled);
        }
        if self.session.is_none() && !matches!(call.request, Request::AuthStatus | Request::Ping) {
            return Err(RpcError::rpc(401, "AUTH_KEY_UNREGISTERED"));
        }

        match call.request {
            Request::Ping => Ok(Response::Pong),
            Request::AuthStatus => Ok(Response::Authorized(self.session.is_some())),
            Request::ResolvePeer { username } => self.state.resolve_peer(&username).await,
            Request::SaveFilePart {
                file_id,
                part,
                total_parts,
                data,
            } => {
                if part >= total_parts {
                    return Err(RpcError::rpc(400, "FILE_PART_INVALID"));
                }
                let dir = self.state.parts_dir(file_id);
                fs::create_dir_all(&dir).await?;
                fs::write(dir.join(format!("{:08}", part)), data.as_slice()).await?;
                Ok(Response::PartSaved)
            }
            Request::SendMedia { peer, file, photo } => {
                self.state.commit(&peer, &file.name, file.id, file.parts, photo).await
            }
            Request::GetMessages { peer, ids } => self.state.messages(&peer, &ids).await,
            Request::GetFile {
                location,
                offset,
                limit,
            } => {
                if location.dc != self.dc {
                    return Err(RpcError::rpc(303, format!("FILE_MIGRATE_{}", location.dc)));
                }
                self.state.read_file(&location, offset, limit).await
            }
        }
    }

    async fn close(&self) -> Result<(), RpcError> {
        if self.tunnel.lock().take().is_some() {
            debug!("代理隧道已释放: dc={}", self.dc);
        }
        debug!("本地网络连接关闭: dc={}", self.dc);
        Ok(())
    }

    fn session(&self) -> Option<Vec<u8>> {
        self.session.clone()
    }
}

impl LoopbackState {
    fn chat_dir(&self, peer: &str) -> PathBuf {
        self.root.join("chats").join(peer)
    }

    fn parts_dir(&self, file_id: i64) -> PathBuf {
        self.root.join("parts").join(format!("{:016x}", file_id))
    }

    fn media_dc(&self, msg_id: i64) -> DcId {
        self.dcs[(msg_id as usize) % self.dcs.len()]
    }

    async fn resolve_peer(&self, username: &str) -> Result<Response, RpcError> {
        let name = sanitize_peer(username).ok_or_else(|| RpcError::rpc(400, "USERNAME_INVALID"))?;
        if name == SELF_PEER {
            fs::create_dir_all(self.chat_dir(&name).join("messages")).await?;
            fs::create_dir_all(self.chat_dir(&name).join("media")).await?;
        } else if !fs::try_exists(self.chat_dir(&name)).await.unwrap_or(false) {
            return Err(RpcError::rpc(400, "USERNAME_NOT_OCCUPIED"));
        }
        Ok(Response::Peer(peer_of(&name)))
    }

    async fn commit(
        &self,
        peer: &Peer,
        name: &str,
        file_id: i64,
        parts: usize,
        photo: bool,
    ) -> Result<Response, RpcError> {
        let chat = self.chat_dir(&peer.name);
        if !fs::try_exists(&chat).await.unwrap_or(false) {
            return Err(RpcError::rpc(400, "PEER_ID_INVALID"));
        }

        let parts_dir = self.parts_dir(file_id);
        let mut assembled = Vec::new();
        for part in 0..parts {
            let data = fs::read(parts_dir.join(format!("{:08}", part)))
                .await
                .map_err(|_| RpcError::rpc(400, "FILE_PARTS_INVALID"))?;
            assembled.extend_from_slice(&data);
        }

        let _guard = self.commit_lock.lock().await;
        let messages_dir = chat.join("messages");
        fs::create_dir_all(&messages_dir).await?;
        fs::create_dir_all(chat.join("media")).await?;

        let mut next_id = 1i64;
        let mut entries = fs::read_dir(&messages_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(id) = entry
                .path()
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<i64>().ok())
            {
                next_id = next_id.max(id + 1);
            }
        }

        let message = Message {
            id: next_id,
            peer: peer.clone(),
            date: chrono::Utc::now().timestamp(),
            media: Some(Media {
                name: name.to_string(),
                size: assembled.len() as u64,
                photo,
                location: FileLocation {
                    peer: peer.name.clone(),
                    msg_id: next_id,
                    dc: self.media_dc(next_id),
                },
            }),
        };

        fs::write(chat.join("media").join(format!("{}.bin", next_id)), &assembled).await?;
        let json = serde_json::to_vec_pretty(&message)
            .map_err(|e| RpcError::Network(format!("序列化消息失败: {}", e)))?;
        fs::write(messages_dir.join(format!("{}.json", next_id)), json).await?;
        let _ = fs::remove_dir_all(&parts_dir).await;

        debug!(
            "本地网络提交文件: peer={}, msg_id={}, size={}",
            peer.name,
            next_id,
            assembled.len()
        );
        Ok(Response::Sent(message))
    }

    async fn messages(&self, peer: &Peer, ids: &[i64]) -> Result<Response, RpcError> {
        let dir = self.chat_dir(&peer.name).join("messages");
        let mut found = Vec::with_capacity(ids.len());
        for id in ids {
            let path = dir.join(format!("{}.json", id));
            let Ok(content) = fs::read(&path).await else {
                continue;
            };
            let message: Message = serde_json::from_slice(&content)
                .map_err(|e| RpcError::Network(format!("消息损坏 {:?}: {}", path, e)))?;
            found.push(message);
        }
        Ok(Response::Messages(found))
    }

    async fn read_file(
        &self,
        location: &FileLocation,
        offset: u64,
        limit: usize,
    ) -> Result<Response, RpcError> {
        let path = self
            .chat_dir(&location.peer)
            .join("media")
            .join(format!("{}.bin", location.msg_id));
        let mut file = fs::File::open(&path)
            .await
            .map_err(|_| RpcError::rpc(400, "FILE_REFERENCE_INVALID"))?;
        let size = file.metadata().await?.len();
        if offset > size {
            return Err(RpcError::rpc(400, "OFFSET_INVALID"));
        }

        file.seek(SeekFrom::Start(offset)).await?;
        let len = ((size - offset) as usize).min(limit);
        let mut buffer = vec![0u8; len];
        file.read_exact(&mut buffer).await?;
        Ok(Response::FileData(buffer))
    }
}

/// 对端名只允许出现在单层目录里
fn sanitize_peer(name: &str) -> Option<String> {
    let name = name.trim().trim_start_matches('@');
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        return None;
    }
    Some(name.to_string())
}

fn peer_of(name: &str) -> Peer {
    let digest = md5::compute(name.as_bytes());
    let mut id = [0u8; 8];
    id.copy_from_slice(&digest.0[..8]);
    Peer {
        id: i64::from_le_bytes(id) & i64::MAX,
        name: name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::{apps, DEVICE};
    use crate::bootstrap::proxy::Dialer;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn target(dc: DcId, login: bool) -> DialTarget {
        DialTarget {
            dc,
            addr: "127.0.0.1:443".into(),
            app: apps::TEST_APP,
            device: DEVICE,
            dialer: Dialer::Direct,
            session: None,
            login,
        }
    }

    fn call(dc: DcId, request: Request) -> Call {
        Call {
            dc,
            request,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_unauthorized_without_session() {
        let dir = TempDir::new().unwrap();
        let transport = LoopbackTransport::new(dir.path(), vec![1, 2]);
        let conn = transport.connect(target(2, false)).await.unwrap();

        let resp = conn.invoke(call(2, Request::AuthStatus)).await.unwrap();
        assert!(matches!(resp, Response::Authorized(false)));
        assert!(conn.session().is_none());

        let err = conn
            .invoke(call(2, Request::ResolvePeer { username: "self".into() }))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Rpc { code: 401, .. }));
    }

    /// 只完成握手、不转发数据的 SOCKS5 代理，返回客户端请求的目标端口
    async fn socks5_stub() -> (u16, tokio::task::JoinHandle<u16>) {
        use tokio::io::AsyncWriteExt;
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (mut client, _) = listener.accept().await.unwrap();
            let mut head = [0u8; 2];
            client.read_exact(&mut head).await.unwrap();
            let mut methods = vec![0u8; head[1] as usize];
            client.read_exact(&mut methods).await.unwrap();
            client.write_all(&[0x05, 0x00]).await.unwrap();

            let mut req = [0u8; 4];
            client.read_exact(&mut req).await.unwrap();
            assert_eq!(req[3], 0x01);
            let mut addr = [0u8; 6];
            client.read_exact(&mut addr).await.unwrap();
            client
                .write_all(&[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0, 0])
                .await
                .unwrap();
            u16::from_be_bytes([addr[4], addr[5]])
        });
        (port, handle)
    }

    #[tokio::test]
    async fn test_connect_through_proxy() {
        let dir = TempDir::new().unwrap();
        let transport = LoopbackTransport::new(dir.path(), vec![1, 2]);
        let (port, proxy) = socks5_stub().await;

        let mut t = target(2, true);
        t.dialer = Dialer::parse(&format!("socks5://127.0.0.1:{}", port)).unwrap();
        let conn = transport.connect(t).await.unwrap();

        // 隧道指向 DC 地址
        assert_eq!(proxy.await.unwrap(), 443);
        assert!(matches!(conn.invoke(call(2, Request::Ping)).await, Ok(Response::Pong)));
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_proxy_fails_dial() {
        let dir = TempDir::new().unwrap();
        let transport = LoopbackTransport::new(dir.path(), vec![1, 2]);
        // 占用后释放端口，确保无人监听
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };

        let mut t = target(2, true);
        t.dialer = Dialer::parse(&format!("socks5://127.0.0.1:{}", port)).unwrap();
        let err = match transport.connect(t).await {
            Err(e) => e,
            Ok(_) => panic!("代理不可用时不应连接成功"),
        };
        assert_eq!(err.kind(), crate::rpc::ErrorKind::Transient);
    }

    #[tokio::test]
    async fn test_unknown_dc_refused() {
        let dir = TempDir::new().unwrap();
        let transport = LoopbackTransport::new(dir.path(), vec![1, 2]);
        assert!(transport.connect(target(9, true)).await.is_err());
    }

    #[tokio::test]
    async fn test_upload_commit_and_read_back() {
        let dir = TempDir::new().unwrap();
        let transport = LoopbackTransport::new(dir.path(), vec![1, 2, 3]);
        let conn = transport.connect(target(2, true)).await.unwrap();

        let Response::Peer(me) = conn
            .invoke(call(2, Request::ResolvePeer { username: "self".into() }))
            .await
            .unwrap()
        else {
            panic!("期望 Peer 响应");
        };

        for (i, chunk) in [b"hello ".to_vec(), b"world".to_vec()].into_iter().enumerate() {
            conn.invoke(call(
                2,
                Request::SaveFilePart {
                    file_id: 42,
                    part: i,
                    total_parts: 2,
                    data: Arc::new(chunk),
                },
            ))
            .await
            .unwrap();
        }

        let Response::Sent(message) = conn
            .invoke(call(
                2,
                Request::SendMedia {
                    peer: me.clone(),
                    file: crate::rpc::InputFile {
                        id: 42,
                        parts: 2,
                        name: "greeting.txt".into(),
                    },
                    photo: false,
                },
            ))
            .await
            .unwrap()
        else {
            panic!("期望 Sent 响应");
        };

        let media = message.media.unwrap();
        assert_eq!(media.size, 11);
        assert_eq!(message.id, 1);

        // 必须连到媒体所在 DC
        let media_conn = transport.connect(target(media.location.dc, true)).await.unwrap();
        let Response::FileData(data) = media_conn
            .invoke(call(
                media.location.dc,
                Request::GetFile {
                    location: media.location.clone(),
                    offset: 6,
                    limit: 1024,
                },
            ))
            .await
            .unwrap()
        else {
            panic!("期望 FileData 响应");
        };
        assert_eq!(data, b"world");

        let wrong_dc = if media.location.dc == 1 { 2 } else { 1 };
        let other = transport.connect(target(wrong_dc, true)).await.unwrap();
        let err = other
            .invoke(call(
                wrong_dc,
                Request::GetFile {
                    location: media.location,
                    offset: 0,
                    limit: 1024,
                },
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Rpc { code: 303, .. }));
    }

    #[tokio::test]
    async fn test_commit_with_missing_part_fails() {
        let dir = TempDir::new().unwrap();
        let transport = LoopbackTransport::new(dir.path(), vec![2]);
        let me = transport.create_peer(SELF_PEER).await.unwrap();
        let conn = transport.connect(target(2, true)).await.unwrap();

        conn.invoke(call(
            2,
            Request::SaveFilePart {
                file_id: 7,
                part: 0,
                total_parts: 2,
                data: Arc::new(vec![1, 2, 3]),
            },
        ))
        .await
        .unwrap();

        let err = conn
            .invoke(call(
                2,
                Request::SendMedia {
                    peer: me,
                    file: crate::rpc::InputFile {
                        id: 7,
                        parts: 2,
                        name: "x".into(),
                    },
                    photo: false,
                },
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Rpc { code: 400, .. }));
    }

    #[tokio::test]
    async fn test_resolve_unknown_peer() {
        let dir = TempDir::new().unwrap();
        let transport = LoopbackTransport::new(dir.path(), vec![2]);
        let conn = transport.connect(target(2, true)).await.unwrap();
        let err = conn
            .invoke(call(2, Request::ResolvePeer { username: "nobody".into() }))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Rpc { code: 400, .. }));

        transport.create_peer("archive").await.unwrap();
        let resp = conn
            .invoke(call(2, Request::ResolvePeer { username: "@archive".into() }))
            .await
            .unwrap();
        assert!(matches!(resp, Response::Peer(p) if p.name == "archive"));
    }

    #[test]
    fn test_sanitize_peer() {
        assert_eq!(sanitize_peer("@chan").as_deref(), Some("chan"));
        assert!(sanitize_peer("../etc").is_none());
        assert!(sanitize_peer("").is_none());
    }
}
