// 对端解析缓存（避免每次运行都解析用户名）

use super::{keys, Kv};
use crate::error::XferError;
use crate::rpc::Peer;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct PeerCache {
    kv: Kv,
}

impl PeerCache {
    pub fn new(kv: Kv) -> Self {
        Self { kv }
    }

    pub fn get(&self, name: &str) -> Result<Option<Peer>, XferError> {
        let Some(raw) = self.kv.get(&keys::peer(name))? else {
            return Ok(None);
        };
        match serde_json::from_slice(&raw) {
            Ok(peer) => Ok(Some(peer)),
            Err(e) => {
                // 损坏的缓存当作未命中
                warn!("对端缓存损坏，忽略: {}: {}", name, e);
                Ok(None)
            }
        }
    }

    pub fn put(&self, name: &str, peer: &Peer) -> Result<(), XferError> {
        let raw = serde_json::to_vec(peer).map_err(|e| XferError::Storage(e.to_string()))?;
        self.kv.set(&keys::peer(name), &raw)
    }

    /// 已缓存的对端名
    pub fn names(&self) -> Result<Vec<String>, XferError> {
        let prefix = keys::peer("");
        Ok(self
            .kv
            .keys(&prefix)?
            .into_iter()
            .map(|k| k[prefix.len()..].to_string())
            .collect())
    }
}
