// 连接会话持久化
//
// 登录模式下不加载已有会话（强制建立新会话），但新会话仍会保存

use super::{keys, Kv};
use crate::error::XferError;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct SessionStorage {
    kv: Kv,
    login: bool,
}

impl SessionStorage {
    pub fn new(kv: Kv, login: bool) -> Self {
        Self { kv, login }
    }

    pub fn load(&self) -> Result<Option<Vec<u8>>, XferError> {
        if self.login {
            debug!("登录模式，忽略已保存的会话");
            return Ok(None);
        }
        self.kv.get(keys::session())
    }

    pub fn store(&self, data: &[u8]) -> Result<(), XferError> {
        self.kv.set(keys::session(), data)
    }
}
