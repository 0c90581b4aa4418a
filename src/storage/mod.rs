//! 会话存储
//!
//! 单个 SQLite 文件，按命名空间隔离的 KV：
//! - kv(namespace, key, value)，(namespace, key) 为主键
//!
//! 每个命名空间对应一个账号，保存凭证模式、会话数据和对端缓存

pub mod peers;
pub mod session;

pub use peers::PeerCache;
pub use session::SessionStorage;

use crate::error::XferError;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// 固定的键名
pub mod keys {
    /// 凭证模式
    pub fn app() -> &'static str {
        "app"
    }

    /// 会话数据
    pub fn session() -> &'static str {
        "session"
    }

    /// 对端缓存
    pub fn peer(name: &str) -> String {
        format!("peers:{}", name)
    }
}

/// 存储句柄，可跨任务克隆共享
#[derive(Clone)]
pub struct Storage {
    conn: Arc<Mutex<Connection>>,
}

impl Storage {
    /// 打开（或创建）存储文件
    pub fn open(path: &Path) -> Result<Self, XferError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| XferError::Storage(format!("创建目录 {:?} 失败: {}", parent, e)))?;
            }
        }

        let conn = Connection::open(path)
            .map_err(|e| XferError::Storage(format!("打开 {:?} 失败: {}", path, e)))?;
        let storage = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        storage.init_tables()?;

        info!("会话存储已打开: {:?}", path);
        Ok(storage)
    }

    /// 内存存储（测试用）
    pub fn open_in_memory() -> Result<Self, XferError> {
        let storage = Self {
            conn: Arc::new(Mutex::new(Connection::open_in_memory()?)),
        };
        storage.init_tables()?;
        Ok(storage)
    }

    fn init_tables(&self) -> Result<(), XferError> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                namespace TEXT NOT NULL,
                key TEXT NOT NULL,
                value BLOB NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (namespace, key)
            )
            "#,
            [],
        )?;
        Ok(())
    }

    /// 打开命名空间
    pub fn namespace(&self, ns: &str) -> Result<Kv, XferError> {
        let ns = ns.trim();
        if ns.is_empty() {
            return Err(XferError::Storage("命名空间不能为空".to_string()));
        }
        Ok(Kv {
            conn: self.conn.clone(),
            namespace: ns.to_string(),
        })
    }

    /// 列出已有数据的命名空间
    pub fn namespaces(&self) -> Result<Vec<String>, XferError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT DISTINCT namespace FROM kv ORDER BY namespace")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }
}

/// 命名空间内的 KV 视图
#[derive(Clone)]
pub struct Kv {
    conn: Arc<Mutex<Connection>>,
    namespace: String,
}

impl std::fmt::Debug for Kv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kv").field("namespace", &self.namespace).finish()
    }
}

impl Kv {
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>, XferError> {
        let conn = self.conn.lock();
        let value = conn
            .query_row(
                "SELECT value FROM kv WHERE namespace = ?1 AND key = ?2",
                params![self.namespace, key],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set(&self, key: &str, value: &[u8]) -> Result<(), XferError> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO kv (namespace, key, value, updated_at) VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(namespace, key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
            params![self.namespace, key, value, chrono::Utc::now().timestamp()],
        )?;
        debug!("kv 写入: ns={}, key={}, {} bytes", self.namespace, key, value.len());
        Ok(())
    }

    pub fn delete(&self, key: &str) -> Result<bool, XferError> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "DELETE FROM kv WHERE namespace = ?1 AND key = ?2",
            params![self.namespace, key],
        )?;
        Ok(n > 0)
    }

    /// 列出某个前缀下的键
    pub fn keys(&self, prefix: &str) -> Result<Vec<String>, XferError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT key FROM kv WHERE namespace = ?1 AND substr(key, 1, length(?2)) = ?2 ORDER BY key",
        )?;
        let rows = stmt.query_map(params![self.namespace, prefix], |row| row.get::<_, String>(0))?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }
}
