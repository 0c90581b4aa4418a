// 配置管理模块
//
// 优先级：命令行参数 > 环境变量（DCXFER_*）> 配置文件 > 默认值
// 命令行与环境变量的合并由 main.rs 完成，这里只负责文件和校验

use crate::error::XferError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

/// 默认配置文件路径
pub const DEFAULT_CONFIG_PATH: &str = "config/dcxfer.toml";

/// 分片大小上限: 512KB（协议限制）
pub const MAX_PART_SIZE: u64 = 512 * 1024;

/// 分片大小必须是 1KB 的整数倍
pub const PART_SIZE_ALIGN: u64 = 1024;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 传输配置
    #[serde(default)]
    pub transfer: TransferConfig,
    /// 网络配置
    #[serde(default)]
    pub network: NetworkConfig,
    /// 存储配置
    #[serde(default)]
    pub storage: StorageConfig,
    /// 🔥 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 50MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    50 * 1024 * 1024 // 50MB
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

/// 传输配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// 分片大小（字节），不超过 512KB 且为 1KB 整数倍
    #[serde(default = "default_part_size")]
    pub part_size: u64,
    /// 每个文件的并发分片数
    #[serde(default = "default_threads")]
    pub threads: usize,
    /// 同时传输的文件数
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_part_size() -> u64 {
    MAX_PART_SIZE
}

fn default_threads() -> usize {
    4
}

fn default_limit() -> usize {
    2
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            part_size: default_part_size(),
            threads: default_threads(),
            limit: default_limit(),
        }
    }
}

/// 网络配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// 账号命名空间
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// 代理地址，空表示直连
    #[serde(default)]
    pub proxy: String,
    /// DC 连接池容量，0 表示不限
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// NTP 服务器，空表示使用系统时钟
    #[serde(default)]
    pub ntp: String,
    /// 重连总时限（秒），0 表示不限
    #[serde(default = "default_reconnect_timeout_secs")]
    pub reconnect_timeout_secs: u64,
    /// 使用测试网络
    #[serde(default)]
    pub test: bool,
    /// FLOOD_WAIT 最长等待（秒）
    #[serde(default = "default_flood_wait_ceiling_secs")]
    pub flood_wait_ceiling_secs: u64,
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_pool_size() -> usize {
    8
}

fn default_reconnect_timeout_secs() -> u64 {
    120
}

fn default_flood_wait_ceiling_secs() -> u64 {
    300
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            proxy: String::new(),
            pool_size: default_pool_size(),
            ntp: String::new(),
            reconnect_timeout_secs: default_reconnect_timeout_secs(),
            test: false,
            flood_wait_ceiling_secs: default_flood_wait_ceiling_secs(),
        }
    }
}

impl NetworkConfig {
    pub fn reconnect_timeout(&self) -> Duration {
        Duration::from_secs(self.reconnect_timeout_secs)
    }

    pub fn flood_wait_ceiling(&self) -> Duration {
        Duration::from_secs(self.flood_wait_ceiling_secs)
    }
}

/// 存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// 会话数据库路径
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
    /// 本地模拟网络的数据目录
    #[serde(default = "default_remote_dir")]
    pub remote_dir: PathBuf,
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("data").join("dcxfer.db")
}

fn default_remote_dir() -> PathBuf {
    PathBuf::from("data").join("remote")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
            remote_dir: default_remote_dir(),
        }
    }
}

impl AppConfig {
    /// 校验配置
    pub fn validate(&self) -> Result<(), XferError> {
        let t = &self.transfer;
        if t.part_size == 0 || t.part_size > MAX_PART_SIZE {
            return Err(XferError::Config(format!(
                "分片大小必须在 1KB ~ {}KB 之间: {}",
                MAX_PART_SIZE / 1024,
                t.part_size
            )));
        }
        if t.part_size % PART_SIZE_ALIGN != 0 {
            return Err(XferError::Config(format!(
                "分片大小必须是 1KB 的整数倍: {}",
                t.part_size
            )));
        }
        if t.threads == 0 {
            return Err(XferError::Config("threads 必须大于 0".to_string()));
        }
        if t.limit == 0 {
            return Err(XferError::Config("limit 必须大于 0".to_string()));
        }
        if self.network.namespace.trim().is_empty() {
            return Err(XferError::Config("命名空间不能为空".to_string()));
        }
        Ok(())
    }

    /// 从文件加载配置
    ///
    /// 读取、解析或校验失败都返回 `XferError::Config`
    pub async fn load_from_file(path: &str) -> Result<Self, XferError> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| XferError::Config(format!("读取配置文件失败 {}: {}", path, e)))?;

        let config: AppConfig = toml::from_str(&content)
            .map_err(|e| XferError::Config(format!("解析配置文件失败 {}: {}", path, e)))?;
        config.validate().map_err(|e| match e {
            XferError::Config(msg) => XferError::Config(format!("配置文件校验失败 {}: {}", path, msg)),
            other => other,
        })?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        self.validate().context("保存配置失败")?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = std::path::Path::new(path).parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {}", path);
        Ok(())
    }

    /// 加载或创建默认配置
    ///
    /// 只有文件不存在时才使用默认值（并写出默认文件），
    /// 已存在的文件解析或校验失败直接返回错误
    pub async fn load_or_default(path: &str) -> Result<Self, XferError> {
        if !fs::try_exists(path).await.unwrap_or(false) {
            let default_config = Self::default();
            if let Err(e) = default_config.save_to_file(path).await {
                tracing::error!("保存默认配置失败: {:#}", e);
            }
            return Ok(default_config);
        }

        let config = Self::load_from_file(path).await?;
        tracing::info!("配置文件加载成功: {}", path);
        Ok(config)
    }
}
