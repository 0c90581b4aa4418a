//! 错误类型定义
//!
//! 分为三类处理方式：
//! - 启动类错误（Config / Proxy / Storage / Clock）：立即中止本次运行
//! - 单项错误（Transient / FatalItem / RecoveredCrash / Cancelled）：只影响当前传输项，汇总进运行报告
//! - 连接池关闭错误（Close）：聚合全部错误，不会只保留第一个

use crate::rpc::{DcId, ErrorKind, RpcError};
use thiserror::Error;

/// 传输系统错误
#[derive(Debug, Error)]
pub enum XferError {
    /// 配置错误（参数/环境变量非法、未知的凭证模式等）
    #[error("配置错误: {0}")]
    Config(String),

    /// 代理地址格式错误或不可用
    #[error("代理错误: {0}")]
    Proxy(String),

    /// 会话存储不可用
    #[error("会话存储错误: {0}")]
    Storage(String),

    /// 时间同步失败
    #[error("时钟同步失败: {0}")]
    Clock(String),

    /// 连接池已满且没有可回收的连接
    #[error("DC {dc} 不可用: {reason}")]
    DcUnavailable { dc: DcId, reason: String },

    /// 拨号失败（DC 不在列表中、凭证被拒、重连超时）
    #[error("连接 DC {dc} 失败: {reason}")]
    Dial { dc: DcId, reason: String },

    /// 临时错误，中间件重试预算耗尽后才会出现
    #[error("传输失败（重试已耗尽）: {0}")]
    Transient(RpcError),

    /// 致命错误，只终止当前传输项
    #[error("{item}: {reason}")]
    FatalItem { item: String, reason: String },

    /// 调用链内部崩溃，已被捕获
    #[error("调用崩溃已恢复: {0}")]
    RecoveredCrash(String),

    /// 关闭连接池时的聚合错误
    #[error("关闭连接时出现 {} 个错误: {}", .0.len(), .0.join("; "))]
    Close(Vec<String>),

    /// 操作被取消
    #[error("操作已取消")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl XferError {
    /// 创建单项致命错误
    pub fn fatal(item: impl Into<String>, reason: impl ToString) -> Self {
        XferError::FatalItem {
            item: item.into(),
            reason: reason.to_string(),
        }
    }

    /// 将到达传输引擎的 RPC 错误归类为单项错误
    ///
    /// 临时错误能走到这里说明中间件已经重试过了
    pub fn from_rpc(item: &str, err: RpcError) -> Self {
        match err {
            RpcError::Cancelled => XferError::Cancelled,
            RpcError::Crashed(msg) => XferError::RecoveredCrash(msg),
            err => match err.kind() {
                ErrorKind::Transient => XferError::Transient(err),
                ErrorKind::Fatal => XferError::fatal(item, err),
            },
        }
    }

    /// 是否属于启动阶段错误（需要直接中止运行）
    pub fn is_bootstrap(&self) -> bool {
        matches!(
            self,
            XferError::Config(_) | XferError::Proxy(_) | XferError::Storage(_) | XferError::Clock(_)
        )
    }
}

impl From<rusqlite::Error> for XferError {
    fn from(e: rusqlite::Error) -> Self {
        XferError::Storage(e.to_string())
    }
}
