// RPC 错误及分类
//
// 分类规则（决定由谁重试）：
// - 网络重置 / 超时：BoundedRetry 原地重试
// - 连接断开 / 调用崩溃：Recovery 按退避策略重试
// - FLOOD_WAIT：FloodWaiter 等待后重发
// - 5xx 内部错误：临时错误
// - 权限 / 对端 / 参数错误以及所有未识别的错误：致命错误，不重试

use thiserror::Error;

/// 错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 可自动恢复
    Transient,
    /// 只能放弃当前传输项
    Fatal,
}

/// 协议调用错误
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    /// 网络错误（连接重置等）
    #[error("网络错误: {0}")]
    Network(String),

    /// 调用超时
    #[error("调用超时")]
    Timeout,

    /// 底层连接已断开，需要等待重连
    #[error("连接已断开: {0}")]
    ConnectionDead(String),

    /// 连接已被连接池关闭
    #[error("连接已关闭")]
    Closed,

    /// 服务端要求等待 N 秒后再调用
    #[error("FLOOD_WAIT_{0}")]
    FloodWait(u64),

    /// 服务端返回的错误
    #[error("rpc error {code}: {message}")]
    Rpc { code: i32, message: String },

    /// 调用链内部崩溃（已捕获）
    #[error("调用崩溃: {0}")]
    Crashed(String),

    /// 调用被取消
    #[error("调用已取消")]
    Cancelled,

    /// 响应类型与请求不匹配
    #[error("意外的响应类型: 期望 {0}")]
    UnexpectedResponse(&'static str),
}

impl RpcError {
    pub fn rpc(code: i32, message: impl Into<String>) -> Self {
        RpcError::Rpc {
            code,
            message: message.into(),
        }
    }

    /// 错误类别
    pub fn kind(&self) -> ErrorKind {
        match self {
            RpcError::Network(_)
            | RpcError::Timeout
            | RpcError::ConnectionDead(_)
            | RpcError::FloodWait(_)
            | RpcError::Crashed(_) => ErrorKind::Transient,
            RpcError::Rpc { code, message } => {
                if *code == 420 {
                    ErrorKind::Transient
                } else if *code >= 500 || *code == -503 || message.contains("_TIMEOUT") {
                    ErrorKind::Transient
                } else {
                    ErrorKind::Fatal
                }
            }
            RpcError::Closed | RpcError::Cancelled | RpcError::UnexpectedResponse(_) => {
                ErrorKind::Fatal
            }
        }
    }

    /// 是否为可原地重试的网络类错误（BoundedRetry 处理范围）
    pub fn is_transient_network(&self) -> bool {
        match self {
            RpcError::Network(_) | RpcError::Timeout => true,
            RpcError::Rpc { .. } => {
                self.kind() == ErrorKind::Transient && !matches!(self, RpcError::Rpc { code: 420, .. })
            }
            _ => false,
        }
    }

    /// 是否需要 Recovery 等待重连
    pub fn needs_recovery(&self) -> bool {
        matches!(self, RpcError::ConnectionDead(_) | RpcError::Crashed(_))
    }

    /// 解析 FLOOD_WAIT 秒数（同时兼容 420 + "FLOOD_WAIT_N" 的形式）
    pub fn flood_wait(&self) -> Option<u64> {
        match self {
            RpcError::FloodWait(secs) => Some(*secs),
            RpcError::Rpc { code: 420, message } => message
                .rsplit('_')
                .next()
                .and_then(|s| s.parse::<u64>().ok()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for RpcError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut => RpcError::Timeout,
            std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof => RpcError::ConnectionDead(e.to_string()),
            _ => RpcError::Network(e.to_string()),
        }
    }
}
