// dcxfer
// 多 DC 消息网络上的批量文件传输

// 命令执行
pub mod app;

// 客户端启动（凭证、DC 列表、代理、中间件组装）
pub mod bootstrap;

// 时钟与退避
pub mod clock;

// 配置管理
pub mod config;

// DC 连接池
pub mod dcpool;

// 下载引擎
pub mod downloader;

// 错误类型
pub mod error;

// 本地路径展开
pub mod filesystem;

// 日志系统
pub mod logging;

// 调用中间件
pub mod middleware;

// 进度跟踪
pub mod progress;

// 协议能力抽象
pub mod rpc;

// 会话存储
pub mod storage;

// 传输引擎
pub mod transfer;

// 上传引擎
pub mod uploader;

// 导出常用类型
pub use bootstrap::{BootstrapContext, Client, ClientOptions};
pub use config::AppConfig;
pub use dcpool::{Connection, DcPool};
pub use downloader::{Downloader, MessageIter};
pub use error::XferError;
pub use progress::{Progress, ProgressState, Reporter};
pub use rpc::{DcId, Invoker, RpcError, Transport};
pub use storage::{Kv, Storage};
pub use transfer::{ItemOptions, RunSummary, TransferEngine, TransferItem, WorkIter};
pub use uploader::{FileIter, Uploader};
