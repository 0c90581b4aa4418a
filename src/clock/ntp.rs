// SNTP 时间同步（RFC 4330）
//
// 只发一次查询，用 ((t2 - t1) + (t3 - t4)) / 2 计算本地时钟偏移，
// 之后 now() 一律返回 系统时间 + 偏移

use super::Clock;
use crate::error::XferError;
use async_trait::async_trait;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::UdpSocket;
use tracing::{debug, info};

/// 默认 NTP 端口
pub const NTP_PORT: u16 = 123;

/// 默认同步超时
pub const SYNC_TIMEOUT: Duration = Duration::from_secs(5);

/// 1900-01-01 到 1970-01-01 的秒数
const NTP_UNIX_DELTA: u64 = 2_208_988_800;

/// 校准后的时钟
#[derive(Debug, Clone, Copy)]
pub struct SyncedClock {
    /// 本地时钟相对服务器的偏移（纳秒，正数表示本地慢）
    offset_nanos: i128,
}

impl SyncedClock {
    /// 以固定偏移创建
    pub fn with_offset_nanos(offset_nanos: i128) -> Self {
        Self { offset_nanos }
    }

    /// 偏移量（纳秒）
    pub fn offset_nanos(&self) -> i128 {
        self.offset_nanos
    }

    /// 向 NTP 服务器同步一次
    ///
    /// # 参数
    /// * `host` - 服务器地址，可带端口（默认 123）
    /// * `timeout` - 整体超时
    pub async fn sync(host: &str, timeout: Duration) -> Result<Self, XferError> {
        let addr = if host.contains(':') {
            host.to_string()
        } else {
            format!("{}:{}", host, NTP_PORT)
        };

        let offset = tokio::time::timeout(timeout, query(&addr))
            .await
            .map_err(|_| XferError::Clock(format!("{} 响应超时", addr)))??;

        info!("NTP 时间同步完成: server={}, offset={}ms", addr, offset / 1_000_000);
        Ok(Self::with_offset_nanos(offset))
    }
}

#[async_trait]
impl Clock for SyncedClock {
    fn now(&self) -> SystemTime {
        let now = SystemTime::now();
        let delta = Duration::from_nanos(self.offset_nanos.unsigned_abs() as u64);
        if self.offset_nanos >= 0 {
            now + delta
        } else {
            now - delta
        }
    }
}

async fn query(addr: &str) -> Result<i128, XferError> {
    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(|e| XferError::Clock(format!("绑定 UDP 端口失败: {}", e)))?;
    socket
        .connect(addr)
        .await
        .map_err(|e| XferError::Clock(format!("无法连接 {}: {}", addr, e)))?;

    // LI = 0, VN = 3, Mode = 3 (client)
    let mut request = [0u8; 48];
    request[0] = 0x1B;
    let t1 = unix_nanos(SystemTime::now());
    request[40..48].copy_from_slice(&to_ntp_timestamp(t1).to_be_bytes());

    socket
        .send(&request)
        .await
        .map_err(|e| XferError::Clock(format!("发送 NTP 请求失败: {}", e)))?;

    let mut response = [0u8; 48];
    let n = socket
        .recv(&mut response)
        .await
        .map_err(|e| XferError::Clock(format!("接收 NTP 响应失败: {}", e)))?;
    let t4 = unix_nanos(SystemTime::now());

    if n < 48 {
        return Err(XferError::Clock(format!("NTP 响应长度异常: {}", n)));
    }
    let mode = response[0] & 0x07;
    if mode != 4 {
        return Err(XferError::Clock(format!("NTP 响应模式异常: {}", mode)));
    }
    if response[1] == 0 {
        return Err(XferError::Clock("NTP 服务器返回 kiss-of-death (stratum 0)".to_string()));
    }

    let t2 = read_timestamp(&response[32..40]);
    let t3 = read_timestamp(&response[40..48]);
    if t3 == 0 {
        return Err(XferError::Clock("NTP 响应缺少发送时间戳".to_string()));
    }
    let t2 = from_ntp_timestamp(t2);
    let t3 = from_ntp_timestamp(t3);

    debug!("NTP 时间戳: t1={}, t2={}, t3={}, t4={}", t1, t2, t3, t4);
    Ok(((t2 - t1) + (t3 - t4)) / 2)
}

fn unix_nanos(t: SystemTime) -> i128 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_nanos() as i128,
        Err(e) => -(e.duration().as_nanos() as i128),
    }
}

fn read_timestamp(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    u64::from_be_bytes(buf)
}

/// Unix 纳秒 -> 64 位 NTP 时间戳（32 位秒 + 32 位小数）
pub(crate) fn to_ntp_timestamp(unix_nanos: i128) -> u64 {
    let secs = (unix_nanos / 1_000_000_000) as u64 + NTP_UNIX_DELTA;
    let frac = ((unix_nanos % 1_000_000_000) as u64) << 32;
    (secs << 32) | (frac / 1_000_000_000)
}

/// 64 位 NTP 时间戳 -> Unix 纳秒
pub(crate) fn from_ntp_timestamp(ts: u64) -> i128 {
    let secs = (ts >> 32) as i128 - NTP_UNIX_DELTA as i128;
    let frac = ((ts & 0xFFFF_FFFF) as i128 * 1_000_000_000) >> 32;
    secs * 1_000_000_000 + frac
}
