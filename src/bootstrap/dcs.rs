// DC 地址表

use crate::rpc::DcId;

/// 默认主 DC
pub const HOME_DC: DcId = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DcOption {
    pub id: DcId,
    pub addr: &'static str,
}

/// 生产网络
pub const PRODUCTION: &[DcOption] = &[
    DcOption { id: 1, addr: "149.154.175.53:443" },
    DcOption { id: 2, addr: "149.154.167.51:443" },
    DcOption { id: 3, addr: "149.154.175.100:443" },
    DcOption { id: 4, addr: "149.154.167.91:443" },
    DcOption { id: 5, addr: "91.108.56.130:443" },
];

/// 测试网络
pub const TEST: &[DcOption] = &[
    DcOption { id: 1, addr: "149.154.175.10:443" },
    DcOption { id: 2, addr: "149.154.167.40:443" },
    DcOption { id: 3, addr: "149.154.175.117:443" },
];

/// 查找 DC 地址
pub fn find(list: &[DcOption], dc: DcId) -> Option<&DcOption> {
    list.iter().find(|o| o.id == dc)
}

/// DC 编号列表
pub fn ids(list: &[DcOption]) -> Vec<DcId> {
    list.iter().map(|o| o.id).collect()
}
