// 应用凭证注册表

use crate::rpc::AppCredentials;

/// 内置凭证模式
pub const APP_BUILTIN: &str = "builtin";

/// 桌面客户端凭证模式（导入桌面客户端会话时使用）
pub const APP_DESKTOP: &str = "desktop";

/// 测试网络凭证
pub const TEST_APP: AppCredentials = AppCredentials {
    id: 17349,
    hash: "344583e45741c457fe1862106095a5eb",
};

const APPS: &[(&str, AppCredentials)] = &[
    (
        APP_BUILTIN,
        AppCredentials {
            id: 15055931,
            hash: "021d433426cbb920eeb95164498fe3d3",
        },
    ),
    (
        APP_DESKTOP,
        AppCredentials {
            id: 2040,
            hash: "b18441a1ff607e10a989891a5462e627",
        },
    ),
];

/// 按模式名查找凭证
pub fn lookup(mode: &str) -> Option<AppCredentials> {
    APPS.iter().find(|(name, _)| *name == mode).map(|(_, app)| *app)
}

/// 所有已知模式
pub fn modes() -> Vec<&'static str> {
    APPS.iter().map(|(name, _)| *name).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup() {
        assert_eq!(lookup(APP_DESKTOP).unwrap().id, 2040);
        assert!(lookup(APP_BUILTIN).is_some());
        assert!(lookup("nonexistent").is_none());
        assert_eq!(modes(), vec![APP_BUILTIN, APP_DESKTOP]);
    }
}
