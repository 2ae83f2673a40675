//! 环境变量配置加载

use std::env;
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::warn;

use crate::domain::binding::{PortBinding, WILDCARD};

/// 应用进程配置
///
/// `bind.port` 同时决定进程监听端口和容器端口映射的容器侧端口。
#[derive(Clone, Debug, PartialEq)]
pub struct EnvConfig {
    /// 监听地址与端口
    pub bind: PortBinding,
    /// 模板目录（为空时使用内置模板）
    pub template_dir: Option<PathBuf>,
    /// 静态资源目录（为空时使用内置资源）
    pub static_dir: Option<PathBuf>,
}

impl EnvConfig {
    /// 从环境变量加载配置
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// 从任意查找函数加载配置（测试不修改进程环境）
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let interface = match lookup("HOST").filter(|v| !v.is_empty()) {
            Some(raw) => raw.parse::<IpAddr>().unwrap_or_else(|_| {
                warn!(value = %raw, default = %WILDCARD, "Invalid HOST, using default");
                WILDCARD
            }),
            None => WILDCARD,
        };

        let port = match lookup("PORT").filter(|v| !v.is_empty()) {
            Some(raw) => match raw.parse::<u16>() {
                Ok(port) if port != 0 => port,
                _ => {
                    warn!(value = %raw, default = constants::DEFAULT_PORT, "Invalid PORT, using default");
                    constants::DEFAULT_PORT
                }
            },
            None => constants::DEFAULT_PORT,
        };

        let template_dir = lookup("TEMPLATE_DIR")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
        let static_dir = lookup("STATIC_DIR")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        Self {
            bind: PortBinding::new(interface, port),
            template_dir,
            static_dir,
        }
    }

    /// 覆盖监听地址 / 端口（命令行参数优先）
    pub fn with_overrides(mut self, host: Option<IpAddr>, port: Option<u16>) -> Self {
        if let Some(host) = host {
            self.bind.interface = host;
        }
        if let Some(port) = port {
            self.bind.port = port;
        }
        self
    }
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

/// 常量
pub mod constants {
    /// 未设置 PORT 时的默认端口
    pub const DEFAULT_PORT: u16 = 5000;

    /// 首页必须包含的文本（用于探测）
    pub const PAGE_MARKER: &str = "Welcome to Flask + Bootstrap";

    /// 服务名称
    pub const SERVICE_NAME: &str = "webbox";

    /// 版本号
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");
}
