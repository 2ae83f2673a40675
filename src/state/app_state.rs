//! 应用状态

use chrono::{DateTime, Utc};

use crate::config::EnvConfig;
use crate::services::site::SiteRenderer;

/// 应用状态
///
/// 只读：启动后不再修改，handlers 通过 `Arc<AppState>` 共享
pub struct AppState {
    /// 环境配置
    pub config: EnvConfig,
    /// 页面渲染器
    pub site: SiteRenderer,
    /// 服务启动时间
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(config: EnvConfig, site: SiteRenderer) -> Self {
        Self {
            config,
            site,
            started_at: Utc::now(),
        }
    }
}
