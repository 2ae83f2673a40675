//! webbox - 单页站点及其容器构建 / 运行生命周期工具
//!
//! 库入口：HTTP 服务启动与各模块导出

pub mod error;
pub mod infra;
pub mod domain;
pub mod config;
pub mod state;
pub mod api;
pub mod services;

use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::EnvConfig;
use crate::error::{LifecycleError, StartError};
use crate::services::site::SiteRenderer;
use crate::state::AppState;

/// 绑定监听端口
///
/// Bind failures are start-time errors; nothing is retried.
pub async fn bind(config: &EnvConfig) -> Result<TcpListener, StartError> {
    let addr = config.bind.socket_addr();
    TcpListener::bind(addr)
        .await
        .map_err(|e| StartError::from_bind(addr, e))
}

/// 在已绑定的 listener 上运行服务，直到 `shutdown` 被触发
pub async fn serve_on(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown: CancellationToken,
) -> Result<(), LifecycleError> {
    let app = api::router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| LifecycleError::Runtime(format!("server error: {}", e)))?;
    info!("Server stopped");
    Ok(())
}

/// 启动应用进程：加载模板、绑定端口、处理请求
pub async fn run_server(config: EnvConfig, shutdown: CancellationToken) -> Result<(), LifecycleError> {
    let site = SiteRenderer::new(&config)?;
    let listener = bind(&config).await?;
    let local = listener.local_addr()?;

    if !config.bind.is_reachable_from_host() {
        tracing::warn!(
            bind = %config.bind,
            "Listening on loopback only; a published container port will not reach this process"
        );
    }
    info!(
        addr = %local,
        templates = site.template_source(),
        version = config::env::constants::VERSION,
        "Server listening"
    );

    let state = Arc::new(AppState::new(config, site));
    serve_on(listener, state, shutdown).await
}
