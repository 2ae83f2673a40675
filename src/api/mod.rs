//! API 模块
//!
//! HTTP handlers 和路由组装

pub mod health;
pub mod site;

use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// 构建完整的路由
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // Page & assets
        .merge(site::router())
        // Health
        .merge(health::router())
        // Middleware
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
