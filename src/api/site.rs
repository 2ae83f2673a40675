//! 页面与静态资源
//!
//! GET /, GET /static/*path

use axum::{
    extract::{Path, State},
    http::header,
    response::{Html, IntoResponse},
    routing::get,
    Router,
};
use std::sync::Arc;
use tracing::error;

use crate::error::{ApiError, ApiResult};
use crate::services::site::content_type;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(index))
        .route("/static/*path", get(static_asset))
}

/// 首页
///
/// GET /
async fn index(State(state): State<Arc<AppState>>) -> ApiResult<Html<String>> {
    let page = state.site.render("index.html").map_err(|e| {
        error!(error = %e, "Failed to render index.html");
        ApiError::internal(format!("Failed to render page: {}", e))
    })?;
    Ok(Html(page))
}

/// 静态资源
///
/// GET /static/*path
async fn static_asset(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let bytes = state
        .site
        .asset(&path)
        .await
        .map_err(|e| {
            error!(path = %path, error = %e, "Failed to read asset");
            ApiError::internal(format!("Failed to read asset: {}", e))
        })?
        .ok_or_else(|| ApiError::not_found(format!("Asset '{}'", path)))?;

    Ok(([(header::CONTENT_TYPE, content_type(&path))], bytes))
}
