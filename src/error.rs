//! 统一错误处理
//!
//! - `ApiError`: HTTP 层错误，实现 `IntoResponse`
//! - `LifecycleError`: 构建 / 启动 / 运行期错误，映射为进程退出码

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

use crate::domain::binding::MappingError;
use crate::domain::descriptor::DescriptorError;
use crate::domain::manifest::ManifestError;
use crate::infra::command::CommandError;

/// API 错误响应结构
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// HTTP 错误类型
#[derive(Debug)]
pub enum ApiError {
    /// 404 - 资源未找到
    NotFound(String),
    /// 500 - 内部错误（如模板渲染失败）
    Internal(String),
}

impl ApiError {
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound(resource.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            ApiError::NotFound(resource) => (
                StatusCode::NOT_FOUND,
                "not_found",
                format!("{} not found", resource),
            ),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
        };

        let body = ErrorResponse::new(error_type, message);
        (status, Json(body)).into_response()
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::NotFound(r) => write!(f, "Not found: {}", r),
            ApiError::Internal(m) => write!(f, "Internal error: {}", m),
        }
    }
}

impl std::error::Error for ApiError {}

pub type ApiResult<T> = Result<T, ApiError>;

/// 构建期错误：构建中止，不产生镜像标签
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("{0} not found")]
    FileMissing(PathBuf),

    #[error("invalid build descriptor: {0}")]
    Descriptor(#[from] DescriptorError),

    #[error("step {step} ({instruction}): '{path}' not found in build context")]
    MissingInput {
        step: usize,
        instruction: String,
        path: String,
    },

    #[error("step {step}: COPY --from={stage} refers to an unknown stage")]
    UnknownStage { step: usize, stage: String },

    #[error("step {step}: dependency install reads {manifest} but it was never copied into the image")]
    ManifestNotCopied { step: usize, manifest: String },

    #[error("step {step}: invalid dependency manifest: {source}")]
    InvalidManifest {
        step: usize,
        #[source]
        source: ManifestError,
    },

    #[error("step {step}: cannot install {requirement}: {reason}")]
    Unresolvable {
        step: usize,
        requirement: String,
        reason: String,
    },

    #[error("docker build exited with status {0}")]
    DockerFailed(i32),

    #[error("layer cache: {0}")]
    Cache(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// 启动期错误：容器 / 进程未启动
#[derive(Debug, Error)]
pub enum StartError {
    #[error("port {addr} is already in use")]
    PortInUse { addr: SocketAddr },

    #[error("binding port {addr} is not permitted")]
    PortDenied { addr: SocketAddr },

    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Mapping(#[from] MappingError),

    #[error("container runtime refused to start '{name}' (exit {code}): {stderr}")]
    RuntimeRejected {
        name: String,
        code: i32,
        stderr: String,
    },
}

impl StartError {
    /// Map a bind failure by its I/O error kind. No further root-cause guessing.
    pub fn from_bind(addr: SocketAddr, source: std::io::Error) -> Self {
        match source.kind() {
            std::io::ErrorKind::AddrInUse => StartError::PortInUse { addr },
            std::io::ErrorKind::PermissionDenied => StartError::PortDenied { addr },
            _ => StartError::Bind { addr, source },
        }
    }
}

/// 生命周期错误
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("build failed: {0}")]
    Build(#[from] BuildError),

    #[error("start failed: {0}")]
    Start(#[from] StartError),

    /// Already-started process cannot continue (e.g. templates missing)
    #[error("runtime failure: {0}")]
    Runtime(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LifecycleError {
    /// 进程退出码
    pub fn exit_code(&self) -> i32 {
        match self {
            LifecycleError::Build(_) => 2,
            LifecycleError::Start(_) => 3,
            LifecycleError::Runtime(_) => 4,
            LifecycleError::Config(_) => 5,
            LifecycleError::Command(_) | LifecycleError::Io(_) => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_response_new() {
        let resp = ErrorResponse::new("not_found", "asset not found");
        assert_eq!(resp.error, "not_found");
        assert!(resp.details.is_none());

        let resp = resp.with_details("css/missing.css");
        assert_eq!(resp.details, Some("css/missing.css".to_string()));
    }

    #[test]
    fn test_api_error_status() {
        let resp = ApiError::not_found("asset").into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let resp = ApiError::internal("boom").into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_start_error_from_bind_kind() {
        let addr: SocketAddr = "0.0.0.0:80".parse().unwrap();
        let err = StartError::from_bind(addr, std::io::Error::from(std::io::ErrorKind::AddrInUse));
        assert!(matches!(err, StartError::PortInUse { .. }));
        let err = StartError::from_bind(
            addr,
            std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        );
        assert!(matches!(err, StartError::PortDenied { .. }));
        let err = StartError::from_bind(addr, std::io::Error::from(std::io::ErrorKind::Other));
        assert!(matches!(err, StartError::Bind { .. }));
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(LifecycleError::from(BuildError::DockerFailed(1)).exit_code(), 2);
        let addr: SocketAddr = "0.0.0.0:5000".parse().unwrap();
        assert_eq!(
            LifecycleError::from(StartError::PortInUse { addr }).exit_code(),
            3
        );
        assert_eq!(LifecycleError::Runtime("x".into()).exit_code(), 4);
        assert_eq!(LifecycleError::Config("x".into()).exit_code(), 5);
    }
}
