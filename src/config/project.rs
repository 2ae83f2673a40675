//! 项目配置
//!
//! 构建 / 运行生命周期所需的文件位置和名称

use std::env;
use std::path::{Path, PathBuf};

/// Directory under the project root holding the layer cache.
pub const CACHE_DIR_NAME: &str = ".webbox";

/// 项目配置
#[derive(Clone, Debug, PartialEq)]
pub struct ProjectConfig {
    /// 项目根目录（构建上下文）
    pub root: PathBuf,
    /// 依赖清单文件名（相对于 root）
    pub manifest: String,
    /// 构建描述文件（相对于 root）
    pub dockerfile: String,
    /// 编排描述文件（相对于 root）
    pub compose_file: String,
    /// 镜像标签
    pub image: String,
    /// 容器名称
    pub container_name: String,
}

impl ProjectConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str, default: &str| {
            lookup(key)
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        Self {
            root: PathBuf::from(get("WEBBOX_PROJECT_DIR", ".")),
            manifest: get("WEBBOX_MANIFEST", "requirements.txt"),
            dockerfile: get("WEBBOX_DOCKERFILE", "Dockerfile"),
            compose_file: get("WEBBOX_COMPOSE_FILE", "docker-compose.yml"),
            image: get("WEBBOX_IMAGE", "webbox:latest"),
            container_name: get("WEBBOX_CONTAINER", "webbox"),
        }
    }

    /// 指定项目根目录
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(&self.manifest)
    }

    pub fn dockerfile_path(&self) -> PathBuf {
        self.root.join(&self.dockerfile)
    }

    pub fn compose_path(&self) -> PathBuf {
        self.root.join(&self.compose_file)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join(CACHE_DIR_NAME)
    }

    /// Manifest file name as it appears in build instructions.
    pub fn manifest_name(&self) -> &str {
        Path::new(&self.manifest)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&self.manifest)
    }
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}
