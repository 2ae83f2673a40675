//! 容器相关领域模型

use serde::{Deserialize, Serialize};

/// `docker ps --format` template matching [`ContainerInfo::parse_ps_line`].
pub const PS_FORMAT: &str =
    "{{.ID}}|{{.Names}}|{{.Image}}|{{.Status}}|{{.State}}|{{.CreatedAt}}|{{.Ports}}";

/// 容器信息
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: String,
    pub state: String,
    pub created: String,
    pub ports: Vec<String>,
}

impl ContainerInfo {
    /// Parse one line of `docker ps --format PS_FORMAT` output.
    pub fn parse_ps_line(line: &str) -> Option<Self> {
        if line.trim().is_empty() {
            return None;
        }
        let parts: Vec<&str> = line.split('|').collect();
        let field = |i: usize| parts.get(i).copied().unwrap_or("").trim().to_string();
        Some(ContainerInfo {
            id: field(0),
            name: field(1),
            image: field(2),
            status: field(3),
            state: field(4),
            created: field(5),
            ports: parts
                .get(6)
                .copied()
                .unwrap_or("")
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        })
    }

    pub fn is_running(&self) -> bool {
        self.state.eq_ignore_ascii_case("running")
    }
}

/// 环境变量
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvVar {
    pub key: String,
    pub value: String,
}

impl EnvVar {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// `KEY=value` as passed to `docker run -e`
    pub fn to_arg(&self) -> String {
        format!("{}={}", self.key, self.value)
    }
}
