//! 端口绑定与端口映射
//!
//! 纯数据类型，无 tokio/axum 依赖

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use thiserror::Error;

/// Interface the process listens on when `HOST` is unset.
pub const WILDCARD: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

/// 进程监听的 (interface, port)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    pub interface: IpAddr,
    pub port: u16,
}

impl PortBinding {
    pub fn new(interface: IpAddr, port: u16) -> Self {
        Self { interface, port }
    }

    /// 绑定所有接口
    pub fn wildcard(port: u16) -> Self {
        Self::new(WILDCARD, port)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.interface, self.port)
    }

    /// Traffic from outside the container's network namespace never reaches a
    /// loopback listener.
    pub fn is_reachable_from_host(&self) -> bool {
        !self.interface.is_loopback()
    }
}

impl fmt::Display for PortBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

/// 传输协议
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum MappingError {
    #[error("invalid port mapping '{0}'")]
    Invalid(String),
    #[error("invalid port '{value}' in mapping '{mapping}'")]
    InvalidPort { mapping: String, value: String },
    #[error("unknown protocol '{0}'")]
    UnknownProtocol(String),
    #[error(
        "mapping {mapping} targets container port {declared} but the process binds port {bound}"
    )]
    PortMismatch {
        mapping: String,
        declared: u16,
        bound: u16,
    },
    #[error("process binds loopback {0}; published traffic cannot reach it")]
    LoopbackBind(PortBinding),
}

/// 端口映射配置 (host -> container)
///
/// Docker short syntax: `[host_ip:][host_port:]container_port[/protocol]`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    /// 宿主机监听地址（为空表示所有接口）
    pub host_ip: Option<IpAddr>,
    /// 宿主机端口（为空表示由运行时分配）
    pub host_port: Option<u16>,
    /// 容器内端口
    pub container_port: u16,
    pub protocol: Protocol,
}

impl PortMapping {
    /// 宿主机端口与容器端口相同
    pub fn same(port: u16) -> Self {
        Self::new(port, port)
    }

    pub fn new(host_port: u16, container_port: u16) -> Self {
        Self {
            host_ip: None,
            host_port: Some(host_port),
            container_port,
            protocol: Protocol::Tcp,
        }
    }

    /// 解析 docker 短格式
    /// 例如: "5000", "8080:5000", "127.0.0.1:8080:5000/tcp"
    pub fn parse(spec: &str) -> Result<Self, MappingError> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err(MappingError::Invalid(spec.to_string()));
        }

        let (ports, protocol) = match spec.rsplit_once('/') {
            Some((ports, proto)) => {
                let protocol = match proto.to_ascii_lowercase().as_str() {
                    "tcp" => Protocol::Tcp,
                    "udp" => Protocol::Udp,
                    other => return Err(MappingError::UnknownProtocol(other.to_string())),
                };
                (ports, protocol)
            }
            None => (spec, Protocol::Tcp),
        };

        let port = |value: &str| -> Result<u16, MappingError> {
            value.parse().map_err(|_| MappingError::InvalidPort {
                mapping: spec.to_string(),
                value: value.to_string(),
            })
        };

        // IPv6 host addresses are written in brackets: [::1]:8080:5000
        let (host_ip, rest) = if let Some(stripped) = ports.strip_prefix('[') {
            let (ip, rest) = stripped
                .split_once("]:")
                .ok_or_else(|| MappingError::Invalid(spec.to_string()))?;
            let ip = ip
                .parse()
                .map_err(|_| MappingError::Invalid(spec.to_string()))?;
            (Some(ip), rest)
        } else {
            (None, ports)
        };

        let parts: Vec<&str> = rest.split(':').collect();
        let mapping = match (host_ip, parts.as_slice()) {
            (None, [container]) => Self {
                host_ip: None,
                host_port: None,
                container_port: port(container)?,
                protocol,
            },
            (ip, [host, container]) => Self {
                host_ip: ip,
                host_port: Some(port(host)?),
                container_port: port(container)?,
                protocol,
            },
            (None, [ip, host, container]) => Self {
                host_ip: Some(
                    ip.parse()
                        .map_err(|_| MappingError::Invalid(spec.to_string()))?,
                ),
                host_port: if host.is_empty() { None } else { Some(port(host)?) },
                container_port: port(container)?,
                protocol,
            },
            _ => return Err(MappingError::Invalid(spec.to_string())),
        };

        Ok(mapping)
    }

    /// 检查映射是否指向进程实际绑定的端口
    pub fn check_against(&self, binding: &PortBinding) -> Result<(), MappingError> {
        if !binding.is_reachable_from_host() {
            return Err(MappingError::LoopbackBind(*binding));
        }
        if self.container_port != binding.port {
            return Err(MappingError::PortMismatch {
                mapping: self.to_string(),
                declared: self.container_port,
                bound: binding.port,
            });
        }
        Ok(())
    }

    /// Address to probe on the host before publishing.
    pub fn host_socket(&self) -> Option<SocketAddr> {
        self.host_port
            .map(|port| SocketAddr::new(self.host_ip.unwrap_or(WILDCARD), port))
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.host_ip {
            Some(IpAddr::V6(ip)) => write!(f, "[{}]:", ip)?,
            Some(ip) => write!(f, "{}:", ip)?,
            None => {}
        }
        match (self.host_ip, self.host_port) {
            (_, Some(port)) => write!(f, "{}:", port)?,
            (Some(_), None) => write!(f, ":")?,
            (None, None) => {}
        }
        write!(f, "{}", self.container_port)?;
        if self.protocol != Protocol::Tcp {
            write!(f, "/{}", self.protocol.as_str())?;
        }
        Ok(())
    }
}
