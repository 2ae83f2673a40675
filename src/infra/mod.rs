//! 基础设施模块
//!
//! 封装外部依赖（HTTP client、命令执行等）

pub mod command;
pub mod probe_client;

pub use command::CommandRunner;
pub use probe_client::ProbeClient;
