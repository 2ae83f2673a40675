//! 领域模型模块
//!
//! 纯数据结构与解析，不依赖 axum/tokio

pub mod binding;
pub mod compose;
pub mod container;
pub mod descriptor;
pub mod finding;
pub mod manifest;
pub mod step;

// Re-exports for convenience
pub use binding::{PortBinding, PortMapping};
pub use compose::ComposeFile;
pub use container::{ContainerInfo, EnvVar};
pub use descriptor::BuildDescriptor;
pub use finding::{Finding, Severity};
pub use manifest::{DependencyManifest, Requirement};
pub use step::{LogLine, StepRecord, StepStatus};
