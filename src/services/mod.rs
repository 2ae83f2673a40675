//! 服务层模块
//!
//! 包含核心业务逻辑

pub mod build;
pub mod check;
pub mod preflight;
pub mod runtime;
pub mod site;
