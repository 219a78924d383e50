//! Portico 基础设施库
//!
//! 为反向代理与管理接口提供共享组件：统一配置模型、错误类型与 Prometheus 指标

pub mod config;
pub mod error;
pub mod metrics;

// Re-export commonly used types for convenience
pub use config::PorticoConfig;
pub use error::{BaseError, ConfigError, Result};
