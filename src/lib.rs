//! # portico
//!
//! 带 SmartShield 自适应准入控制的反向代理

pub mod service;

// Re-export commonly used types
pub use portico_common::config::PorticoConfig;
pub use service::ServiceManager;
