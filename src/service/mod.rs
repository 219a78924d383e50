//! 服务管理模块
//!
//! 把代理路由挂到 HTTP/HTTPS 监听上，并管理 SmartShield 清理任务与关停流程

pub mod manager;
pub mod trace;

pub use manager::ServiceManager;
