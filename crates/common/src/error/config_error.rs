//! 配置相关错误类型
//!
//! 定义所有与配置解析、验证、加载、持久化相关的错误

use thiserror::Error;

/// 配置相关错误
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    #[error("Path is not a valid file: {path}")]
    NotAFile { path: String },

    #[error("Failed to read or write configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Configuration validation failed: {}", errors.join("; "))]
    Invalid { errors: Vec<String> },
}

impl ConfigError {
    /// 只保留非警告的校验错误；全部是警告时返回 None
    pub fn from_validation(errors: Vec<String>) -> Option<Self> {
        let critical: Vec<String> = errors
            .into_iter()
            .filter(|e| !e.starts_with("Warning:"))
            .collect();
        if critical.is_empty() {
            None
        } else {
            Some(Self::Invalid { errors: critical })
        }
    }
}
