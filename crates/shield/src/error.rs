//! SmartShield 错误类型
//!
//! 区分三类情况：准入拒绝（客户端导致，终止请求）、下游写入失败（连接中断）、
//! 以及写入器能力不支持。调用方收到 `Write` 错误时应视为响应已被 shield 终止，不应重试。

use thiserror::Error;

/// SmartShield 统一错误枚举
#[derive(Debug, Error)]
pub enum ShieldError {
    /// 客户端用量超过硬阈值，已发送 503
    #[error("Pending request cancelled due to SmartShield (client {client}, group {group})")]
    Rejected { client: String, group: String },

    /// 响应已处于终止状态（被拒绝或已中断），后续写入被忽略
    #[error("Response already terminated by SmartShield")]
    Terminated,

    /// 限速等待期间客户端断开
    #[error("Throttled request cancelled before completion")]
    Cancelled,

    /// 底层写入器 I/O 失败
    #[error("Downstream write failed: {0}")]
    Io(#[from] std::io::Error),

    /// 底层写入器不具备该能力（flush / hijack）
    #[error("{capability} not supported by the underlying writer")]
    NotSupported { capability: &'static str },

    /// 策略配置不合法
    #[error("Invalid shield policy '{group}': {reason}")]
    InvalidPolicy { group: String, reason: String },
}

impl ShieldError {
    pub fn invalid_policy(group: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPolicy {
            group: group.into(),
            reason: reason.into(),
        }
    }

    /// 是否为 shield 主动终止（拒绝 / 已终止），而非传输层故障
    pub fn is_shield_termination(&self) -> bool {
        matches!(self, Self::Rejected { .. } | Self::Terminated)
    }
}

pub type Result<T> = std::result::Result<T, ShieldError>;
