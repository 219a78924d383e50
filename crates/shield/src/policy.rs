//! Shield 策略
//!
//! 每个 shield-group 一份的静态配置，由配置子系统加载，热更新时整体替换。

use crate::error::{Result, ShieldError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 单个 shield-group 的准入策略
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShieldPolicy {
    /// 受保护的路由组标识
    pub group: String,

    /// 用量累计窗口（秒）
    ///
    /// 客户端停止请求后，已累计的用量在一个窗口内线性衰减到 0。
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// 软阈值：达到后开始分级限速
    pub soft_threshold: f64,

    /// 硬阈值：达到后拒绝请求（503）
    pub hard_threshold: f64,

    /// 管理员 / 白名单来源是否完全跳过 shield
    #[serde(default = "default_true")]
    pub bypass_privileged: bool,

    /// 刚越过软阈值时的最小延迟（毫秒）
    #[serde(default = "default_throttle_floor_ms")]
    pub throttle_floor_ms: u64,

    /// 逼近硬阈值时的最大延迟（毫秒）
    #[serde(default = "default_throttle_ceiling_ms")]
    pub throttle_ceiling_ms: u64,
}

fn default_window_secs() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

fn default_throttle_floor_ms() -> u64 {
    100
}

fn default_throttle_ceiling_ms() -> u64 {
    5_000
}

impl ShieldPolicy {
    /// 使用默认窗口与限速区间创建策略
    pub fn new(group: impl Into<String>, soft_threshold: f64, hard_threshold: f64) -> Self {
        Self {
            group: group.into(),
            window_secs: default_window_secs(),
            soft_threshold,
            hard_threshold,
            bypass_privileged: true,
            throttle_floor_ms: default_throttle_floor_ms(),
            throttle_ceiling_ms: default_throttle_ceiling_ms(),
        }
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window_secs = window.as_secs();
        self
    }

    pub fn with_throttle_range(mut self, floor: Duration, ceiling: Duration) -> Self {
        self.throttle_floor_ms = u64::try_from(floor.as_millis()).unwrap_or(u64::MAX);
        self.throttle_ceiling_ms = u64::try_from(ceiling.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_bypass_privileged(mut self, bypass: bool) -> Self {
        self.bypass_privileged = bypass;
        self
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn throttle_floor(&self) -> Duration {
        Duration::from_millis(self.throttle_floor_ms)
    }

    pub fn throttle_ceiling(&self) -> Duration {
        Duration::from_millis(self.throttle_ceiling_ms)
    }

    /// 校验阈值关系与窗口
    pub fn validate(&self) -> Result<()> {
        if self.group.trim().is_empty() {
            return Err(ShieldError::invalid_policy(
                &self.group,
                "group name cannot be empty",
            ));
        }
        for (name, value) in [
            ("soft_threshold", self.soft_threshold),
            ("hard_threshold", self.hard_threshold),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ShieldError::invalid_policy(
                    &self.group,
                    format!("{name} must be a non-negative number, got {value}"),
                ));
            }
        }
        if self.soft_threshold > self.hard_threshold {
            return Err(ShieldError::invalid_policy(
                &self.group,
                format!(
                    "soft_threshold ({}) must not exceed hard_threshold ({})",
                    self.soft_threshold, self.hard_threshold
                ),
            ));
        }
        if self.window_secs == 0 {
            return Err(ShieldError::invalid_policy(
                &self.group,
                "window_secs must be greater than 0",
            ));
        }
        if self.throttle_floor_ms > self.throttle_ceiling_ms {
            return Err(ShieldError::invalid_policy(
                &self.group,
                "throttle_floor_ms must not exceed throttle_ceiling_ms",
            ));
        }
        Ok(())
    }
}
