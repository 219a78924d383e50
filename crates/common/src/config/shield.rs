//! SmartShield 配置
//!
//! 后台清理周期、记录保留期、客户端识别方式以及各分组的准入策略。

use serde::{Deserialize, Serialize};
use shield::ShieldPolicy;
use std::net::IpAddr;
use std::time::Duration;

/// SmartShield 全局配置
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ShieldConfig {
    /// 总开关，关闭后所有路由都不受保护
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// 后台清理任务周期（秒）
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// 拒绝状态与空闲记录的保留期（秒），默认一小时
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,

    /// 是否信任 X-Forwarded-For 的第一跳作为客户端标识
    ///
    /// 仅在 portico 位于另一层可信代理之后时开启。
    #[serde(default)]
    pub trust_forwarded_for: bool,

    /// 白名单来源，视为特权调用方
    #[serde(default)]
    pub allow_list: Vec<IpAddr>,

    /// 各分组的准入策略
    #[serde(default)]
    pub policies: Vec<ShieldPolicy>,
}

fn default_true() -> bool {
    true
}

fn default_sweep_interval_secs() -> u64 {
    300
}

fn default_retention_secs() -> u64 {
    3600
}

impl Default for ShieldConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sweep_interval_secs: default_sweep_interval_secs(),
            retention_secs: default_retention_secs(),
            trust_forwarded_for: false,
            allow_list: Vec::new(),
            policies: Vec::new(),
        }
    }
}

impl ShieldConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn policy(&self, group: &str) -> Option<&ShieldPolicy> {
        self.policies.iter().find(|policy| policy.group == group)
    }

    pub fn is_allow_listed(&self, ip: &IpAddr) -> bool {
        self.allow_list.contains(ip)
    }

    /// 校验 shield 配置，错误追加到 `errors`
    pub fn validate_into(&self, errors: &mut Vec<String>) {
        if self.sweep_interval_secs == 0 {
            errors.push("shield.sweep_interval_secs must be greater than 0".to_string());
        }
        if self.retention_secs == 0 {
            errors.push("shield.retention_secs must be greater than 0".to_string());
        }

        let mut seen = std::collections::HashSet::new();
        for policy in &self.policies {
            if !seen.insert(policy.group.as_str()) {
                errors.push(format!("Duplicate shield policy group '{}'", policy.group));
            }
            if let Err(e) = policy.validate() {
                errors.push(e.to_string());
            }
        }
    }
}
