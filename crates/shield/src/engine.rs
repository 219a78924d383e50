//! 准入决策引擎
//!
//! 纯函数，无共享状态，可并发调用：
//! - `decide`：根据策略与当前用量给出放行 / 限速 / 拒绝
//! - `cost_of`：根据请求方法与最终状态码计算单次请求的开销

use crate::policy::ShieldPolicy;
use http::{Method, StatusCode};
use std::time::Duration;
use strum::Display;

/// 读请求基础开销
pub const READ_COST: f64 = 1.0;
/// 写请求基础开销
pub const WRITE_COST: f64 = 5.0;
/// 错误响应（>= 400）的惩罚倍数
pub const ERROR_MULTIPLIER: f64 = 30.0;

/// 准入决策
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Decision {
    Allow,
    Throttle(Duration),
    Reject,
}

impl Decision {
    /// 需要等待的时长，非限速决策为 0
    pub fn delay(&self) -> Duration {
        match self {
            Decision::Throttle(delay) => *delay,
            _ => Duration::ZERO,
        }
    }
}

/// 对当前用量做出准入决策
///
/// 未配置策略的分组视为不受保护，始终放行。
pub fn decide(policy: Option<&ShieldPolicy>, consumed: f64, privileged: bool) -> Decision {
    let Some(policy) = policy else {
        return Decision::Allow;
    };
    if privileged && policy.bypass_privileged {
        return Decision::Allow;
    }

    if consumed >= policy.hard_threshold {
        Decision::Reject
    } else if consumed >= policy.soft_threshold {
        Decision::Throttle(throttle_delay(policy, consumed))
    } else {
        Decision::Allow
    }
}

/// 分级限速曲线：`floor + (ceiling - floor) * r²`
///
/// `r` 为用量在 [soft, hard) 区间内的相对位置，结果单调不减且不超过 ceiling。
fn throttle_delay(policy: &ShieldPolicy, consumed: f64) -> Duration {
    let span = policy.hard_threshold - policy.soft_threshold;
    let ratio = if span > 0.0 {
        ((consumed - policy.soft_threshold) / span).clamp(0.0, 1.0)
    } else {
        1.0
    };

    let floor = policy.throttle_floor().as_secs_f64();
    let ceiling = policy.throttle_ceiling().as_secs_f64();
    let delay = floor + (ceiling - floor) * ratio * ratio;
    Duration::from_secs_f64(delay.clamp(floor, ceiling))
}

/// 计算请求开销
///
/// 只有 GET 基础开销为 1，其余方法（包括 HEAD/OPTIONS）为 5；
/// 状态码 >= 400 时乘以 30，使制造错误的流量更快耗尽额度。
pub fn cost_of(method: &Method, status: StatusCode) -> f64 {
    let base = if *method == Method::GET {
        READ_COST
    } else {
        WRITE_COST
    };
    if status.as_u16() >= 400 {
        base * ERROR_MULTIPLIER
    } else {
        base
    }
}
