//! Prometheus 监控指标模块
//!
//! 提供全局指标收集和导出功能

use lazy_static::lazy_static;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::Once;
use std::time::Instant;

static METRICS_INIT: Once = Once::new();

lazy_static! {
    /// 全局 Prometheus Registry
    pub static ref REGISTRY: Registry = Registry::new();

    // ========== SmartShield 指标 ==========

    /// 准入决策次数（allow / throttle / reject）
    pub static ref SHIELD_DECISIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("shield_decisions_total", "Total number of SmartShield admission decisions")
            .namespace("portico"),
        &["group", "decision"]
    ).unwrap();

    /// 当前跟踪的客户端数
    pub static ref SHIELD_TRACKED_CLIENTS: IntGauge = IntGauge::with_opts(
        Opts::new("shield_tracked_clients", "Number of clients tracked by SmartShield")
            .namespace("portico")
    ).unwrap();

    // ========== 代理指标 ==========

    /// 代理请求延迟（秒）
    pub static ref PROXY_REQUEST_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new("proxy_request_duration_seconds", "Proxied request duration in seconds")
            .namespace("portico")
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
        &["route", "method", "status"]
    ).unwrap();

    /// 代理请求总数
    pub static ref PROXY_REQUESTS: IntCounterVec = IntCounterVec::new(
        Opts::new("proxy_requests_total", "Total number of proxied requests")
            .namespace("portico"),
        &["route", "method", "status"]
    ).unwrap();

    /// 上游错误次数
    pub static ref UPSTREAM_ERRORS: IntCounterVec = IntCounterVec::new(
        Opts::new("upstream_errors_total", "Total number of upstream failures")
            .namespace("portico"),
        &["route", "error_type"]
    ).unwrap();

    // ========== 管理接口指标 ==========

    /// 认证失败次数
    pub static ref AUTH_FAILURES: IntCounterVec = IntCounterVec::new(
        Opts::new("auth_failures_total", "Total number of admin authentication failures")
            .namespace("portico"),
        &["reason"]
    ).unwrap();

    /// 配置重载次数
    pub static ref CONFIG_RELOADS: IntCounterVec = IntCounterVec::new(
        Opts::new("config_reloads_total", "Total number of configuration reloads")
            .namespace("portico"),
        &["source", "status"]
    ).unwrap();
}

/// 注册所有指标到全局 Registry
///
/// This function is idempotent - calling it multiple times is safe.
/// Only the first call will actually register the metrics.
pub fn register_metrics() -> Result<(), prometheus::Error> {
    let mut result = Ok(());

    METRICS_INIT.call_once(|| {
        let register_result = (|| {
            REGISTRY.register(Box::new(SHIELD_DECISIONS.clone()))?;
            REGISTRY.register(Box::new(SHIELD_TRACKED_CLIENTS.clone()))?;

            REGISTRY.register(Box::new(PROXY_REQUEST_DURATION.clone()))?;
            REGISTRY.register(Box::new(PROXY_REQUESTS.clone()))?;
            REGISTRY.register(Box::new(UPSTREAM_ERRORS.clone()))?;

            REGISTRY.register(Box::new(AUTH_FAILURES.clone()))?;
            REGISTRY.register(Box::new(CONFIG_RELOADS.clone()))?;

            Ok::<(), prometheus::Error>(())
        })();

        if let Err(e) = register_result {
            result = Err(e);
        }
    });

    result
}

/// 代理请求计时器
pub struct RequestTimer {
    start: Instant,
    route: String,
    method: String,
}

impl RequestTimer {
    pub fn new(route: &str, method: &str) -> Self {
        Self {
            start: Instant::now(),
            route: route.to_string(),
            method: method.to_string(),
        }
    }

    /// 完成计时并记录指标
    pub fn observe(self, status: u16) {
        let duration = self.start.elapsed().as_secs_f64();
        let status_str = status.to_string();

        PROXY_REQUEST_DURATION
            .with_label_values(&[&self.route, &self.method, &status_str])
            .observe(duration);

        PROXY_REQUESTS
            .with_label_values(&[&self.route, &self.method, &status_str])
            .inc();
    }
}

/// 记录一次 shield 决策
pub fn record_shield_decision(group: &str, decision: &str) {
    SHIELD_DECISIONS.with_label_values(&[group, decision]).inc();
}

/// 导出 Prometheus 格式的指标
pub fn export_metrics() -> Result<String, prometheus::Error> {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;

    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
