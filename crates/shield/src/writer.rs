//! GuardedResponseWriter
//!
//! 每个请求独占一个实例，装饰底层 `ResponseSink`：
//! 在每次写入前查询注册表、做准入决策，按决策放行、限速等待或直接返回 503；
//! flush / hijack 等可选能力透明转发，不支持时优雅降级。
//!
//! 状态机：`Active -> {Allowed | Throttled -> Active | Rejected | Interrupted}`，
//! 进入 `Rejected` / `Interrupted` 后所有写入都是空操作。

use crate::engine::{self, Decision};
use crate::error::{Result, ShieldError};
use crate::policy::ShieldPolicy;
use crate::registry::ShieldRegistry;
use crate::sink::ResponseSink;
use http::header::{CONTENT_TYPE, HeaderValue};
use http::{Method, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use strum::Display;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// 拒绝响应体，与平台统一的错误信封格式一致
pub const REJECTION_BODY: &str = r#"{"status":"error","message":"Too many requests: client temporarily blocked by SmartShield","code":"SHIELD001"}"#;

/// 写入器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum WriterState {
    Active,
    Throttled,
    Allowed,
    Rejected,
    Interrupted,
}

/// 请求与 shield 的绑定信息，由上游解析后传入
#[derive(Debug, Clone)]
pub struct ShieldBinding {
    pub group: String,
    pub client: String,
    /// 未配置策略的分组不受保护
    pub policy: Option<ShieldPolicy>,
    pub method: Method,
    /// 管理员或白名单来源
    pub privileged: bool,
}

/// 单个请求的计费记录
#[derive(Debug, Clone)]
pub struct RequestAccounting {
    pub method: Method,
    pub status: Option<StatusCode>,
    pub bytes_written: u64,
    pub started_at: Instant,
    pub ended_at: Option<Instant>,
    pub cost: f64,
}

impl RequestAccounting {
    fn new(method: Method) -> Self {
        Self {
            method,
            status: None,
            bytes_written: 0,
            started_at: Instant::now(),
            ended_at: None,
            cost: 0.0,
        }
    }

    pub fn duration(&self) -> Duration {
        self.ended_at
            .unwrap_or_else(Instant::now)
            .saturating_duration_since(self.started_at)
    }
}

/// 响应结束时的结果
#[derive(Debug, Clone)]
pub struct ResponseOutcome {
    pub state: WriterState,
    pub accounting: RequestAccounting,
    /// 本次响应期间最严格的决策
    pub decision: Decision,
    pub hijacked: bool,
}

/// SmartShield 响应装饰器
pub struct GuardedResponseWriter<S: ResponseSink> {
    inner: S,
    registry: Arc<ShieldRegistry>,
    binding: ShieldBinding,
    cancel: Option<CancellationToken>,
    accounting: RequestAccounting,
    state: WriterState,
    decision: Decision,
    header_written: bool,
    cost_recorded: bool,
    hijacked: bool,
    rejected_at: Option<Instant>,
    /// `admit()` 已经完成过一次限速等待，下一次检查只看是否拒绝
    throttle_served: bool,
}

impl<S: ResponseSink> GuardedResponseWriter<S> {
    pub fn new(inner: S, registry: Arc<ShieldRegistry>, binding: ShieldBinding) -> Self {
        if let Some(policy) = &binding.policy {
            registry.ensure_group(policy);
        }
        let accounting = RequestAccounting::new(binding.method.clone());
        Self {
            inner,
            registry,
            binding,
            cancel: None,
            accounting,
            state: WriterState::Active,
            decision: Decision::Allow,
            header_written: false,
            cost_recorded: false,
            hijacked: false,
            rejected_at: None,
            throttle_served: false,
        }
    }

    /// 绑定请求自身的取消信号，客户端断开时提前结束限速等待
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn binding(&self) -> &ShieldBinding {
        &self.binding
    }

    pub fn accounting(&self) -> &RequestAccounting {
        &self.accounting
    }

    pub fn state(&self) -> WriterState {
        self.state
    }

    pub fn headers_mut(&mut self) -> &mut http::HeaderMap {
        self.inner.headers_mut()
    }

    /// 已被拒绝或已中断
    pub fn is_over(&self) -> bool {
        matches!(
            self.state,
            WriterState::Rejected | WriterState::Interrupted
        )
    }

    /// 已被拒绝且超过保留期，可被清理
    pub fn is_old(&self) -> bool {
        if !self.is_over() {
            return false;
        }
        let since = self.rejected_at.or(self.accounting.ended_at);
        since.is_some_and(|at| {
            Instant::now().saturating_duration_since(at) >= self.registry.retention()
        })
    }

    /// 记录状态码并计算本次请求开销；只有第一次调用生效
    pub fn write_header(&mut self, status: StatusCode) {
        if self.header_written {
            debug!(
                client = %self.binding.client,
                status = status.as_u16(),
                "superfluous write_header call ignored"
            );
            return;
        }
        self.header_written = true;
        self.accounting.status = Some(status);
        self.accounting.cost = engine::cost_of(&self.binding.method, status);

        if !self.is_over() {
            self.inner.write_header(status);
        }
    }

    /// 单独执行准入检查（拒绝 / 限速），不写入任何内容
    pub async fn admit(&mut self) -> Result<()> {
        if self.is_over() {
            return Err(ShieldError::Terminated);
        }
        let decision = self.gate().await?;
        self.throttle_served = matches!(decision, Decision::Throttle(_));
        Ok(())
    }

    pub async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if self.is_over() {
            return Err(ShieldError::Terminated);
        }
        if !self.header_written {
            self.write_header(StatusCode::OK);
        }

        self.gate().await?;

        match self.inner.write(buf).await {
            Ok(n) => {
                self.accounting.bytes_written += n as u64;
                self.record_cost_once();
                Ok(n)
            }
            Err(e) => {
                self.interrupt();
                debug!(
                    client = %self.binding.client,
                    group = %self.binding.group,
                    error = %e,
                    "downstream write failed, connection marked interrupted"
                );
                Err(ShieldError::Io(e))
            }
        }
    }

    /// 透传 flush；底层不支持时静默跳过
    pub fn flush(&mut self) -> Result<()> {
        let Some(flusher) = self.inner.flusher() else {
            return Ok(());
        };
        if let Err(e) = flusher.flush() {
            self.interrupt();
            return Err(ShieldError::Io(e));
        }
        Ok(())
    }

    /// 当前能否接管连接；协议升级在提交 101 之前先确认
    pub fn can_hijack(&mut self) -> bool {
        !self.is_over() && self.inner.hijacker().is_some()
    }

    /// 透传 hijack；底层不支持时返回 `NotSupported`
    pub fn hijack(&mut self) -> Result<S::Conn> {
        if self.is_over() {
            return Err(ShieldError::Terminated);
        }
        let Some(hijacker) = self.inner.hijacker() else {
            return Err(ShieldError::NotSupported {
                capability: "hijack",
            });
        };
        let conn = hijacker.hijack()?;
        self.hijacked = true;
        self.record_cost_once();
        Ok(conn)
    }

    /// 结束响应
    ///
    /// 没有写过正文的响应（只有状态行）在这里补一次准入检查与计费。
    pub async fn finish(mut self) -> ResponseOutcome {
        if !self.is_over() && !self.hijacked {
            if self.accounting.bytes_written == 0 {
                // 结果已经反映在状态机里
                let _ = self.write(&[]).await;
            }
            if !self.is_over() {
                let _ = self.flush();
            }
        }

        if matches!(self.state, WriterState::Active | WriterState::Throttled) {
            self.state = WriterState::Allowed;
        }
        if self.accounting.ended_at.is_none() {
            self.accounting.ended_at = Some(Instant::now());
        }

        ResponseOutcome {
            state: self.state,
            accounting: self.accounting,
            decision: self.decision,
            hijacked: self.hijacked,
        }
    }

    async fn gate(&mut self) -> Result<Decision> {
        let policy = match &self.binding.policy {
            Some(policy) if !(self.binding.privileged && policy.bypass_privileged) => policy,
            _ => return Ok(Decision::Allow),
        };

        let consumed = self
            .registry
            .consumed(&self.binding.group, &self.binding.client);
        let decision = engine::decide(Some(policy), consumed, self.binding.privileged);
        self.note_decision(decision);
        let throttle_served = std::mem::take(&mut self.throttle_served);

        match decision {
            Decision::Allow => Ok(decision),
            Decision::Throttle(_) if throttle_served => Ok(decision),
            Decision::Reject => {
                warn!(
                    client = %self.binding.client,
                    group = %self.binding.group,
                    consumed,
                    cost = self.accounting.cost,
                    "SmartShield: client has been blocked due to abuse"
                );
                self.reject().await;
                Err(ShieldError::Rejected {
                    client: self.binding.client.clone(),
                    group: self.binding.group.clone(),
                })
            }
            Decision::Throttle(delay) => {
                debug!(
                    client = %self.binding.client,
                    group = %self.binding.group,
                    consumed,
                    cost = self.accounting.cost,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "SmartShield: throttling client"
                );
                self.state = WriterState::Throttled;
                if throttle(self.cancel.clone(), delay).await {
                    self.interrupt();
                    return Err(ShieldError::Cancelled);
                }
                self.state = WriterState::Active;
                Ok(decision)
            }
        }
    }

    fn note_decision(&mut self, decision: Decision) {
        let rank = |d: &Decision| match d {
            Decision::Allow => 0,
            Decision::Throttle(_) => 1,
            Decision::Reject => 2,
        };
        if rank(&decision) >= rank(&self.decision) {
            self.decision = decision;
        }
    }

    /// 拒绝路径：绕过正常的头部流程，只发送一次 503
    async fn reject(&mut self) {
        let now = Instant::now();
        self.state = WriterState::Rejected;
        self.rejected_at = Some(now);
        self.accounting.ended_at = Some(now);
        self.registry
            .mark_rejected(&self.binding.group, &self.binding.client);

        let body_started = self.accounting.bytes_written > 0;
        let headers = self.inner.headers_mut();
        headers.clear();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self.inner.write_header(StatusCode::SERVICE_UNAVAILABLE);

        if !body_started
            && let Err(e) = self.inner.write(REJECTION_BODY.as_bytes()).await
        {
            debug!(client = %self.binding.client, error = %e, "failed to write rejection body");
        }
        if let Some(flusher) = self.inner.flusher() {
            let _ = flusher.flush();
        }
    }

    /// 下游写入失败：复用拒绝的记账路径，但不算策略违规
    fn interrupt(&mut self) {
        if self.is_over() {
            return;
        }
        self.state = WriterState::Interrupted;
        self.accounting.ended_at = Some(Instant::now());
    }

    fn record_cost_once(&mut self) {
        if self.cost_recorded || self.binding.policy.is_none() {
            return;
        }
        self.cost_recorded = true;
        let consumed = self.registry.record_cost(
            &self.binding.group,
            &self.binding.client,
            self.accounting.cost,
        );
        debug!(
            client = %self.binding.client,
            group = %self.binding.group,
            cost = self.accounting.cost,
            consumed = consumed.unwrap_or_default(),
            "SmartShield: request cost recorded"
        );
    }
}

/// 等待限速时长，返回是否被取消
async fn throttle(cancel: Option<CancellationToken>, delay: Duration) -> bool {
    match cancel {
        Some(token) => tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            _ = token.cancelled() => true,
        },
        None => {
            tokio::time::sleep(delay).await;
            false
        }
    }
}
