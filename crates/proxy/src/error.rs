//! 代理与管理接口错误定义

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use portico_common::error::ConfigError;
use serde::Serialize;
use shield::ShieldError;
use thiserror::Error;

/// 统一响应信封：`{status, data | message, code}`
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
}

impl ApiResponse<()> {
    pub fn ok() -> Self {
        Self {
            status: "OK",
            data: None,
            message: None,
            code: None,
        }
    }

    pub fn error(message: impl Into<String>, code: &'static str) -> Self {
        Self {
            status: "error",
            data: None,
            message: Some(message.into()),
            code: Some(code),
        }
    }
}

impl<T: Serialize> ApiResponse<T> {
    pub fn with_data(data: T) -> Self {
        Self {
            status: "OK",
            data: Some(data),
            message: None,
            code: None,
        }
    }
}

/// 代理错误类型
#[derive(Error, Debug)]
pub enum ProxyError {
    /// 没有路由匹配该路径
    #[error("No route matches path: {path}")]
    RouteNotFound { path: String },

    /// 上游请求失败
    #[error("Upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),

    /// 写入器被 shield 终止
    #[error("Shield error: {0}")]
    Shield(#[from] ShieldError),

    /// 协议升级失败
    #[error("Upgrade failed: {0}")]
    Upgrade(String),

    /// 转发任务在提交响应头前退出
    #[error("Response head was never committed")]
    HeadNotCommitted,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// 认证失败
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Method not allowed")]
    MethodNotAllowed,

    /// 配置加载 / 校验 / 持久化失败
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// 请求体不是合法的配置 JSON
    #[error("Invalid configuration body: {0}")]
    InvalidBody(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// HTTP 状态码与信封错误码
    pub fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ProxyError::RouteNotFound { .. } => (StatusCode::NOT_FOUND, "ROUTE001"),
            ProxyError::Upstream(_)
            | ProxyError::Upgrade(_)
            | ProxyError::HeadNotCommitted => (StatusCode::BAD_GATEWAY, "UPSTREAM001"),
            ProxyError::Shield(ShieldError::Rejected { .. }) => {
                (StatusCode::SERVICE_UNAVAILABLE, "SHIELD001")
            }
            ProxyError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "AUTH001"),
            ProxyError::MethodNotAllowed => (StatusCode::METHOD_NOT_ALLOWED, "HTTP001"),
            ProxyError::Config(ConfigError::Parse(_) | ConfigError::Invalid { .. })
            | ProxyError::InvalidBody(_) => (StatusCode::BAD_REQUEST, "CFG001"),
            ProxyError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "CFG002"),
            ProxyError::Shield(_) | ProxyError::Io(_) | ProxyError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INT001")
            }
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        let message = if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
            // 不向客户端暴露内部错误详情
            tracing::error!(code, "Request failed: {}", self);
            status
                .canonical_reason()
                .unwrap_or("Internal server error")
                .to_string()
        } else {
            self.to_string()
        };

        (status, Json(ApiResponse::error(message, code))).into_response()
    }
}

pub type ProxyResult<T> = Result<T, ProxyError>;
