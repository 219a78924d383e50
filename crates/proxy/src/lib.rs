//! # portico-proxy
//!
//! 反向代理层：把路由表中的请求转发到上游，并让每个响应都经过
//! SmartShield 的 `GuardedResponseWriter`。同时提供管理接口、
//! `/health` 与 `/metrics` 端点。

pub mod admin;
pub mod client;
pub mod error;
pub mod forward;
pub mod sink;
pub mod state;

pub use error::{ApiResponse, ProxyError, ProxyResult};
pub use sink::{ChannelSink, SinkReceiver};
pub use state::ProxyState;

use axum::{
    Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get,
};
use tracing::info;

/// 构建完整路由：管理接口、健康检查、指标与代理 fallback
///
/// 管理接口只在启动时配置了 admin token 时挂载到 `/api`，
/// 否则 `/api` 也作为普通路径被代理。
pub async fn router(state: ProxyState) -> Router {
    let config = state.config().await;
    let mut app = Router::new();

    if config.admin.is_enabled() {
        info!("Admin API enabled at /api");
        app = app.nest_service("/api", admin::admin_router(state.clone()));
    }

    app.route("/health", get(health))
        .route("/metrics", get(metrics))
        .fallback(forward::proxy_handler)
        .with_state(state)
}

async fn health() -> Json<ApiResponse<()>> {
    Json(ApiResponse::ok())
}

async fn metrics(State(state): State<ProxyState>) -> impl IntoResponse {
    portico_common::metrics::SHIELD_TRACKED_CLIENTS
        .set(state.registry().tracked_clients() as i64);
    match portico_common::metrics::export_metrics() {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(e) => ProxyError::internal(format!("failed to export metrics: {e}")).into_response(),
    }
}
