//! 管理接口
//!
//! 所有端点都经过 admin bearer token 校验：
//! - `GET  /config`  读取当前配置（token 已隐去）
//! - `PUT  /config`  校验、持久化并热更新配置
//! - `GET  /restart` 从配置文件重新加载
//! - `GET  /shield`  SmartShield 跟踪状态快照

use crate::client::bearer_token;
use crate::error::{ApiResponse, ProxyError, ProxyResult};
use crate::state::ProxyState;
use axum::{
    Json, Router,
    body::Bytes,
    extract::{Request, State},
    middleware::{self, Next},
    response::Response,
    routing::get,
};
use portico_common::PorticoConfig;
use portico_common::config::REDACTED;
use portico_common::metrics::AUTH_FAILURES;
use serde::Serialize;
use shield::GroupSnapshot;
use tracing::{info, warn};

/// 构建管理接口路由（由调用方挂载到 `/api`）
pub fn admin_router(state: ProxyState) -> Router {
    Router::new()
        .route("/config", get(get_config).put(put_config))
        .route("/restart", get(restart))
        .route("/shield", get(shield_status))
        .method_not_allowed_fallback(method_not_allowed)
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin))
        .with_state(state)
}

async fn require_admin(
    State(state): State<ProxyState>,
    request: Request,
    next: Next,
) -> ProxyResult<Response> {
    let config = state.config().await;
    let rejection = match bearer_token(request.headers()) {
        Some(token) if config.admin.verify(token) => None,
        Some(_) => Some("invalid_token"),
        None => Some("missing_token"),
    };
    let Some(reason) = rejection else {
        return Ok(next.run(request).await);
    };

    AUTH_FAILURES.with_label_values(&[reason]).inc();
    warn!(reason, uri = %request.uri(), "Admin authentication failed");
    Err(ProxyError::Unauthorized(
        "a valid admin bearer token is required".to_string(),
    ))
}

async fn get_config(State(state): State<ProxyState>) -> Json<ApiResponse<PorticoConfig>> {
    Json(ApiResponse::with_data(state.config().await.redacted()))
}

async fn put_config(
    State(state): State<ProxyState>,
    body: Bytes,
) -> ProxyResult<Json<ApiResponse<()>>> {
    let mut incoming: PorticoConfig = serde_json::from_slice(&body)?;

    // 读取时被隐去的 token 原样写回时保留原值
    if incoming.admin.token.as_deref() == Some(REDACTED) {
        incoming.admin.token = state.config().await.admin.token.clone();
    }

    state.replace(incoming).await?;
    info!("Configuration updated through admin API");
    Ok(Json(ApiResponse::ok()))
}

async fn restart(State(state): State<ProxyState>) -> ProxyResult<Json<ApiResponse<()>>> {
    state.reload_from_disk().await?;
    info!("Configuration reloaded from disk");
    Ok(Json(ApiResponse::ok()))
}

/// SmartShield 状态快照
#[derive(Debug, Serialize)]
pub struct ShieldStatus {
    pub enabled: bool,
    pub retention_secs: u64,
    pub tracked_clients: usize,
    pub groups: Vec<GroupSnapshot>,
}

async fn shield_status(State(state): State<ProxyState>) -> Json<ApiResponse<ShieldStatus>> {
    let config = state.config().await;
    let registry = state.registry();
    Json(ApiResponse::with_data(ShieldStatus {
        enabled: config.shield.enabled,
        retention_secs: registry.retention().as_secs(),
        tracked_clients: registry.tracked_clients(),
        groups: registry.snapshot(),
    }))
}

async fn method_not_allowed() -> ProxyError {
    ProxyError::MethodNotAllowed
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header::AUTHORIZATION};
    use serde_json::{Value, json};
    use shield::ShieldPolicy;
    use tower::ServiceExt;

    const TOKEN: &str = "0123456789abcdef";

    fn test_config() -> PorticoConfig {
        let mut config = PorticoConfig::default();
        config.admin.token = Some(TOKEN.to_string());
        config
            .shield
            .policies
            .push(ShieldPolicy::new("apps", 50.0, 100.0));
        config
    }

    fn setup() -> (Router, ProxyState, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("portico.toml");
        test_config().write_to_file(&path).unwrap();
        let state = ProxyState::new(test_config(), Some(path)).unwrap();
        (admin_router(state.clone()), state, dir)
    }

    fn request(method: &str, uri: &str, token: Option<&str>, body: Body) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        builder.body(body).unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_requires_admin_token() {
        let (app, _, _dir) = setup();

        let response = app
            .clone()
            .oneshot(request("GET", "/config", None, Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(response).await["code"], "AUTH001");

        let response = app
            .oneshot(request("GET", "/config", Some("wrong"), Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_get_config_redacts_token() {
        let (app, _, _dir) = setup();
        let response = app
            .oneshot(request("GET", "/config", Some(TOKEN), Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = json_body(response).await;
        assert_eq!(body["status"], "OK");
        assert_eq!(body["data"]["admin"]["token"], REDACTED);
        assert_eq!(body["data"]["shield"]["policies"][0]["group"], "apps");
    }

    #[tokio::test]
    async fn test_put_config_round_trip_keeps_token() {
        let (app, state, _dir) = setup();

        let mut config = serde_json::to_value(state.config().await.redacted()).unwrap();
        config["shield"]["policies"][0]["soft_threshold"] = json!(25.0);

        let response = app
            .clone()
            .oneshot(request(
                "PUT",
                "/config",
                Some(TOKEN),
                Body::from(config.to_string()),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, json!({"status": "OK"}));

        let current = state.config().await;
        assert_eq!(current.policy("apps").unwrap().soft_threshold, 25.0);
        assert_eq!(current.admin.token.as_deref(), Some(TOKEN));

        let on_disk = PorticoConfig::from_file(state.config_path().unwrap()).unwrap();
        assert_eq!(on_disk.admin.token.as_deref(), Some(TOKEN));

        // 原 token 仍然有效
        let response = app
            .oneshot(request("GET", "/shield", Some(TOKEN), Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_put_invalid_config() {
        let (app, state, _dir) = setup();

        let response = app
            .clone()
            .oneshot(request("PUT", "/config", Some(TOKEN), Body::from("{not json")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["code"], "CFG001");

        let mut config = serde_json::to_value(state.config().await.redacted()).unwrap();
        config["shield"]["policies"][0]["soft_threshold"] = json!(500.0);
        let response = app
            .oneshot(request(
                "PUT",
                "/config",
                Some(TOKEN),
                Body::from(config.to_string()),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["status"], "error");
        assert_eq!(body["code"], "CFG001");

        assert_eq!(state.config().await.policy("apps").unwrap().soft_threshold, 50.0);
    }

    #[tokio::test]
    async fn test_restart_reloads_from_disk() {
        let (app, state, _dir) = setup();

        let mut edited = test_config();
        edited.shield.policies[0].hard_threshold = 400.0;
        edited.write_to_file(state.config_path().unwrap()).unwrap();

        let response = app
            .oneshot(request("GET", "/restart", Some(TOKEN), Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(state.config().await.policy("apps").unwrap().hard_threshold, 400.0);
    }

    #[tokio::test]
    async fn test_shield_snapshot() {
        let (app, state, _dir) = setup();
        state.registry().record_cost("apps", "10.0.0.1", 3.0);
        state.registry().record_cost("apps", "10.0.0.2", 3.0);

        let response = app
            .oneshot(request("GET", "/shield", Some(TOKEN), Body::empty()))
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body["data"]["tracked_clients"], 2);
        assert_eq!(body["data"]["retention_secs"], 3600);
        assert_eq!(body["data"]["groups"][0]["group"], "apps");
        assert_eq!(body["data"]["groups"][0]["clients"], 2);
    }

    #[tokio::test]
    async fn test_method_not_allowed() {
        let (app, _, _dir) = setup();
        let response = app
            .oneshot(request("POST", "/restart", Some(TOKEN), Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(json_body(response).await["code"], "HTTP001");
    }
}
