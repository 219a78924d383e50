//! 请求转发
//!
//! 每个请求：匹配路由 -> 识别调用方 -> 构建 `GuardedResponseWriter<ChannelSink>`
//! -> 准入预检（被拒绝的调用方不会触达上游）-> 转发到上游 -> 经写入器回写。
//! 转发在独立任务中进行，handler 只等待响应头提交。

use crate::client::{ClientIdentity, X_FORWARDED_FOR, resolve_client};
use crate::error::{ApiResponse, ProxyError};
use crate::sink::{BODY_BUFFER, ChannelSink};
use crate::state::ProxyState;
use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use http::header::{
    CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HOST, HeaderName, HeaderValue, TRANSFER_ENCODING,
    UPGRADE,
};
use http::request::Parts;
use http::{HeaderMap, StatusCode};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use portico_common::config::RouteConfig;
use portico_common::metrics::{self, RequestTimer, UPSTREAM_ERRORS};
use shield::{GuardedResponseWriter, ShieldBinding, WriterState};
use std::net::SocketAddr;
use tracing::{debug, info, warn};
use url::Url;

type Writer = GuardedResponseWriter<ChannelSink>;

/// 逐跳头，不转发
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub const X_FORWARDED_HOST: &str = "x-forwarded-host";

/// 反向代理入口（作为 axum fallback 挂载）
pub async fn proxy_handler(
    State(state): State<ProxyState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    match proxy(state, peer, request).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn proxy(state: ProxyState, peer: SocketAddr, request: Request) -> Result<Response, ProxyError> {
    let config = state.config().await;
    let path = request.uri().path().to_string();
    let route = config
        .route_for(&path)
        .cloned()
        .ok_or(ProxyError::RouteNotFound { path: path.clone() })?;

    let identity = resolve_client(peer, request.headers(), &config);
    let policy = match (&route.shield_group, config.shield.enabled) {
        (Some(group), true) => config.policy(group).cloned(),
        _ => None,
    };
    let group = route
        .shield_group
        .clone()
        .unwrap_or_else(|| route.name.clone());

    let upstream_url = upstream_url(&route, &path, request.uri().query());
    let (mut parts, body) = request.into_parts();
    let upgrade = is_upgrade_request(&parts.headers);

    let (sink, receiver) = ChannelSink::channel(BODY_BUFFER);
    let on_upgrade = if upgrade {
        parts.extensions.remove::<OnUpgrade>()
    } else {
        None
    };
    let sink = sink.with_upgrade(on_upgrade);
    let disconnected = sink.disconnected();

    let writer = GuardedResponseWriter::new(
        sink,
        state.registry().clone(),
        ShieldBinding {
            group,
            client: identity.client.clone(),
            policy,
            method: parts.method.clone(),
            privileged: identity.privileged,
        },
    )
    .with_cancellation(disconnected);

    debug!(
        route = %route.name,
        client = %identity.client,
        upstream = %upstream_url,
        upgrade,
        "Forwarding request"
    );

    tokio::spawn(forward(
        state,
        writer,
        Outbound {
            route,
            identity,
            url: upstream_url,
            parts,
            body,
            upgrade,
        },
    ));

    receiver
        .into_response()
        .await
        .ok_or(ProxyError::HeadNotCommitted)
}

/// 发往上游的请求
struct Outbound {
    route: RouteConfig,
    identity: ClientIdentity,
    url: Url,
    parts: Parts,
    body: Body,
    upgrade: bool,
}

async fn forward(state: ProxyState, mut writer: Writer, outbound: Outbound) {
    let timer = RequestTimer::new(&outbound.route.name, outbound.parts.method.as_str());
    let route_name = outbound.route.name.clone();

    // 准入预检：拒绝时 503 已由写入器发出
    if writer.admit().await.is_ok() {
        if let Err(e) = relay(&state, &mut writer, outbound).await {
            match e {
                ProxyError::Shield(_) => {}
                e => {
                    warn!(route = %route_name, error = %e, "Upstream exchange failed");
                    write_error(&mut writer, &e).await;
                }
            }
        }
    }

    // 只有受保护的分组才记录决策指标
    let group = writer
        .binding()
        .policy
        .as_ref()
        .map(|policy| policy.group.clone());
    let outcome = writer.finish().await;
    if let Some(group) = group {
        metrics::record_shield_decision(&group, &outcome.decision.to_string());
    }
    let status = outcome
        .accounting
        .status
        .map(|s| s.as_u16())
        .unwrap_or(StatusCode::OK.as_u16());
    let status = if outcome.state == WriterState::Rejected {
        StatusCode::SERVICE_UNAVAILABLE.as_u16()
    } else {
        status
    };
    timer.observe(status);

    info!(
        route = %route_name,
        status,
        state = %outcome.state,
        decision = %outcome.decision,
        cost = outcome.accounting.cost,
        bytes = outcome.accounting.bytes_written,
        duration_ms =
            u64::try_from(outcome.accounting.duration().as_millis()).unwrap_or(u64::MAX),
        hijacked = outcome.hijacked,
        "Request completed"
    );
}

async fn relay(state: &ProxyState, writer: &mut Writer, outbound: Outbound) -> Result<(), ProxyError> {
    let Outbound {
        route,
        identity,
        url,
        parts,
        body,
        upgrade,
    } = outbound;

    let mut headers = HeaderMap::with_capacity(parts.headers.len() + 2);
    copy_headers(&parts.headers, &mut headers, upgrade);
    headers.remove(HOST);
    append_forwarded_headers(&mut headers, &parts.headers, &identity);

    let has_body = parts.headers.contains_key(TRANSFER_ENCODING)
        || parts
            .headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .is_some_and(|len| len > 0);

    let mut request = state
        .http_client()
        .request(parts.method.clone(), url)
        .headers(headers);
    if has_body {
        request = request.body(reqwest::Body::wrap_stream(body.into_data_stream()));
    }

    let response = match request.send().await {
        Ok(response) => response,
        Err(e) => {
            let kind = if e.is_timeout() {
                "timeout"
            } else if e.is_connect() {
                "connect"
            } else {
                "request"
            };
            UPSTREAM_ERRORS.with_label_values(&[&route.name, kind]).inc();
            return Err(e.into());
        }
    };

    let status = response.status();
    let switching = upgrade && status == StatusCode::SWITCHING_PROTOCOLS;
    copy_headers(response.headers(), writer.headers_mut(), switching);

    if switching {
        return bridge_upgrade(writer, response, &route.name).await;
    }

    writer.write_header(status);
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                UPSTREAM_ERRORS
                    .with_label_values(&[&route.name, "body"])
                    .inc();
                // 响应头可能已经发出，只能截断
                warn!(route = %route.name, error = %e, "Upstream body interrupted");
                return Ok(());
            }
        };
        writer.write(&chunk).await?;
    }
    Ok(())
}

/// 接管下游连接并与上游升级后的连接双向转发
async fn bridge_upgrade(
    writer: &mut Writer,
    response: reqwest::Response,
    route: &str,
) -> Result<(), ProxyError> {
    // 101 一旦提交就无法再改写为错误响应
    if !writer.can_hijack() {
        return Err(ProxyError::Upgrade(
            "downstream connection cannot be upgraded".to_string(),
        ));
    }
    let upstream = response
        .upgrade()
        .await
        .map_err(|e| ProxyError::Upgrade(e.to_string()))?;

    writer.write_header(StatusCode::SWITCHING_PROTOCOLS);
    let downstream = writer.hijack()?;

    let route = route.to_string();
    tokio::spawn(async move {
        let downstream = match downstream.await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                warn!(route = %route, error = %e, "Downstream upgrade failed");
                return;
            }
        };
        let mut downstream = TokioIo::new(downstream);
        let mut upstream = upstream;
        match tokio::io::copy_bidirectional(&mut downstream, &mut upstream).await {
            Ok((to_upstream, to_client)) => {
                debug!(route = %route, to_upstream, to_client, "Upgraded connection closed")
            }
            Err(e) => debug!(route = %route, error = %e, "Upgraded connection aborted"),
        }
    });
    Ok(())
}

/// 上游失败时回写 JSON 错误；响应头已发出时只能放弃
async fn write_error(writer: &mut Writer, error: &ProxyError) {
    let (status, code) = error.status_and_code();
    let message = status.canonical_reason().unwrap_or("Bad Gateway");
    let body = match serde_json::to_vec(&ApiResponse::error(message, code)) {
        Ok(body) => body,
        Err(_) => return,
    };
    let headers = writer.headers_mut();
    headers.clear();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    writer.write_header(status);
    let _ = writer.write(&body).await;
}

/// 拼接上游地址：上游 base path + 去掉前缀后的路径 + 原始 query
pub fn upstream_url(route: &RouteConfig, path: &str, query: Option<&str>) -> Url {
    let mut url = route.upstream.clone();
    let base = url.path().trim_end_matches('/').to_string();
    let rest = route.upstream_path(path);
    let joined = if rest.starts_with('/') {
        format!("{base}{rest}")
    } else {
        format!("{base}/{rest}")
    };
    url.set_path(&joined);
    url.set_query(query);
    url
}

/// 复制除逐跳头以外的所有头；`keep_upgrade` 时保留 Connection / Upgrade
pub fn copy_headers(src: &HeaderMap, dst: &mut HeaderMap, keep_upgrade: bool) {
    // Connection 中列出的头同样是逐跳的
    let listed: Vec<String> = src
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|v| v.trim().to_ascii_lowercase())
        .filter(|v| !v.is_empty())
        .collect();

    for (name, value) in src {
        let lower = name.as_str();
        let upgrade_header = *name == CONNECTION || *name == UPGRADE;
        if upgrade_header && keep_upgrade {
            dst.append(name.clone(), value.clone());
            continue;
        }
        if HOP_BY_HOP.contains(&lower) || listed.iter().any(|h| h == lower) {
            continue;
        }
        dst.append(name.clone(), value.clone());
    }
}

fn append_forwarded_headers(dst: &mut HeaderMap, original: &HeaderMap, identity: &ClientIdentity) {
    let forwarded_for = match original
        .get(X_FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
    {
        Some(existing) => format!("{existing}, {}", identity.ip),
        None => identity.ip.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        dst.insert(HeaderName::from_static(X_FORWARDED_FOR), value);
    }
    if let Some(host) = original.get(HOST) {
        dst.insert(HeaderName::from_static(X_FORWARDED_HOST), host.clone());
    }
}

fn is_upgrade_request(headers: &HeaderMap) -> bool {
    headers.contains_key(UPGRADE)
        && headers
            .get_all(CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|v| v.trim().eq_ignore_ascii_case("upgrade"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(prefix: &str, upstream: &str, strip: bool) -> RouteConfig {
        RouteConfig {
            name: "app".to_string(),
            prefix: prefix.to_string(),
            upstream: Url::parse(upstream).unwrap(),
            shield_group: None,
            strip_prefix: strip,
        }
    }

    #[test]
    fn test_upstream_url_joins_paths() {
        let r = route("/app", "http://127.0.0.1:9000", true);
        assert_eq!(
            upstream_url(&r, "/app/items", Some("page=2")).as_str(),
            "http://127.0.0.1:9000/items?page=2"
        );
        assert_eq!(upstream_url(&r, "/app", None).as_str(), "http://127.0.0.1:9000/");

        let r = route("/app", "http://127.0.0.1:9000/base/", true);
        assert_eq!(
            upstream_url(&r, "/app/items", None).as_str(),
            "http://127.0.0.1:9000/base/items"
        );

        let r = route("/app", "http://127.0.0.1:9000", false);
        assert_eq!(
            upstream_url(&r, "/app/items", None).as_str(),
            "http://127.0.0.1:9000/app/items"
        );
    }

    #[test]
    fn test_hop_by_hop_headers_are_dropped() {
        let mut src = HeaderMap::new();
        src.insert(CONNECTION, HeaderValue::from_static("keep-alive, x-private"));
        src.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        src.insert("x-private", HeaderValue::from_static("1"));
        src.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        src.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        src.append("set-cookie", HeaderValue::from_static("a=1"));
        src.append("set-cookie", HeaderValue::from_static("b=2"));

        let mut dst = HeaderMap::new();
        copy_headers(&src, &mut dst, false);
        assert!(dst.get(CONNECTION).is_none());
        assert!(dst.get("keep-alive").is_none());
        assert!(dst.get("x-private").is_none());
        assert!(dst.get(TRANSFER_ENCODING).is_none());
        assert_eq!(dst[CONTENT_TYPE], "text/plain");
        assert_eq!(dst.get_all("set-cookie").iter().count(), 2);
    }

    #[test]
    fn test_upgrade_headers_kept_for_upgrades() {
        let mut src = HeaderMap::new();
        src.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
        src.insert(UPGRADE, HeaderValue::from_static("websocket"));
        assert!(is_upgrade_request(&src));

        let mut dst = HeaderMap::new();
        copy_headers(&src, &mut dst, true);
        assert_eq!(dst[UPGRADE], "websocket");
        assert_eq!(dst[CONNECTION], "Upgrade");

        let mut plain = HeaderMap::new();
        plain.insert(UPGRADE, HeaderValue::from_static("websocket"));
        assert!(!is_upgrade_request(&plain));
    }

    #[test]
    fn test_forwarded_headers() {
        let identity = ClientIdentity {
            client: "10.0.0.2".to_string(),
            ip: "10.0.0.2".parse().unwrap(),
            privileged: false,
        };
        let mut original = HeaderMap::new();
        original.insert(HOST, HeaderValue::from_static("portico.local"));
        original.insert(X_FORWARDED_FOR, HeaderValue::from_static("203.0.113.1"));

        let mut dst = HeaderMap::new();
        append_forwarded_headers(&mut dst, &original, &identity);
        assert_eq!(dst[X_FORWARDED_FOR], "203.0.113.1, 10.0.0.2");
        assert_eq!(dst[X_FORWARDED_HOST], "portico.local");
    }

    #[tokio::test]
    async fn test_unupgradable_downstream_gets_502_not_101() {
        let (sink, receiver) = ChannelSink::channel(BODY_BUFFER);
        let mut writer = GuardedResponseWriter::new(
            sink,
            std::sync::Arc::new(shield::ShieldRegistry::default()),
            ShieldBinding {
                group: "app".to_string(),
                client: "10.0.0.2".to_string(),
                policy: None,
                method: http::Method::GET,
                privileged: false,
            },
        );
        let upstream = reqwest::Response::from(
            http::Response::builder()
                .status(StatusCode::SWITCHING_PROTOCOLS)
                .body("")
                .unwrap(),
        );

        let err = bridge_upgrade(&mut writer, upstream, "app").await.unwrap_err();
        assert!(matches!(err, ProxyError::Upgrade(_)));
        assert!(writer.accounting().status.is_none());

        write_error(&mut writer, &err).await;
        let outcome = writer.finish().await;
        assert_eq!(outcome.accounting.status, Some(StatusCode::BAD_GATEWAY));

        let response = receiver.into_response().await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert!(String::from_utf8_lossy(&body).contains("UPSTREAM001"));
    }
}
