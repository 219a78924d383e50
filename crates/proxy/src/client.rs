//! 客户端识别与特权判定

use http::HeaderMap;
use http::header::AUTHORIZATION;
use portico_common::PorticoConfig;
use std::net::{IpAddr, SocketAddr};

pub const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// 单个请求的调用方身份
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    /// 用量记账的 key
    pub client: String,
    pub ip: IpAddr,
    /// 管理员 token 或白名单来源
    pub privileged: bool,
}

/// 解析调用方身份
///
/// 默认使用对端地址；开启 `trust_forwarded_for` 后取 X-Forwarded-For 的第一跳，
/// 解析失败时回退到对端地址。
pub fn resolve_client(peer: SocketAddr, headers: &HeaderMap, config: &PorticoConfig) -> ClientIdentity {
    let forwarded = if config.shield.trust_forwarded_for {
        forwarded_for(headers)
    } else {
        None
    };
    let ip = forwarded.unwrap_or_else(|| peer.ip()).to_canonical();

    let admin = bearer_token(headers).is_some_and(|token| config.admin.verify(token));
    let privileged = admin || config.shield.is_allow_listed(&ip);

    ClientIdentity {
        client: ip.to_string(),
        ip,
        privileged,
    }
}

/// X-Forwarded-For 中最左侧（最初的客户端）地址
pub fn forwarded_for(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get(X_FORWARDED_FOR)?
        .to_str()
        .ok()?
        .split(',')
        .next()?
        .trim()
        .parse()
        .ok()
}

/// 提取 `Authorization: Bearer <token>`
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}
