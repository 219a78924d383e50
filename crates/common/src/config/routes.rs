//! 反向代理路由配置

use serde::{Deserialize, Serialize};
use url::Url;

/// 单条反向代理路由：路径前缀 -> 上游
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RouteConfig {
    /// 路由名称，用于日志与指标标签
    pub name: String,

    /// 匹配的路径前缀，如 "/cloud"
    pub prefix: String,

    /// 上游地址，如 "http://127.0.0.1:8080"
    pub upstream: Url,

    /// 受保护的 shield 分组；为空表示不受保护
    #[serde(default)]
    pub shield_group: Option<String>,

    /// 转发前是否去掉匹配到的前缀
    #[serde(default = "default_true")]
    pub strip_prefix: bool,
}

fn default_true() -> bool {
    true
}

impl RouteConfig {
    /// 路径是否命中该路由（按路径段匹配，"/app" 不匹配 "/application"）
    pub fn matches(&self, path: &str) -> bool {
        let prefix = self.prefix.trim_end_matches('/');
        if prefix.is_empty() {
            return true;
        }
        match path.strip_prefix(prefix) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }

    /// 计算转发到上游的路径
    pub fn upstream_path<'a>(&self, path: &'a str) -> &'a str {
        if !self.strip_prefix {
            return path;
        }
        let prefix = self.prefix.trim_end_matches('/');
        match path.strip_prefix(prefix) {
            Some("") => "/",
            Some(rest) => rest,
            None => path,
        }
    }
}
