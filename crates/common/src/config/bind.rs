//! 网络绑定配置

use serde::{Deserialize, Serialize};

/// 网络绑定配置
///
/// 开发环境优先使用 HTTP，生产环境必须配置 HTTPS。
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct BindConfig {
    /// HTTP 服务绑定配置（可选）
    pub http: Option<HttpBindConfig>,

    /// HTTPS 服务绑定配置（可选）
    pub https: Option<HttpsBindConfig>,
}

impl Default for BindConfig {
    fn default() -> Self {
        Self {
            http: Some(HttpBindConfig::default()),
            https: None,
        }
    }
}

/// HTTP 服务绑定配置
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct HttpBindConfig {
    /// 域名
    ///
    /// 用于生成对外展示的 URL。
    pub domain_name: String,

    /// 绑定 IP 地址
    ///
    /// 通常使用 "0.0.0.0" 监听所有接口。
    pub ip: String,

    /// 绑定端口
    pub port: u16,
}

impl Default for HttpBindConfig {
    fn default() -> Self {
        Self {
            domain_name: "localhost".to_string(),
            ip: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// HTTPS 服务绑定配置
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct HttpsBindConfig {
    /// 域名，必须与证书中的域名匹配
    pub domain_name: String,

    pub ip: String,

    pub port: u16,

    /// PEM 格式证书路径
    pub cert: String,

    /// PEM 格式私钥路径
    pub key: String,
}

impl Default for HttpsBindConfig {
    fn default() -> Self {
        Self {
            domain_name: "localhost".to_string(),
            ip: "0.0.0.0".to_string(),
            port: 8443,
            cert: "certificates/server.crt".to_string(),
            key: "certificates/server.key".to_string(),
        }
    }
}

impl HttpBindConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

impl HttpsBindConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}
