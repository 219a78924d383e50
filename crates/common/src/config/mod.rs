//! 统一配置管理系统
//!
//! 本模块是 portico 配置的"单一真理之源"。
//! 所有配置项的定义、文档、默认值都在这里统一管理，
//! 管理接口的读写与热加载也都经过这里的校验。

pub mod bind;
pub mod routes;
pub mod shield;

pub use crate::config::bind::{BindConfig, HttpBindConfig, HttpsBindConfig};
pub use crate::config::routes::RouteConfig;
pub use crate::config::shield::ShieldConfig;
use crate::error::ConfigError;
pub use ::shield::ShieldPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// 配置被读取时用于替换敏感字段的占位符
pub const REDACTED: &str = "********";

/// portico 主配置结构体
///
/// 配置文件使用 TOML 格式；管理接口以 JSON 形式读写同一结构。
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PorticoConfig {
    /// 实例名称
    ///
    /// 用于日志与指标中区分不同实例，如 portico-edge-01。
    pub name: String,

    /// 运行环境标识
    ///
    /// - "dev": 开发环境，允许 HTTP
    /// - "prod": 生产环境，要求 HTTPS 与文件日志
    /// - "test": 测试环境
    pub env: String,

    /// 运行用户（可选）
    ///
    /// 绑定端口后切换到此用户运行。留空则保持当前用户。
    #[serde(default)]
    pub user: Option<String>,

    /// 运行用户组（可选）
    #[serde(default)]
    pub group: Option<String>,

    /// PID 文件路径（可选）
    #[serde(default)]
    pub pid: Option<String>,

    /// 网络绑定配置
    #[serde(default)]
    pub bind: BindConfig,

    /// 管理接口配置
    #[serde(default)]
    pub admin: AdminConfig,

    /// 反向代理路由，按声明顺序匹配，第一条命中的生效
    #[serde(default)]
    pub routes: Vec<RouteConfig>,

    /// SmartShield 准入控制配置
    #[serde(default)]
    pub shield: ShieldConfig,

    /// 可观测性配置（日志）
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// 管理接口配置
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct AdminConfig {
    /// Bearer token；为空时管理接口整体关闭
    #[serde(default)]
    pub token: Option<String>,
}

impl AdminConfig {
    pub fn is_enabled(&self) -> bool {
        self.token.as_deref().is_some_and(|t| !t.trim().is_empty())
    }

    /// 常量时间比较，避免通过响应时间猜测 token
    pub fn verify(&self, presented: &str) -> bool {
        let Some(expected) = self.token.as_deref().filter(|t| !t.trim().is_empty()) else {
            return false;
        };
        let (a, b) = (expected.as_bytes(), presented.as_bytes());
        if a.len() != b.len() {
            return false;
        }
        a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
    }
}

/// 可观测性配置
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ObservabilityConfig {
    /// 过滤级别
    ///
    /// 支持 EnvFilter 语法（如 "info,hyper=warn"）。默认值 "info"。
    #[serde(default = "default_filter_level")]
    pub filter_level: String,

    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct LogConfig {
    /// 日志输出目标
    ///
    /// - "console": 仅输出到控制台（默认）
    /// - "file": 输出到文件
    #[serde(default = "default_log_output")]
    pub output: String,

    /// 当 output = "file" 时按天轮转
    #[serde(default)]
    pub rotate: bool,

    /// 日志文件目录，当 output = "file" 时有效
    #[serde(default = "default_log_path")]
    pub path: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            filter_level: default_filter_level(),
            log: LogConfig::default(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            output: default_log_output(),
            rotate: false,
            path: default_log_path(),
        }
    }
}

fn default_log_output() -> String {
    "console".to_string()
}

fn default_log_path() -> String {
    "logs/".to_string()
}

fn default_filter_level() -> String {
    "info".to_string()
}

impl Default for PorticoConfig {
    fn default() -> Self {
        Self {
            name: "portico-default".to_string(),
            env: "dev".to_string(),
            user: None,
            group: None,
            pid: Some("logs/portico.pid".to_string()),
            bind: BindConfig::default(),
            admin: AdminConfig::default(),
            routes: Vec::new(),
            shield: ShieldConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl PorticoConfig {
    /// 获取 PID 文件路径，如果没有配置则使用默认值
    pub fn get_pid_path(&self) -> Option<String> {
        self.pid
            .clone()
            .or_else(|| Some("logs/portico.pid".to_string()))
    }

    /// 返回日志配置引用
    pub fn log_config(&self) -> &LogConfig {
        &self.observability.log
    }

    pub fn is_console_logging(&self) -> bool {
        self.observability.log.output == "console"
    }

    pub fn should_rotate_logs(&self) -> bool {
        self.observability.log.output == "file" && self.observability.log.rotate
    }

    /// 获取日志过滤级别，优先使用 RUST_LOG
    pub fn get_filter_level(&self) -> String {
        std::env::var("RUST_LOG")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| self.observability.filter_level.clone())
    }

    /// 按分组名查找 shield 策略
    pub fn policy(&self, group: &str) -> Option<&ShieldPolicy> {
        self.shield.policy(group)
    }

    /// 按路径查找第一条命中的路由
    pub fn route_for(&self, path: &str) -> Option<&RouteConfig> {
        self.routes.iter().find(|route| route.matches(path))
    }

    /// 从文件加载配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();

        if !path_ref.exists() {
            return Err(ConfigError::FileNotFound {
                path: path_ref.display().to_string(),
            });
        }
        if !path_ref.is_file() {
            return Err(ConfigError::NotAFile {
                path: path_ref.display().to_string(),
            });
        }

        let content = std::fs::read_to_string(path_ref)?;
        Ok(Self::from_toml(&content)?)
    }

    /// 从 TOML 字符串加载配置
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// 将配置序列化为 TOML 字符串
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string(self)
    }

    /// 将配置写回文件（管理接口更新配置后持久化）
    pub fn write_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = self.to_toml()?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// 加载并校验；只有非 Warning 的错误才会导致失败
    pub fn load_validated<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::from_file(path)?;
        config.ensure_valid()?;
        Ok(config)
    }

    /// 校验并把致命错误转为 `ConfigError::Invalid`
    pub fn ensure_valid(&self) -> Result<(), ConfigError> {
        match self.validate() {
            Ok(()) => Ok(()),
            Err(errors) => match ConfigError::from_validation(errors) {
                Some(err) => Err(err),
                None => Ok(()),
            },
        }
    }

    /// 返回隐去敏感字段的副本，用于管理接口读取
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        if config.admin.token.is_some() {
            config.admin.token = Some(REDACTED.to_string());
        }
        config
    }

    /// 验证配置有效性
    ///
    /// 以 "Warning:" 开头的条目仅为建议，不阻止启动。
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.name.trim().is_empty() {
            errors.push("Instance name cannot be empty".to_string());
        }

        if !["dev", "prod", "test"].contains(&self.env.as_str()) {
            errors.push(format!(
                "Invalid environment '{}', must be one of: dev, prod, test",
                self.env
            ));
        }

        {
            let main_level = self
                .observability
                .filter_level
                .split(',')
                .next()
                .unwrap_or("")
                .trim();
            if !["trace", "debug", "info", "warn", "error"].contains(&main_level) {
                errors.push(format!(
                    "Invalid filter level '{}', must start with one of: trace, debug, info, warn, error",
                    self.observability.filter_level
                ));
            }
        }

        if !["console", "file"].contains(&self.observability.log.output.as_str()) {
            errors.push(format!(
                "Invalid log output '{}' (observability.log.output), must be 'console' or 'file'",
                self.observability.log.output
            ));
        }

        if self.bind.http.is_none() && self.bind.https.is_none() {
            errors.push("At least one of bind.http or bind.https must be configured".to_string());
        }

        // 路由校验
        let mut names = std::collections::HashSet::new();
        for route in &self.routes {
            if route.name.trim().is_empty() {
                errors.push("Route name cannot be empty".to_string());
            } else if !names.insert(route.name.as_str()) {
                errors.push(format!("Duplicate route name '{}'", route.name));
            }
            if !route.prefix.starts_with('/') {
                errors.push(format!(
                    "Route '{}' prefix '{}' must start with '/'",
                    route.name, route.prefix
                ));
            }
            if !["http", "https"].contains(&route.upstream.scheme()) {
                errors.push(format!(
                    "Route '{}' upstream must use http or https, got '{}'",
                    route.name,
                    route.upstream.scheme()
                ));
            }
            if let Some(group) = &route.shield_group
                && self.shield.enabled
                && self.policy(group).is_none()
            {
                errors.push(format!(
                    "Warning: route '{}' references shield group '{}' which has no policy; it will not be protected",
                    route.name, group
                ));
            }
        }

        self.shield.validate_into(&mut errors);

        if self.admin.token.is_some() && !self.admin.is_enabled() {
            errors.push("Warning: admin.token is empty, admin API is disabled".to_string());
        }

        // 生产环境额外检查
        if self.env == "prod" {
            if self.bind.https.is_none() {
                errors.push("Production environment should enable HTTPS".to_string());
            }
            if self.observability.log.output == "console" {
                errors.push("Warning: Production environment should use file logging (observability.log.output = \"file\")".to_string());
            }
            if self
                .admin
                .token
                .as_deref()
                .is_some_and(|token| token.len() < 16)
            {
                errors.push(
                    "Warning: admin.token is too short, recommend at least 16 characters"
                        .to_string(),
                );
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
