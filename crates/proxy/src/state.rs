//! 代理共享状态
//!
//! 持有当前生效的配置（可热更新）、SmartShield 注册表与上游 HTTP 客户端。
//! 配置以 `Arc` 快照的形式被请求读取，热更新时整体替换，
//! 注册表中的用量记录在替换前后保持不变。

use crate::error::{ProxyError, ProxyResult};
use portico_common::PorticoConfig;
use portico_common::metrics::CONFIG_RELOADS;
use shield::ShieldRegistry;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};

const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct ProxyState {
    inner: Arc<Inner>,
}

struct Inner {
    config: RwLock<Arc<PorticoConfig>>,
    config_path: Option<PathBuf>,
    registry: Arc<ShieldRegistry>,
    client: reqwest::Client,
}

impl std::fmt::Debug for ProxyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyState")
            .field("config_path", &self.inner.config_path)
            .field("tracked_clients", &self.inner.registry.tracked_clients())
            .finish()
    }
}

impl ProxyState {
    /// 创建共享状态；`config_path` 用于管理接口持久化与重新加载
    pub fn new(config: PorticoConfig, config_path: Option<PathBuf>) -> ProxyResult<Self> {
        config.ensure_valid()?;

        let registry = Arc::new(ShieldRegistry::new(config.shield.retention()));
        registry.apply_policies(&config.shield.policies);

        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(UPSTREAM_CONNECT_TIMEOUT)
            .no_proxy()
            .build()?;

        Ok(Self {
            inner: Arc::new(Inner {
                config: RwLock::new(Arc::new(config)),
                config_path,
                registry,
                client,
            }),
        })
    }

    /// 当前生效配置的快照
    pub async fn config(&self) -> Arc<PorticoConfig> {
        self.inner.config.read().await.clone()
    }

    pub fn registry(&self) -> &Arc<ShieldRegistry> {
        &self.inner.registry
    }

    pub fn http_client(&self) -> &reqwest::Client {
        &self.inner.client
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.inner.config_path.as_deref()
    }

    /// 校验并热更新配置：路由与 shield 策略立即生效
    ///
    /// 绑定地址、运行用户、PID、保留期与清理周期只在进程启动时读取；
    /// shield 开关立即生效，清理任务始终在运行。
    pub async fn apply(&self, config: PorticoConfig) -> ProxyResult<()> {
        config.ensure_valid()?;

        let mut current = self.inner.config.write().await;
        if current.bind != config.bind || current.user != config.user || current.pid != config.pid
        {
            warn!("bind/user/pid changes take effect after a process restart");
        }
        if current.shield.retention_secs != config.shield.retention_secs {
            warn!(
                retention_secs = config.shield.retention_secs,
                "shield retention change takes effect after a process restart"
            );
        }
        if current.shield.sweep_interval_secs != config.shield.sweep_interval_secs {
            warn!(
                sweep_interval_secs = config.shield.sweep_interval_secs,
                "shield sweep interval change takes effect after a process restart"
            );
        }
        if current.shield.enabled != config.shield.enabled {
            info!(enabled = config.shield.enabled, "SmartShield toggled");
        }

        self.inner.registry.apply_policies(&config.shield.policies);
        info!(
            routes = config.routes.len(),
            policies = config.shield.policies.len(),
            "Configuration applied"
        );
        *current = Arc::new(config);
        Ok(())
    }

    /// 校验、写回配置文件并热更新
    pub async fn replace(&self, config: PorticoConfig) -> ProxyResult<()> {
        config.ensure_valid()?;
        if let Some(path) = self.config_path() {
            config.write_to_file(path)?;
            info!("Configuration persisted to {}", path.display());
        }
        let result = self.apply(config).await;
        record_reload("api", &result);
        result
    }

    /// 从配置文件重新加载
    pub async fn reload_from_disk(&self) -> ProxyResult<()> {
        let result = match self.config_path() {
            Some(path) => match PorticoConfig::load_validated(path) {
                Ok(config) => self.apply(config).await,
                Err(e) => Err(e.into()),
            },
            None => Err(ProxyError::internal(
                "process was started without a configuration file",
            )),
        };
        record_reload("disk", &result);
        result
    }
}

fn record_reload(source: &str, result: &ProxyResult<()>) {
    let status = if result.is_ok() { "success" } else { "failure" };
    CONFIG_RELOADS.with_label_values(&[source, status]).inc();
}
