//! 服务管理器
//!
//! 负责代理服务的启动与关停：
//! - 按环境选择 HTTP / HTTPS 监听（dev 优先 HTTP，prod 必须 HTTPS）
//! - 在代理路由外层挂上追踪与 CORS 中间件
//! - 启动 SmartShield 清理任务（与 shield 开关无关），关停时一并取消

use crate::service::trace::http_trace_layer;
use anyhow::Result;
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use portico_common::config::PorticoConfig;
use portico_proxy::ProxyState;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

/// 监听方式
enum Listener {
    Http(SocketAddr),
    Https(SocketAddr, RustlsConfig),
}

/// 服务管理器，负责代理服务的生命周期
#[derive(Debug)]
pub struct ServiceManager {
    state: ProxyState,
    shutdown_tx: broadcast::Sender<()>,
    sweeper_shutdown: CancellationToken,
}

impl ServiceManager {
    /// 创建服务管理器；`config_path` 供管理接口持久化与重新加载
    pub fn new(
        config: PorticoConfig,
        config_path: Option<PathBuf>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Result<Self> {
        let state = ProxyState::new(config, config_path)?;
        Ok(Self {
            state,
            shutdown_tx,
            sweeper_shutdown: CancellationToken::new(),
        })
    }

    pub fn state(&self) -> &ProxyState {
        &self.state
    }

    /// 启动清理任务与 HTTP(S) 服务器
    ///
    /// 返回时监听端口已经绑定，可以安全地降权。
    pub async fn start_all(&mut self) -> Result<Vec<JoinHandle<()>>> {
        let config = self.state.config().await;
        let mut handles = Vec::new();

        // 清理任务始终运行：shield 可以在运行期间通过热更新打开
        if !config.shield.enabled {
            info!("SmartShield disabled, requests are not accounted until it is enabled");
        }
        // 广播关停时一并取消清理任务
        let sweeper_shutdown = self.sweeper_shutdown.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let _ = shutdown_rx.recv().await;
            sweeper_shutdown.cancel();
        });
        handles.push(self.state.registry().spawn_sweeper(
            config.shield.sweep_interval(),
            self.sweeper_shutdown.clone(),
        ));

        let listener = Self::select_listener(&config).await?;
        handles.push(self.start_http_server(listener).await?);
        Ok(handles)
    }

    /// 确定绑定配置
    async fn select_listener(config: &PorticoConfig) -> Result<Listener> {
        let is_dev = config.env.to_lowercase() == "dev";

        if is_dev && let Some(http_config) = &config.bind.http {
            return Ok(Listener::Http(parse_addr(&http_config.bind_addr())?));
        }

        match &config.bind.https {
            Some(https_config) => {
                // 初始化加密提供程序
                let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
                let tls_config =
                    RustlsConfig::from_pem_file(&https_config.cert, &https_config.key).await?;
                Ok(Listener::Https(
                    parse_addr(&https_config.bind_addr())?,
                    tls_config,
                ))
            }
            None if is_dev => Err(anyhow::anyhow!(
                "No HTTP or HTTPS binding configuration found"
            )),
            None => Err(anyhow::anyhow!(
                "HTTPS binding configuration is required for production environment"
            )),
        }
    }

    async fn start_http_server(&self, listener: Listener) -> Result<JoinHandle<()>> {
        let app: Router = portico_proxy::router(self.state.clone())
            .await
            .layer(http_trace_layer())
            .layer(CorsLayer::permissive());
        let make_service = app.into_make_service_with_connect_info::<SocketAddr>();
        let shutdown_tx = self.shutdown_tx.clone();

        let handle = match listener {
            Listener::Https(addr, tls_config) => {
                // 先同步绑定，端口冲突时直接返回错误
                let std_listener = std::net::TcpListener::bind(addr)
                    .map_err(|e| anyhow::anyhow!("Failed to bind to address '{addr}': {e}"))?;
                std_listener.set_nonblocking(true)?;
                info!("HTTPS server listening on {}", addr);

                let server =
                    axum_server::from_tcp_rustls(std_listener, tls_config).serve(make_service);
                tokio::spawn(async move {
                    let mut shutdown_rx = shutdown_tx.subscribe();
                    tokio::select! {
                        result = server => {
                            if let Err(e) = result {
                                error!("HTTPS server error: {}", e);
                                let _ = shutdown_tx.send(());
                            }
                        }
                        _ = shutdown_rx.recv() => {
                            info!("HTTPS server received shutdown signal");
                        }
                    }
                    info!("HTTPS server stopped");
                })
            }
            Listener::Http(addr) => {
                let listener = tokio::net::TcpListener::bind(addr)
                    .await
                    .map_err(|e| anyhow::anyhow!("Failed to bind to address '{addr}': {e}"))?;
                info!("HTTP server listening on {}", addr);

                tokio::spawn(async move {
                    let mut shutdown_rx = shutdown_tx.subscribe();
                    let server = axum::serve(listener, make_service).with_graceful_shutdown(
                        async move {
                            let _ = shutdown_rx.recv().await;
                            info!("HTTP server received shutdown signal");
                        },
                    );
                    if let Err(e) = server.await {
                        error!("HTTP server error: {}", e);
                        let _ = shutdown_tx.send(());
                    }
                    info!("HTTP server stopped");
                })
            }
        };

        Ok(handle)
    }

    /// 广播关停信号并停止清理任务
    pub fn stop_all(&self) {
        info!("Stopping all services");
        let _ = self.shutdown_tx.send(());
        self.sweeper_shutdown.cancel();
    }
}

fn parse_addr(bind_addr: &str) -> Result<SocketAddr> {
    bind_addr
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid bind address '{bind_addr}': {e}"))
}
