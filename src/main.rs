//! Portico 主程序
//!
//! 加载配置，启动反向代理与 SmartShield 清理任务，处理关停信号

mod cli;
mod error;
mod observability;
mod process;

use clap::Parser;
use observability::init_observability;
use portico::ServiceManager;
use portico_common::config::PorticoConfig;
use portico_common::error::BaseError;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

macro_rules! bootstrap_info {
    ($($arg:tt)*) => {
        println!($($arg)*)
    };
}

macro_rules! bootstrap_error {
    ($($arg:tt)*) => {
        eprintln!($($arg)*)
    };
}

use cli::{Cli, Commands};
use error::{Error, Result};

/// Application launcher utilities
struct ApplicationLauncher;

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Commands::Test { config_file }) => {
            let config_path =
                ApplicationLauncher::find_config_file(config_file.as_ref().unwrap_or(&cli.config))?;
            ApplicationLauncher::test_config_file(&config_path)
        }
        None => {
            let config_path = ApplicationLauncher::find_config_file(&cli.config)?;

            // Create Tokio runtime（before running the application）
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;

            runtime.block_on(ApplicationLauncher::run_application(&config_path))
        }
    }
}

impl ApplicationLauncher {
    /// Find config file with fallback locations
    fn find_config_file(provided_path: &PathBuf) -> Result<PathBuf> {
        if provided_path != Path::new("config.toml") {
            if provided_path.exists() {
                bootstrap_info!("Using provided config file: {:?}", provided_path);
                return Ok(provided_path.clone());
            }
            bootstrap_error!("Provided config file not found: {:?}", provided_path);
            return Err(Error::custom(format!(
                "Config file not found: {provided_path:?}"
            )));
        }

        let fallback_paths = [
            PathBuf::from("config.toml"),
            PathBuf::from("/etc/portico/config.toml"),
        ];

        bootstrap_info!("Searching for config file in default locations...");
        for path in &fallback_paths {
            if path.exists() {
                bootstrap_info!("Found config file: {:?}", path);
                return Ok(path.clone());
            }
            bootstrap_info!("Config not found at: {:?}", path);
        }

        bootstrap_error!("No configuration file found!");
        bootstrap_error!("Please create a config file in one of these locations:");
        for (i, path) in fallback_paths.iter().enumerate() {
            bootstrap_error!("  {}. {:?}", i + 1, path);
        }
        bootstrap_error!("Or specify a custom path with: portico --config <path>");

        Err(Error::custom(
            "No configuration file found. Please create one or specify path with --config",
        ))
    }

    /// 测试配置文件是否有效
    fn test_config_file(config_path: &Path) -> Result<()> {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .init();

        let config = match PorticoConfig::from_file(config_path) {
            Ok(config) => config,
            Err(e) => {
                error!("❌ 配置文件解析失败: {}", e);
                return Err(Error::service_validation(format!("配置解析失败: {e}")));
            }
        };
        info!("✅ 配置文件解析成功: {:?}", config_path);

        if let Err(errors) = config.validate() {
            report_validation(&errors, |line| info!("{line}"), |line| error!("{line}"));
            if errors.iter().any(|e| !e.starts_with("Warning:")) {
                return Err(Error::service_validation("配置验证失败"));
            }
        }

        info!(
            routes = config.routes.len(),
            policies = config.shield.policies.len(),
            "✅ 完整配置验证通过"
        );
        Ok(())
    }

    /// 运行应用程序的主入口
    async fn run_application(config_path: &Path) -> Result<()> {
        bootstrap_info!("📄 加载配置文件: {:?}", config_path);

        let config = match PorticoConfig::from_file(config_path) {
            Ok(config) => config,
            Err(e) => {
                bootstrap_error!("❌ 配置加载失败: {}", e);
                return Err(e.into());
            }
        };
        if let Err(errors) = config.validate() {
            report_validation(
                &errors,
                |line| bootstrap_info!("{line}"),
                |line| bootstrap_error!("{line}"),
            );
        }
        config.ensure_valid()?;
        bootstrap_info!("✅ 配置加载成功");

        // 初始化日志
        let _observability_guard = init_observability(&config)?;

        // 写入 PID 文件（在降权之前）
        let _pid_file = config
            .get_pid_path()
            .map(|path| process::ProcessManager::write_pid_file(Path::new(&path)))
            .transpose()?;

        portico_common::metrics::register_metrics().map_err(BaseError::from)?;

        let user = config.user.clone();
        let group = config.group.clone();
        Self::run_services_with_privilege_drop(config, config_path.to_path_buf(), user, group)
            .await
    }

    /// 运行服务并在端口绑定后切换用户权限
    async fn run_services_with_privilege_drop(
        config: PorticoConfig,
        config_path: PathBuf,
        user: Option<String>,
        group: Option<String>,
    ) -> Result<()> {
        info!(
            name = %config.name,
            env = %config.env,
            routes = config.routes.len(),
            shield_enabled = config.shield.enabled,
            "🚀 启动 Portico"
        );
        for route in &config.routes {
            info!(
                route = %route.name,
                prefix = %route.prefix,
                upstream = %route.upstream,
                shield_group = route.shield_group.as_deref().unwrap_or("-"),
                "  - route"
            );
        }

        // 初始化全局关闭通道
        let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(10);
        setup_ctrl_c_handler(shutdown_tx.clone());

        let mut service_manager =
            ServiceManager::new(config, Some(config_path), shutdown_tx.clone())?;
        let handles = service_manager.start_all().await?;

        // 端口绑定完成后，切换用户和组
        if let Err(e) = process::ProcessManager::drop_privileges(user.as_deref(), group.as_deref())
        {
            error!("Failed to drop privileges: {}", e);
        }

        info!("✅ 所有服务已启动");

        for handle in handles {
            if let Err(e) = handle.await {
                error!("Service task terminated unexpectedly: {}", e);
                let _ = shutdown_tx.send(());
            }
        }
        service_manager.stop_all();

        info!("🛑 所有服务已安全关闭");
        Ok(())
    }
}

/// 按 Warning / 错误分别输出校验结果
fn report_validation(errors: &[String], warn_out: impl Fn(String), error_out: impl Fn(String)) {
    error_out("❌ 配置验证发现问题:".to_string());
    for (i, err) in errors.iter().enumerate() {
        if err.starts_with("Warning:") {
            warn_out(format!("  {}. ⚠️  {}", i + 1, err));
        } else {
            error_out(format!("  {}. ❌ {}", i + 1, err));
        }
    }
}

/// 设置Ctrl-C信号处理程序
fn setup_ctrl_c_handler(shutdown_tx: tokio::sync::broadcast::Sender<()>) {
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("无法监听Ctrl-C信号: {}", e);
            return;
        }
        info!("收到Ctrl-C信号，开始优雅关闭...");
        let _ = shutdown_tx.send(());
    });
}
