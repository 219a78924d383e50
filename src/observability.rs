use portico_common::config::PorticoConfig;
use std::fs;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use crate::error::Result;

const LOG_FILE_NAME: &str = "portico.log";

/// 日志写入器守卫，drop 时刷新后台缓冲
#[derive(Default)]
pub struct ObservabilityGuard {
    _log_guard: Option<WorkerGuard>,
}

/// Initialize logging based on configuration
pub fn init_observability(config: &PorticoConfig) -> Result<ObservabilityGuard> {
    let mut guard = ObservabilityGuard::default();
    let filter = create_env_filter(config);

    if config.is_console_logging() {
        init_subscriber_with_writer(std::io::stdout, true, filter);
    } else {
        fs::create_dir_all(&config.log_config().path)?;
        let (non_blocking, worker_guard) = build_file_writer(config)?;
        guard._log_guard = Some(worker_guard);
        init_subscriber_with_writer(non_blocking, false, filter);
    }

    Ok(guard)
}

/// RUST_LOG 优先，其次是配置中的 filter_level，解析失败回退到 info
fn create_env_filter(config: &PorticoConfig) -> EnvFilter {
    let directive = config.get_filter_level();
    EnvFilter::try_new(&directive).unwrap_or_else(|_| {
        println!("Failed to parse filter directive: {directive}. Falling back to default: info");
        EnvFilter::new("info")
    })
}

fn init_subscriber_with_writer<W>(writer: W, use_ansi: bool, filter: EnvFilter)
where
    W: for<'a> fmt::MakeWriter<'a> + Send + Sync + 'static,
{
    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(use_ansi)
        .with_writer(writer);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .ok();
}

fn build_file_writer(config: &PorticoConfig) -> Result<(NonBlocking, WorkerGuard)> {
    let log_config = config.log_config();
    println!("日志写入模式: 文件");
    println!("  - 路径: {}", log_config.path);
    if config.should_rotate_logs() {
        println!("  - 轮转: 开启（按天）");
        let file_appender = tracing_appender::rolling::daily(&log_config.path, LOG_FILE_NAME);
        Ok(tracing_appender::non_blocking(file_appender))
    } else {
        println!("  - 轮转: 关闭");
        let log_file_path = std::path::Path::new(&log_config.path).join(LOG_FILE_NAME);
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file_path)?;
        Ok(tracing_appender::non_blocking(file))
    }
}
