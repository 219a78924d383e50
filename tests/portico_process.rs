use serial_test::serial;
use std::{
    fs,
    path::{Path, PathBuf},
    process::{Child, Command, ExitStatus, Stdio},
    thread,
    time::{Duration, Instant},
};

const START_TIMEOUT: Duration = Duration::from_secs(15);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

fn choose_port() -> u16 {
    let probe = std::net::TcpListener::bind("127.0.0.1:0").expect("bind probe");
    probe.local_addr().expect("probe addr").port()
}

fn write_minimal_config(dir: &Path, port: u16) -> PathBuf {
    let config_path = dir.join("config.toml");
    fs::write(
        &config_path,
        format!(
            r#"
name = "portico-process-test"
env = "dev"
pid = "{pid}"

[bind.http]
domain_name = "localhost"
ip = "127.0.0.1"
port = {port}

[[routes]]
name = "dead"
prefix = "/dead"
upstream = "http://127.0.0.1:1"
shield_group = "apps"

[shield]
sweep_interval_secs = 1

[[shield.policies]]
group = "apps"
soft_threshold = 50.0
hard_threshold = 100.0

[observability]
filter_level = "info"

[observability.log]
output = "console"
"#,
            pid = dir.join("run").join("portico.pid").display()
        ),
    )
    .expect("write config");
    config_path
}

fn spawn_portico(config: &Path, log_path: &Path) -> Child {
    let bin = PathBuf::from(env!("CARGO_BIN_EXE_portico"));
    let log_file = fs::File::create(log_path).expect("create log file");
    Command::new(bin)
        .arg("--config")
        .arg(config)
        .stdout(Stdio::from(log_file.try_clone().expect("dup log")))
        .stderr(Stdio::from(log_file))
        .spawn()
        .expect("spawn portico")
}

async fn wait_for_health(url: &str, child: &mut Child, log_path: &Path) {
    let client = reqwest::Client::new();
    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait().unwrap_or(None) {
            let log = fs::read_to_string(log_path).unwrap_or_default();
            panic!("portico exited early: status={status:?}\nlogs:\n{log}");
        }

        if let Ok(resp) = client.get(url).send().await
            && resp.status().is_success()
        {
            return;
        }
        if start.elapsed() > START_TIMEOUT {
            let log = fs::read_to_string(log_path).unwrap_or_default();
            panic!("health check not ready at {url}\nlogs:\n{log}");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// 发送 SIGINT 并等待退出，超时则强制结束
fn graceful_shutdown(mut child: Child) -> Option<ExitStatus> {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;
        let _ = kill(Pid::from_raw(child.id() as i32), Signal::SIGINT);
    }
    let start = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Some(status),
            Ok(None) => {
                if start.elapsed() > SHUTDOWN_TIMEOUT {
                    let _ = child.kill();
                    return None;
                }
                thread::sleep(Duration::from_millis(100));
            }
            Err(_) => return None,
        }
    }
}

#[cfg(unix)]
#[tokio::test]
#[serial]
async fn portico_starts_serves_health_and_shuts_down() {
    let tmp = tempfile::tempdir().expect("temp dir");
    let port = choose_port();
    let config_path = write_minimal_config(tmp.path(), port);
    let log_path = tmp.path().join("portico.log");
    let mut child = spawn_portico(&config_path, &log_path);

    let base = format!("http://127.0.0.1:{port}");
    wait_for_health(&format!("{base}/health"), &mut child, &log_path).await;

    let pid_path = tmp.path().join("run").join("portico.pid");
    let pid = fs::read_to_string(&pid_path).expect("pid file written");
    assert_eq!(pid.trim(), child.id().to_string());

    let resp = reqwest::get(format!("{base}/nowhere"))
        .await
        .expect("unrouted request");
    assert_eq!(resp.status().as_u16(), 404);
    assert!(resp.text().await.unwrap().contains("ROUTE001"));

    let resp = reqwest::get(format!("{base}/dead/x"))
        .await
        .expect("dead upstream request");
    assert_eq!(resp.status().as_u16(), 502);

    // 未配置 admin token，/api 不挂载管理接口，按普通路径处理
    let resp = reqwest::get(format!("{base}/api/config"))
        .await
        .expect("admin request");
    assert_eq!(resp.status().as_u16(), 404);

    let metrics = reqwest::get(format!("{base}/metrics"))
        .await
        .expect("metrics request")
        .text()
        .await
        .unwrap();
    assert!(metrics.contains("portico_shield_tracked_clients"), "{metrics}");

    let status = graceful_shutdown(child).expect("portico should exit on SIGINT");
    assert!(status.success(), "exit status: {status:?}");
    assert!(!pid_path.exists(), "pid file should be removed on shutdown");
}

#[cfg(unix)]
#[tokio::test]
#[serial]
async fn portico_exits_when_port_is_taken() {
    let tmp = tempfile::tempdir().expect("temp dir");
    let occupied = std::net::TcpListener::bind("127.0.0.1:0").expect("occupy port");
    let port = occupied.local_addr().unwrap().port();
    let config_path = write_minimal_config(tmp.path(), port);
    let log_path = tmp.path().join("portico-port-taken.log");
    let mut child = spawn_portico(&config_path, &log_path);

    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait().expect("check child status") {
            assert!(!status.success(), "process should fail when bind fails");
            let log = fs::read_to_string(&log_path).unwrap_or_default();
            assert!(log.contains("Failed to bind"), "logs: {log}");
            return;
        }
        if start.elapsed() > START_TIMEOUT {
            graceful_shutdown(child);
            panic!("portico should fail fast when its port is taken");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
