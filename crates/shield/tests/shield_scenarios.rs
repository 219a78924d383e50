use async_trait::async_trait;
use http::{HeaderMap, Method, StatusCode};
use shield::{
    Decision, GuardedResponseWriter, ResponseSink, ShieldBinding, ShieldError, ShieldPolicy,
    ShieldRegistry, WriterState, decide,
};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const CLIENT: &str = "203.0.113.9";

#[derive(Default)]
struct Captured {
    status: Option<StatusCode>,
    body: Vec<u8>,
}

/// 最小写入器：只记录最后的状态码与正文，不支持 flush / hijack
struct VecSink {
    headers: HeaderMap,
    captured: Arc<Mutex<Captured>>,
}

#[async_trait]
impl ResponseSink for VecSink {
    type Conn = ();

    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    fn write_header(&mut self, status: StatusCode) {
        self.captured.lock().unwrap().status = Some(status);
    }

    async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.captured.lock().unwrap().body.extend_from_slice(buf);
        Ok(buf.len())
    }
}

fn scenario_policy() -> ShieldPolicy {
    ShieldPolicy::new("apps", 50.0, 100.0).with_window(Duration::from_secs(60))
}

async fn serve(
    registry: &Arc<ShieldRegistry>,
    method: Method,
    status: StatusCode,
) -> (Result<usize, ShieldError>, WriterState, Arc<Mutex<Captured>>) {
    let captured = Arc::new(Mutex::new(Captured::default()));
    let sink = VecSink {
        headers: HeaderMap::new(),
        captured: captured.clone(),
    };
    let mut writer = GuardedResponseWriter::new(
        sink,
        registry.clone(),
        ShieldBinding {
            group: "apps".to_string(),
            client: CLIENT.to_string(),
            policy: Some(scenario_policy()),
            method,
            privileged: false,
        },
    );
    writer.write_header(status);
    let result = writer.write(b"payload").await;
    let outcome = writer.finish().await;
    (result, outcome.state, captured)
}

#[tokio::test(start_paused = true)]
async fn test_error_inducing_post_leads_to_rejection() {
    let registry = Arc::new(ShieldRegistry::default());
    registry.apply_policies([&scenario_policy()]);

    for _ in 0..5 {
        let (result, state, captured) = serve(&registry, Method::GET, StatusCode::OK).await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(state, WriterState::Allowed);
        assert_eq!(captured.lock().unwrap().status, Some(StatusCode::OK));
    }
    assert_eq!(registry.consumed("apps", CLIENT), 5.0);
    assert_eq!(
        decide(Some(&scenario_policy()), registry.consumed("apps", CLIENT), false),
        Decision::Allow
    );

    // POST 返回 500：5 * 30 = 150
    let (result, state, _) = serve(&registry, Method::POST, StatusCode::INTERNAL_SERVER_ERROR).await;
    assert!(result.is_ok());
    assert_eq!(state, WriterState::Allowed);
    assert_eq!(registry.consumed("apps", CLIENT), 155.0);

    let (result, state, captured) = serve(&registry, Method::GET, StatusCode::OK).await;
    assert!(matches!(result, Err(ShieldError::Rejected { .. })));
    assert_eq!(state, WriterState::Rejected);
    let captured = captured.lock().unwrap();
    assert_eq!(captured.status, Some(StatusCode::SERVICE_UNAVAILABLE));
    assert_eq!(captured.body, shield::REJECTION_BODY.as_bytes());
}

#[tokio::test(start_paused = true)]
async fn test_throttled_client_is_delayed_but_served() {
    let registry = Arc::new(ShieldRegistry::default());
    registry.apply_policies([&scenario_policy()]);
    registry.record_cost("apps", CLIENT, 70.0);

    let started = tokio::time::Instant::now();
    let (result, state, captured) = serve(&registry, Method::GET, StatusCode::OK).await;
    assert_eq!(result.unwrap(), 7);
    assert_eq!(state, WriterState::Allowed);
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(captured.lock().unwrap().body, b"payload");
}

#[tokio::test(start_paused = true)]
async fn test_usage_drains_and_client_recovers() {
    let registry = Arc::new(ShieldRegistry::default());
    registry.apply_policies([&scenario_policy()]);
    registry.record_cost("apps", CLIENT, 155.0);

    let (result, _, _) = serve(&registry, Method::GET, StatusCode::OK).await;
    assert!(result.is_err());

    tokio::time::advance(Duration::from_secs(60)).await;
    let (result, state, _) = serve(&registry, Method::GET, StatusCode::OK).await;
    assert!(result.is_ok());
    assert_eq!(state, WriterState::Allowed);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_client_reclaimed_after_one_hour() {
    let registry = Arc::new(ShieldRegistry::default());
    registry.apply_policies([&scenario_policy()]);
    registry.record_cost("apps", CLIENT, 155.0);
    let _ = serve(&registry, Method::GET, StatusCode::OK).await;
    assert!(registry.is_rejected("apps", CLIENT).is_some());

    tokio::time::advance(Duration::from_secs(3599)).await;
    assert_eq!(registry.sweep(), 0);
    tokio::time::advance(Duration::from_secs(1)).await;
    assert_eq!(registry.sweep(), 1);
    assert_eq!(registry.tracked_clients(), 0);
}

#[test]
fn test_concurrent_record_cost_loses_no_update() {
    let registry = Arc::new(ShieldRegistry::default());
    // 一小时窗口，测试期间的衰减可忽略
    registry.apply_policies([&ShieldPolicy::new("apps", 1e12, 1e12)
        .with_window(Duration::from_secs(3600))]);

    let threads = 16;
    let per_thread = 500;
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let registry = registry.clone();
            std::thread::spawn(move || {
                for _ in 0..per_thread {
                    registry.record_cost("apps", CLIENT, 1.0);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let expected = (threads * per_thread) as f64;
    let consumed = registry.consumed("apps", CLIENT);
    assert!(
        (expected - consumed).abs() / expected < 1e-3,
        "expected ~{expected}, got {consumed}"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_responses_each_attributed_once() {
    let registry = Arc::new(ShieldRegistry::default());
    let policy = ShieldPolicy::new("apps", 1e12, 1e12).with_window(Duration::from_secs(3600));
    registry.apply_policies([&policy]);

    let mut tasks = Vec::new();
    for _ in 0..64 {
        let registry = registry.clone();
        let policy = policy.clone();
        tasks.push(tokio::spawn(async move {
            let sink = VecSink {
                headers: HeaderMap::new(),
                captured: Arc::new(Mutex::new(Captured::default())),
            };
            let mut writer = GuardedResponseWriter::new(
                sink,
                registry,
                ShieldBinding {
                    group: "apps".to_string(),
                    client: CLIENT.to_string(),
                    policy: Some(policy),
                    method: Method::POST,
                    privileged: false,
                },
            );
            writer.write_header(StatusCode::OK);
            for _ in 0..8 {
                writer.write(b"x").await.unwrap();
            }
            writer.finish().await
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap().state, WriterState::Allowed);
    }

    let consumed = registry.consumed("apps", CLIENT);
    assert!((consumed - 64.0 * 5.0).abs() < 0.5, "got {consumed}");
}
