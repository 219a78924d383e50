//! 单个 shield-group 的用量账本
//!
//! 每个客户端一条 `ClientUsage` 记录，首次计费时惰性创建。
//! 所有修改都在账本互斥锁内完成，锁内只有内存运算，不做 I/O、不睡眠。

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// 客户端在某个分组内的用量状态
#[derive(Debug, Clone, Copy)]
pub struct ClientUsage {
    /// 截至 `last_activity` 的累计开销（未衰减）
    consumed: f64,
    last_activity: Instant,
    /// 最近一次被拒绝的时间，即 isOver 标记
    rejected_at: Option<Instant>,
}

impl ClientUsage {
    fn new(now: Instant) -> Self {
        Self {
            consumed: 0.0,
            last_activity: now,
            rejected_at: None,
        }
    }

    /// 按窗口线性衰减后的用量
    fn decayed(&self, now: Instant, window: Duration) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_activity);
        if window.is_zero() || elapsed >= window {
            return 0.0;
        }
        let remaining = 1.0 - elapsed.as_secs_f64() / window.as_secs_f64();
        (self.consumed * remaining).max(0.0)
    }

    /// 是否可以被回收
    ///
    /// 被拒绝的记录需同时满足拒绝时长与空闲时长都超过保留期；
    /// 未被拒绝的记录只看空闲时长。
    fn is_reclaimable(&self, now: Instant, retention: Duration) -> bool {
        let idle = now.saturating_duration_since(self.last_activity) >= retention;
        match self.rejected_at {
            Some(rejected_at) => idle && now.saturating_duration_since(rejected_at) >= retention,
            None => idle,
        }
    }
}

#[derive(Debug)]
struct LedgerState {
    window: Duration,
    clients: HashMap<String, ClientUsage>,
}

/// 分组账本统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerStats {
    pub clients: usize,
    pub rejected: usize,
}

/// 单个分组的用量账本
#[derive(Debug)]
pub struct UsageLedger {
    state: Mutex<LedgerState>,
}

impl UsageLedger {
    pub fn new(window: Duration) -> Self {
        Self {
            state: Mutex::new(LedgerState {
                window,
                clients: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        // 临界区内只有算术运算，中毒的锁状态仍然一致
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn window(&self) -> Duration {
        self.lock().window
    }

    /// 策略热更新时替换窗口，已有记录保留
    pub fn set_window(&self, window: Duration) {
        self.lock().window = window;
    }

    /// 当前窗口内的用量
    pub fn consumed(&self, client: &str) -> f64 {
        let now = Instant::now();
        let state = self.lock();
        state
            .clients
            .get(client)
            .map(|usage| usage.decayed(now, state.window))
            .unwrap_or(0.0)
    }

    /// 原子地累加开销，返回累加后的用量
    pub fn record_cost(&self, client: &str, cost: f64) -> f64 {
        let now = Instant::now();
        let mut state = self.lock();
        let window = state.window;
        let usage = state
            .clients
            .entry(client.to_string())
            .or_insert_with(|| ClientUsage::new(now));

        let current = usage.decayed(now, window);
        if cost.is_finite() && cost > 0.0 {
            usage.consumed = current + cost;
        } else {
            usage.consumed = current;
        }
        usage.last_activity = now;
        usage.consumed
    }

    /// 标记客户端被拒绝（刷新拒绝时间）
    pub fn mark_rejected(&self, client: &str) -> Instant {
        let now = Instant::now();
        let mut state = self.lock();
        let usage = state
            .clients
            .entry(client.to_string())
            .or_insert_with(|| ClientUsage::new(now));
        usage.rejected_at = Some(now);
        now
    }

    pub fn is_rejected(&self, client: &str) -> Option<Instant> {
        self.lock()
            .clients
            .get(client)
            .and_then(|usage| usage.rejected_at)
    }

    /// 删除超过保留期的记录，返回删除条数
    pub fn sweep(&self, retention: Duration) -> usize {
        let now = Instant::now();
        let mut state = self.lock();
        let before = state.clients.len();
        state
            .clients
            .retain(|_, usage| !usage.is_reclaimable(now, retention));
        before - state.clients.len()
    }

    pub fn stats(&self) -> LedgerStats {
        let state = self.lock();
        LedgerStats {
            clients: state.clients.len(),
            rejected: state
                .clients
                .values()
                .filter(|usage| usage.rejected_at.is_some())
                .count(),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    #[tokio::test(start_paused = true)]
    async fn test_record_and_read_without_elapsed_time() {
        let ledger = UsageLedger::new(Duration::from_secs(60));
        assert_eq!(ledger.consumed("a"), 0.0);

        ledger.record_cost("a", 1.0);
        ledger.record_cost("a", 4.0);
        assert_eq!(ledger.consumed("a"), 5.0);
        assert_eq!(ledger.consumed("b"), 0.0);
        assert_eq!(ledger.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_linear_decay_over_window() {
        let ledger = UsageLedger::new(Duration::from_secs(60));
        ledger.record_cost("a", 100.0);

        tokio::time::advance(Duration::from_secs(30)).await;
        let half = ledger.consumed("a");
        assert!((half - 50.0).abs() < 1e-6, "got {half}");

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(ledger.consumed("a"), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_folds_decay_before_adding() {
        let ledger = UsageLedger::new(Duration::from_secs(10));
        ledger.record_cost("a", 10.0);
        tokio::time::advance(Duration::from_secs(5)).await;

        let after = ledger.record_cost("a", 1.0);
        assert!((after - 6.0).abs() < 1e-6, "got {after}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_costs_are_ignored() {
        let ledger = UsageLedger::new(Duration::from_secs(60));
        ledger.record_cost("a", 3.0);
        ledger.record_cost("a", -10.0);
        ledger.record_cost("a", f64::NAN);
        assert_eq!(ledger.consumed("a"), 3.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_entry_retained_for_retention_window() {
        let ledger = UsageLedger::new(Duration::from_secs(60));
        ledger.record_cost("a", 200.0);
        ledger.mark_rejected("a");
        assert!(ledger.is_rejected("a").is_some());

        tokio::time::advance(HOUR - Duration::from_secs(1)).await;
        assert_eq!(ledger.sweep(HOUR), 0);
        assert!(ledger.is_rejected("a").is_some());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(ledger.sweep(HOUR), 1);
        assert!(ledger.is_rejected("a").is_none());
        assert!(ledger.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_recent_traffic_keeps_rejected_entry() {
        let ledger = UsageLedger::new(Duration::from_secs(60));
        ledger.mark_rejected("a");

        tokio::time::advance(Duration::from_secs(3000)).await;
        ledger.record_cost("a", 1.0);
        tokio::time::advance(Duration::from_secs(700)).await;

        // 拒绝已超过一小时，但最近仍有流量
        assert_eq!(ledger.sweep(HOUR), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_entry_reclaimed() {
        let ledger = UsageLedger::new(Duration::from_secs(60));
        ledger.record_cost("idle", 1.0);
        ledger.record_cost("busy", 1.0);

        tokio::time::advance(HOUR - Duration::from_secs(10)).await;
        ledger.record_cost("busy", 1.0);
        tokio::time::advance(Duration::from_secs(10)).await;

        assert_eq!(ledger.sweep(HOUR), 1);
        assert_eq!(
            ledger.stats(),
            LedgerStats {
                clients: 1,
                rejected: 0
            }
        );
    }
}
