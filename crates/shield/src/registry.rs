//! Shield 注册表
//!
//! 持有所有分组的用量账本，是跨请求共享的唯一状态：
//! - 外层读写锁只保护「分组 -> 账本」映射，查找分组时取读锁
//! - 每个分组一个独立互斥锁，避免不同分组之间互相争用
//! - 后台清理任务定期回收过期记录

use crate::ledger::{LedgerStats, UsageLedger};
use crate::policy::ShieldPolicy;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// 拒绝状态 / 空闲记录的默认保留期
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(60 * 60);

/// 分组快照，供管理接口展示
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct GroupSnapshot {
    pub group: String,
    pub window_secs: u64,
    pub clients: usize,
    pub rejected: usize,
}

/// 所有分组账本的并发安全注册表
#[derive(Debug)]
pub struct ShieldRegistry {
    ledgers: RwLock<HashMap<String, Arc<UsageLedger>>>,
    retention: Duration,
}

impl Default for ShieldRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION)
    }
}

impl ShieldRegistry {
    pub fn new(retention: Duration) -> Self {
        Self {
            ledgers: RwLock::new(HashMap::new()),
            retention,
        }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    fn ledger(&self, group: &str) -> Option<Arc<UsageLedger>> {
        self.ledgers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(group)
            .cloned()
    }

    /// 应用（热更新）策略集合
    ///
    /// 新分组创建空账本，已有分组只更新窗口，客户端记录保持不变。
    pub fn apply_policies<'a>(&self, policies: impl IntoIterator<Item = &'a ShieldPolicy>) {
        let mut ledgers = self
            .ledgers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for policy in policies {
            match ledgers.get(&policy.group) {
                Some(ledger) => {
                    if ledger.window() != policy.window() {
                        debug!(
                            group = %policy.group,
                            window_secs = policy.window_secs,
                            "SmartShield: window updated"
                        );
                        ledger.set_window(policy.window());
                    }
                }
                None => {
                    debug!(group = %policy.group, "SmartShield: ledger created");
                    ledgers.insert(
                        policy.group.clone(),
                        Arc::new(UsageLedger::new(policy.window())),
                    );
                }
            }
        }
    }

    /// 确保分组账本存在（请求路径上策略刚加载时使用）
    pub fn ensure_group(&self, policy: &ShieldPolicy) {
        if self.ledger(&policy.group).is_none() {
            self.apply_policies(std::iter::once(policy));
        }
    }

    /// 当前窗口内的用量，未知分组或客户端为 0
    pub fn consumed(&self, group: &str, client: &str) -> f64 {
        self.ledger(group)
            .map(|ledger| ledger.consumed(client))
            .unwrap_or(0.0)
    }

    /// 累加开销，返回累加后的用量；未注册的分组不计费
    pub fn record_cost(&self, group: &str, client: &str, cost: f64) -> Option<f64> {
        self.ledger(group)
            .map(|ledger| ledger.record_cost(client, cost))
    }

    pub fn mark_rejected(&self, group: &str, client: &str) -> Option<Instant> {
        self.ledger(group)
            .map(|ledger| ledger.mark_rejected(client))
    }

    pub fn is_rejected(&self, group: &str, client: &str) -> Option<Instant> {
        self.ledger(group)
            .and_then(|ledger| ledger.is_rejected(client))
    }

    /// 回收所有分组中过期的记录，返回回收总数
    ///
    /// 逐个分组加锁，持锁时间只覆盖该分组的清理。
    pub fn sweep(&self) -> usize {
        let ledgers: Vec<(String, Arc<UsageLedger>)> = self
            .ledgers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(group, ledger)| (group.clone(), ledger.clone()))
            .collect();

        let mut removed = 0;
        for (group, ledger) in ledgers {
            let count = ledger.sweep(self.retention);
            if count > 0 {
                debug!(group = %group, removed = count, "SmartShield: reclaimed stale clients");
            }
            removed += count;
        }
        removed
    }

    /// 跟踪中的客户端总数
    pub fn tracked_clients(&self) -> usize {
        self.ledgers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .map(|ledger| ledger.len())
            .sum()
    }

    pub fn snapshot(&self) -> Vec<GroupSnapshot> {
        let ledgers = self
            .ledgers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut groups: Vec<GroupSnapshot> = ledgers
            .iter()
            .map(|(group, ledger)| {
                let LedgerStats { clients, rejected } = ledger.stats();
                GroupSnapshot {
                    group: group.clone(),
                    window_secs: ledger.window().as_secs(),
                    clients,
                    rejected,
                }
            })
            .collect();
        groups.sort_by(|a, b| a.group.cmp(&b.group));
        groups
    }

    /// 启动后台清理任务，收到取消信号后退出
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // 第一次 tick 立即返回，跳过
            ticker.tick().await;
            info!(
                interval_secs = interval.as_secs(),
                retention_secs = registry.retention.as_secs(),
                "SmartShield sweeper started"
            );
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = registry.sweep();
                        debug!(
                            removed,
                            tracked = registry.tracked_clients(),
                            "SmartShield sweep finished"
                        );
                    }
                    _ = shutdown.cancelled() => {
                        info!("SmartShield sweeper stopped");
                        break;
                    }
                }
            }
        })
    }
}
