use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// 进程级事务计数器
///
/// 只做原子自增，监控侧通过 `snapshot()` 读取。
#[derive(Debug, Default)]
pub struct TransactionMetrics {
    transactions_attempted: AtomicU64,
    successful_commits: AtomicU64,
    successful_rollbacks: AtomicU64,
    failed_rollbacks: AtomicU64,
    partial_commits: AtomicU64,
    deadlocks_prevented: AtomicU64,
    consistency_violations: AtomicU64,
}

/// 计数器快照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub struct MetricsSnapshot {
    pub transactions_attempted: u64,
    pub successful_commits: u64,
    pub successful_rollbacks: u64,
    pub failed_rollbacks: u64,
    pub partial_commits: u64,
    pub deadlocks_prevented: u64,
    pub consistency_violations: u64,
}

impl TransactionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_attempt(&self) {
        self.transactions_attempted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_commit(&self) {
        self.successful_commits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rollback(&self) {
        self.successful_rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed_rollback(&self) {
        self.failed_rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_partial_commit(&self) {
        self.partial_commits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_deadlock_prevented(&self) {
        self.deadlocks_prevented.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_consistency_violation(&self) {
        self.consistency_violations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            transactions_attempted: self.transactions_attempted.load(Ordering::Relaxed),
            successful_commits: self.successful_commits.load(Ordering::Relaxed),
            successful_rollbacks: self.successful_rollbacks.load(Ordering::Relaxed),
            failed_rollbacks: self.failed_rollbacks.load(Ordering::Relaxed),
            partial_commits: self.partial_commits.load(Ordering::Relaxed),
            deadlocks_prevented: self.deadlocks_prevented.load(Ordering::Relaxed),
            consistency_violations: self.consistency_violations.load(Ordering::Relaxed),
        }
    }
}
