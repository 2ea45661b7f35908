use crate::metrics::TransactionMetrics;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tandem_core::{Clock, StoreKind};
use tracing::{info, warn};

/// 对账的键区间 `[from, to)` (按时间戳列)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct KeyRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl KeyRange {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self { from, to }
    }
}

/// 记录计数接口：对某个存储在指定区间内做廉价的基数统计
#[async_trait]
pub trait RecordCounter: Send + Sync {
    fn kind(&self) -> StoreKind;

    /// 用于日志/历史的可读标签，例如 "relational:orders"
    fn label(&self) -> String;

    async fn count(&self, range: &KeyRange) -> Result<u64>;
}

/// 一次一致性检查的结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsistencyCheck {
    pub timestamp: DateTime<Utc>,
    pub participant_a: String,
    pub participant_b: String,
    pub range: KeyRange,
    /// 计数失败时为 None
    pub count_a: Option<u64>,
    pub count_b: Option<u64>,
    pub is_consistent: bool,
    pub error: Option<String>,
}

/// 一致性校验器 (仅供监控)
///
/// 提交之后在带外比较两个参与者的记录数。结果为 false 只记录并上报，
/// 绝不触发回滚 (事务早已提交)，留给后续的对账任务处理。
pub struct ConsistencyValidator {
    metrics: Arc<TransactionMetrics>,
    capacity: usize,
    history: Mutex<VecDeque<ConsistencyCheck>>,
}

impl ConsistencyValidator {
    pub fn new(metrics: Arc<TransactionMetrics>, capacity: usize) -> Self {
        Self {
            metrics,
            capacity: capacity.max(1),
            history: Mutex::new(VecDeque::new()),
        }
    }

    pub async fn validate(&self, a: &dyn RecordCounter, b: &dyn RecordCounter, range: &KeyRange) -> bool {
        let (count_a, count_b) = tokio::join!(a.count(range), b.count(range));

        let mut errors = Vec::new();
        let count_a = count_a
            .map_err(|e| errors.push(format!("{}: {:#}", a.label(), e)))
            .ok();
        let count_b = count_b
            .map_err(|e| errors.push(format!("{}: {:#}", b.label(), e)))
            .ok();

        let is_consistent = match (count_a, count_b) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        };

        let check = ConsistencyCheck {
            timestamp: Clock::now(),
            participant_a: a.label(),
            participant_b: b.label(),
            range: *range,
            count_a,
            count_b,
            is_consistent,
            error: if errors.is_empty() {
                None
            } else {
                Some(errors.join("; "))
            },
        };

        if is_consistent {
            info!(
                target: "tandem::consistency",
                participant_a = %check.participant_a,
                participant_b = %check.participant_b,
                count = count_a.unwrap_or_default(),
                "consistency check passed"
            );
        } else if let Some(err) = &check.error {
            // 计数本身失败：无法判断是否分叉，不计入 violation
            warn!(
                target: "tandem::consistency",
                participant_a = %check.participant_a,
                participant_b = %check.participant_b,
                error = %err,
                "consistency check could not complete"
            );
        } else {
            self.metrics.record_consistency_violation();
            warn!(
                target: "tandem::consistency",
                participant_a = %check.participant_a,
                participant_b = %check.participant_b,
                count_a = count_a.unwrap_or_default(),
                count_b = count_b.unwrap_or_default(),
                "consistency violation detected"
            );
        }

        self.record(check);
        is_consistent
    }

    fn record(&self, check: ConsistencyCheck) {
        let mut history = self.history.lock().unwrap_or_else(|p| p.into_inner());
        if history.len() >= self.capacity {
            history.pop_front();
        }
        history.push_back(check);
    }

    /// 检查历史 (旧的在前)
    pub fn history(&self) -> Vec<ConsistencyCheck> {
        self.history
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn last_check(&self) -> Option<ConsistencyCheck> {
        self.history
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .back()
            .cloned()
    }
}
