use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use tandem_core::{Clock, StoreKind, TransactionId, TransactionState};
use tracing::{error, info, warn};

/// 事务日志条目：每次状态变化追加一条，永不修改
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionLogEntry {
    pub transaction_id: TransactionId,
    pub state: TransactionState,
    pub timestamp: DateTime<Utc>,
    pub participants: Vec<StoreKind>,
    pub error: Option<String>,
}

/// 追加式事务日志 (内存环形缓冲)
///
/// 每条记录同时以扁平 key/value 事件写到 `tandem::txlog` target，供外部可观测管道采集。
pub struct TransactionLog {
    capacity: usize,
    entries: Mutex<VecDeque<TransactionLogEntry>>,
}

impl TransactionLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
        }
    }

    pub fn append(
        &self,
        xid: &TransactionId,
        state: TransactionState,
        participants: &[StoreKind],
        error: Option<String>,
    ) {
        let entry = TransactionLogEntry {
            transaction_id: xid.clone(),
            state,
            timestamp: Clock::now(),
            participants: participants.to_vec(),
            error,
        };
        emit(&entry);

        let mut entries = self.lock();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// 某个事务的全部日志，按追加顺序
    pub fn entries_for(&self, xid: &TransactionId) -> Vec<TransactionLogEntry> {
        self.lock()
            .iter()
            .filter(|e| &e.transaction_id == xid)
            .cloned()
            .collect()
    }

    /// 最后写入者胜出
    pub fn latest_state(&self, xid: &TransactionId) -> Option<TransactionState> {
        self.lock()
            .iter()
            .rev()
            .find(|e| &e.transaction_id == xid)
            .map(|e| e.state)
    }

    /// 最近 n 条 (新的在后)
    pub fn recent(&self, n: usize) -> Vec<TransactionLogEntry> {
        let entries = self.lock();
        let skip = entries.len().saturating_sub(n);
        entries.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<TransactionLogEntry>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn emit(entry: &TransactionLogEntry) {
    let participants = entry
        .participants
        .iter()
        .map(|k| k.name())
        .collect::<Vec<_>>()
        .join(",");
    let err = entry.error.as_deref().unwrap_or("");

    match entry.state {
        TransactionState::CommittedPartial => error!(
            target: "tandem::txlog",
            transaction_id = %entry.transaction_id,
            state = %entry.state,
            participants = %participants,
            error = err,
            "partial commit, manual reconciliation required"
        ),
        TransactionState::RolledBack | TransactionState::Rejected => warn!(
            target: "tandem::txlog",
            transaction_id = %entry.transaction_id,
            state = %entry.state,
            participants = %participants,
            error = err,
            "transaction state changed"
        ),
        _ => info!(
            target: "tandem::txlog",
            transaction_id = %entry.transaction_id,
            state = %entry.state,
            participants = %participants,
            "transaction state changed"
        ),
    }
}
