#![allow(dead_code)]

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::any::Any;
use std::sync::{Arc, Mutex};
use tandem_core::{IsolationLevel, SessionStatus, StoreKind, TransactionId};
use tandem_transaction::{ParticipantSession, ParticipantStore, StoreRef};

/// 模拟参与者的故障注入开关
#[derive(Debug, Clone, Copy, Default)]
pub struct Faults {
    pub fail_open: bool,
    pub fail_prepare: bool,
    pub fail_commit: bool,
    /// 提交中途失败，部分写入已生效
    pub partial_commit: bool,
    pub fail_rollback: bool,
}

/// 所有模拟参与者共享的调用记录: (存储类型, 操作名)
#[derive(Default)]
pub struct CallLog {
    calls: Mutex<Vec<(StoreKind, String)>>,
}

impl CallLog {
    pub fn record(&self, kind: StoreKind, op: &str) {
        self.calls.lock().unwrap().push((kind, op.to_string()));
    }

    pub fn count(&self, kind: StoreKind, op: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, o)| *k == kind && o == op)
            .count()
    }

    /// 某种操作的调用顺序 (按存储类型)
    pub fn order_of(&self, op: &str) -> Vec<StoreKind> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, o)| o == op)
            .map(|(k, _)| *k)
            .collect()
    }

    pub fn total(&self, op: &str) -> usize {
        self.order_of(op).len()
    }
}

pub struct MockStore {
    kind: StoreKind,
    faults: Faults,
    calls: Arc<CallLog>,
}

impl MockStore {
    pub fn new(kind: StoreKind, calls: Arc<CallLog>) -> StoreRef {
        Self::with_faults(kind, Faults::default(), calls)
    }

    pub fn with_faults(kind: StoreKind, faults: Faults, calls: Arc<CallLog>) -> StoreRef {
        Arc::new(MockStore {
            kind,
            faults,
            calls,
        })
    }
}

#[async_trait]
impl ParticipantStore for MockStore {
    fn kind(&self) -> StoreKind {
        self.kind
    }

    async fn open_session(&self, _xid: &TransactionId) -> Result<Box<dyn ParticipantSession>> {
        self.calls.record(self.kind, "open");
        if self.faults.fail_open {
            bail!("{} refused connection", self.kind);
        }
        Ok(Box::new(MockSession {
            kind: self.kind,
            faults: self.faults,
            calls: self.calls.clone(),
            status: SessionStatus::Active,
            writes: Vec::new(),
        }))
    }
}

pub struct MockSession {
    kind: StoreKind,
    faults: Faults,
    calls: Arc<CallLog>,
    status: SessionStatus,
    pub writes: Vec<String>,
}

impl MockSession {
    pub fn write(&mut self, statement: &str) {
        self.calls.record(self.kind, "write");
        self.writes.push(statement.to_string());
    }
}

#[async_trait]
impl ParticipantSession for MockSession {
    fn kind(&self) -> StoreKind {
        self.kind
    }

    fn isolation_level(&self) -> IsolationLevel {
        IsolationLevel::ReadCommitted
    }

    fn status(&self) -> SessionStatus {
        self.status
    }

    async fn flush(&mut self) -> Result<()> {
        self.calls.record(self.kind, "flush");
        Ok(())
    }

    async fn prepare(&mut self, _xid: &TransactionId) -> Result<()> {
        self.calls.record(self.kind, "prepare");
        if self.faults.fail_prepare {
            bail!("{} flush rejected", self.kind);
        }
        self.status = SessionStatus::Prepared;
        Ok(())
    }

    async fn commit(&mut self, _xid: &TransactionId) -> Result<()> {
        self.calls.record(self.kind, "commit");
        if self.faults.fail_commit {
            bail!("{} commit rejected", self.kind);
        }
        if self.faults.partial_commit {
            self.status = SessionStatus::PartiallyCommitted;
            bail!("{} commit interrupted after first statement", self.kind);
        }
        self.status = SessionStatus::Committed;
        Ok(())
    }

    async fn rollback(&mut self, _xid: &TransactionId) -> Result<()> {
        self.calls.record(self.kind, "rollback");
        if self.faults.fail_rollback {
            bail!("{} rollback rejected", self.kind);
        }
        self.status = SessionStatus::RolledBack;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.calls.record(self.kind, "close");
        self.status = SessionStatus::Closed;
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
