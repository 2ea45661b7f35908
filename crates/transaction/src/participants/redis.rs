use crate::participant::{ParticipantSession, ParticipantStore};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::any::Any;
use tandem_core::{IsolationLevel, SessionStatus, StoreKind, TransactionId};
use tandem_storage::redis::{CacheOp, RedisService};
use tracing::debug;

/// 缓存参与者 (Redis)
///
/// 写操作先缓冲，commit 时以 MULTI/EXEC 一次性原子应用。
#[derive(Clone)]
pub struct RedisStore {
    service: RedisService,
}

impl RedisStore {
    pub fn new(service: RedisService) -> Self {
        Self { service }
    }
}

#[async_trait]
impl ParticipantStore for RedisStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Cache
    }

    async fn open_session(&self, xid: &TransactionId) -> Result<Box<dyn ParticipantSession>> {
        debug!(transaction_id = %xid, "redis session opened");
        Ok(Box::new(RedisSession {
            service: self.service.clone(),
            ops: Vec::new(),
            status: SessionStatus::Active,
        }))
    }
}

pub struct RedisSession {
    service: RedisService,
    ops: Vec<CacheOp>,
    status: SessionStatus,
}

impl RedisSession {
    pub fn set(&mut self, key: &str, value: impl Into<Vec<u8>>, ttl_secs: Option<u64>) {
        self.ops.push(CacheOp::Set {
            key: key.to_string(),
            value: value.into(),
            ttl_secs,
        });
    }

    pub fn delete(&mut self, key: &str) {
        self.ops.push(CacheOp::Delete {
            key: key.to_string(),
        });
    }

    pub fn pending_ops(&self) -> &[CacheOp] {
        &self.ops
    }
}

#[async_trait]
impl ParticipantSession for RedisSession {
    fn kind(&self) -> StoreKind {
        StoreKind::Cache
    }

    fn isolation_level(&self) -> IsolationLevel {
        IsolationLevel::Unisolated
    }

    fn status(&self) -> SessionStatus {
        self.status
    }

    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    async fn prepare(&mut self, xid: &TransactionId) -> Result<()> {
        self.service.ping().await.context("Redis is not reachable")?;
        self.status = SessionStatus::Prepared;
        debug!(transaction_id = %xid, ops = self.ops.len(), "redis session prepared");
        Ok(())
    }

    async fn commit(&mut self, xid: &TransactionId) -> Result<()> {
        let ops = std::mem::take(&mut self.ops);
        self.service.exec_atomic(&ops).await?;
        self.status = SessionStatus::Committed;
        debug!(transaction_id = %xid, ops = ops.len(), "redis session committed");
        Ok(())
    }

    async fn rollback(&mut self, xid: &TransactionId) -> Result<()> {
        self.ops.clear();
        self.status = SessionStatus::RolledBack;
        debug!(transaction_id = %xid, "redis session rolled back");
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.ops.clear();
        self.status = SessionStatus::Closed;
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
