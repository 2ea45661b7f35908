use crate::consistency::{KeyRange, RecordCounter};
use crate::participant::{ParticipantSession, ParticipantStore};
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use std::any::Any;
use tandem_core::{validate_identifier, IsolationLevel, SessionStatus, StoreKind, TransactionId};
use tracing::debug;

/// 行存参与者 (PostgreSQL)
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    isolation: IsolationLevel,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            isolation: IsolationLevel::ReadCommitted,
        }
    }

    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }

    /// 针对某张表的记录计数器 (一致性校验用)
    pub fn counter(&self, table: &str, key_column: &str) -> Result<PgRecordCounter> {
        validate_identifier(table)?;
        validate_identifier(key_column)?;
        Ok(PgRecordCounter {
            pool: self.pool.clone(),
            table: table.to_string(),
            key_column: key_column.to_string(),
        })
    }
}

#[async_trait]
impl ParticipantStore for PgStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Relational
    }

    async fn open_session(&self, xid: &TransactionId) -> Result<Box<dyn ParticipantSession>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin PostgreSQL transaction")?;

        // 必须是事务里的第一条语句
        if let Some(clause) = self.isolation.sql_clause() {
            sqlx::query(&format!("SET TRANSACTION ISOLATION LEVEL {}", clause))
                .execute(&mut *tx)
                .await
                .context("Failed to set transaction isolation level")?;
        }

        debug!(transaction_id = %xid, isolation = %self.isolation, "postgres session opened");
        Ok(Box::new(PgSession {
            tx: Some(tx),
            isolation: self.isolation,
            status: SessionStatus::Active,
        }))
    }
}

/// PostgreSQL 会话：持有一个 sqlx 事务
///
/// 未提交就被丢弃时，sqlx 会在连接归还连接池前自动回滚。
pub struct PgSession {
    tx: Option<Transaction<'static, Postgres>>,
    isolation: IsolationLevel,
    status: SessionStatus,
}

impl PgSession {
    /// 业务代码用来执行 SQL 的连接
    pub fn connection(&mut self) -> Result<&mut PgConnection> {
        let tx = self
            .tx
            .as_mut()
            .context("PostgreSQL session is already finished")?;
        Ok(&mut **tx)
    }
}

#[async_trait]
impl ParticipantSession for PgSession {
    fn kind(&self) -> StoreKind {
        StoreKind::Relational
    }

    fn isolation_level(&self) -> IsolationLevel {
        self.isolation
    }

    fn status(&self) -> SessionStatus {
        self.status
    }

    /// 把 DEFERRABLE 约束的检查提前到现在，让违反约束的写入在 prepare 阶段就失败
    async fn flush(&mut self) -> Result<()> {
        sqlx::query("SET CONSTRAINTS ALL IMMEDIATE")
            .execute(self.connection()?)
            .await
            .context("Failed to flush pending constraint checks")?;
        Ok(())
    }

    async fn prepare(&mut self, xid: &TransactionId) -> Result<()> {
        // 探活：事务已处于 aborted 状态时这里会报错
        sqlx::query("SELECT 1")
            .execute(self.connection()?)
            .await
            .context("PostgreSQL transaction is not healthy")?;
        self.status = SessionStatus::Prepared;
        debug!(transaction_id = %xid, "postgres session prepared");
        Ok(())
    }

    async fn commit(&mut self, xid: &TransactionId) -> Result<()> {
        let tx = self
            .tx
            .take()
            .context("PostgreSQL session is already finished")?;
        tx.commit().await.context("PostgreSQL COMMIT failed")?;
        self.status = SessionStatus::Committed;
        debug!(transaction_id = %xid, "postgres session committed");
        Ok(())
    }

    async fn rollback(&mut self, xid: &TransactionId) -> Result<()> {
        if let Some(tx) = self.tx.take() {
            tx.rollback().await.context("PostgreSQL ROLLBACK failed")?;
        }
        self.status = SessionStatus::RolledBack;
        debug!(transaction_id = %xid, "postgres session rolled back");
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        // 正常路径下这里已经是 None
        self.tx.take();
        self.status = SessionStatus::Closed;
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// PostgreSQL 记录计数器：`SELECT count(*) ... WHERE key >= from AND key < to`
pub struct PgRecordCounter {
    pool: PgPool,
    table: String,
    key_column: String,
}

#[async_trait]
impl RecordCounter for PgRecordCounter {
    fn kind(&self) -> StoreKind {
        StoreKind::Relational
    }

    fn label(&self) -> String {
        format!("{}:{}", StoreKind::Relational, self.table)
    }

    async fn count(&self, range: &KeyRange) -> Result<u64> {
        let sql = format!(
            "SELECT count(*) FROM {table} WHERE {col} >= $1 AND {col} < $2",
            table = self.table,
            col = self.key_column
        );
        let count: i64 = sqlx::query_scalar(&sql)
            .bind(range.from)
            .bind(range.to)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("Failed to count rows in {}", self.table))?;
        Ok(u64::try_from(count).unwrap_or_default())
    }
}
