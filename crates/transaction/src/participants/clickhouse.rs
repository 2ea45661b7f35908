use crate::consistency::{KeyRange, RecordCounter};
use crate::participant::{ParticipantSession, ParticipantStore};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::any::Any;
use tandem_core::{validate_identifier, IsolationLevel, SessionStatus, StoreKind, TransactionId};
use tandem_storage::clickhouse::{quote_literal, ClickHouseClient};
use tracing::{debug, warn};

/// 列存参与者 (ClickHouse)
///
/// ClickHouse 没有跨语句事务：会话只缓冲写语句，prepare 阶段探活，
/// commit 时才真正发送；回滚即丢弃缓冲。
#[derive(Clone)]
pub struct ClickHouseStore {
    client: ClickHouseClient,
}

impl ClickHouseStore {
    pub fn new(client: ClickHouseClient) -> Self {
        Self { client }
    }

    pub fn counter(&self, table: &str, key_column: &str) -> Result<ClickHouseRecordCounter> {
        validate_identifier(table)?;
        validate_identifier(key_column)?;
        Ok(ClickHouseRecordCounter {
            client: self.client.clone(),
            table: table.to_string(),
            key_column: key_column.to_string(),
        })
    }
}

#[async_trait]
impl ParticipantStore for ClickHouseStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Columnar
    }

    async fn open_session(&self, xid: &TransactionId) -> Result<Box<dyn ParticipantSession>> {
        debug!(transaction_id = %xid, "clickhouse session opened");
        Ok(Box::new(ClickHouseSession {
            client: self.client.clone(),
            pending: Vec::new(),
            status: SessionStatus::Active,
        }))
    }
}

pub struct ClickHouseSession {
    client: ClickHouseClient,
    pending: Vec<String>,
    status: SessionStatus,
}

impl ClickHouseSession {
    /// 缓冲一条写语句，commit 时按顺序发送
    pub fn execute(&mut self, sql: impl Into<String>) {
        self.pending.push(sql.into());
    }

    /// 以 JSONEachRow 格式缓冲一批插入
    pub fn insert_rows<T: Serialize>(&mut self, table: &str, rows: &[T]) -> Result<()> {
        validate_identifier(table)?;
        if rows.is_empty() {
            return Ok(());
        }
        let mut sql = format!("INSERT INTO {} FORMAT JSONEachRow\n", table);
        for row in rows {
            sql.push_str(&serde_json::to_string(row).context("Failed to encode ClickHouse row")?);
            sql.push('\n');
        }
        self.pending.push(sql);
        Ok(())
    }

    pub fn pending_statements(&self) -> usize {
        self.pending.len()
    }
}

#[async_trait]
impl ParticipantSession for ClickHouseSession {
    fn kind(&self) -> StoreKind {
        StoreKind::Columnar
    }

    fn isolation_level(&self) -> IsolationLevel {
        IsolationLevel::Unisolated
    }

    fn status(&self) -> SessionStatus {
        self.status
    }

    async fn flush(&mut self) -> Result<()> {
        // 写入全部延迟到 commit，这里没有需要推送的内容
        Ok(())
    }

    async fn prepare(&mut self, xid: &TransactionId) -> Result<()> {
        self.client
            .ping()
            .await
            .context("ClickHouse is not reachable")?;
        self.status = SessionStatus::Prepared;
        debug!(transaction_id = %xid, pending = self.pending.len(), "clickhouse session prepared");
        Ok(())
    }

    async fn commit(&mut self, xid: &TransactionId) -> Result<()> {
        let total = self.pending.len();
        for (sent, sql) in std::mem::take(&mut self.pending).into_iter().enumerate() {
            if let Err(e) = self.client.execute(&sql).await {
                if sent > 0 {
                    // 前面的语句已经写入 ClickHouse，不能再当作干净回滚
                    self.status = SessionStatus::PartiallyCommitted;
                    warn!(
                        transaction_id = %xid,
                        sent, total,
                        "clickhouse commit interrupted, earlier statements already applied"
                    );
                }
                return Err(e.context(format!("ClickHouse statement {}/{} failed", sent + 1, total)));
            }
        }
        self.status = SessionStatus::Committed;
        debug!(transaction_id = %xid, statements = total, "clickhouse session committed");
        Ok(())
    }

    async fn rollback(&mut self, xid: &TransactionId) -> Result<()> {
        let discarded = self.pending.len();
        self.pending.clear();
        if self.status == SessionStatus::PartiallyCommitted {
            bail!("ClickHouse statements already applied, cannot roll back");
        }
        self.status = SessionStatus::RolledBack;
        debug!(transaction_id = %xid, discarded, "clickhouse session rolled back");
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.pending.clear();
        self.status = SessionStatus::Closed;
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// ClickHouse 记录计数器
pub struct ClickHouseRecordCounter {
    client: ClickHouseClient,
    table: String,
    key_column: String,
}

#[async_trait]
impl RecordCounter for ClickHouseRecordCounter {
    fn kind(&self) -> StoreKind {
        StoreKind::Columnar
    }

    fn label(&self) -> String {
        format!("{}:{}", StoreKind::Columnar, self.table)
    }

    async fn count(&self, range: &KeyRange) -> Result<u64> {
        let sql = format!(
            "SELECT count() FROM {table} WHERE {col} >= parseDateTime64BestEffort({from}, 3) AND {col} < parseDateTime64BestEffort({to}, 3)",
            table = self.table,
            col = self.key_column,
            from = quote_literal(&range.from.to_rfc3339()),
            to = quote_literal(&range.to.to_rfc3339()),
        );
        self.client
            .query_u64(&sql)
            .await
            .with_context(|| format!("Failed to count rows in {}", self.table))
    }
}
