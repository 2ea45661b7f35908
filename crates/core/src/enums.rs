// crates/core/src/enums.rs
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

/// 参与者存储类型
///
/// 协调器按名称排序 ("cache" < "columnar" < "relational") 决定 prepare/commit 顺序，
/// 回滚时按相反顺序执行。
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, EnumString, IntoStaticStr,
)]
#[serde(rename_all = "snake_case")] // 序列化为 "relational", "columnar"
#[strum(serialize_all = "snake_case")]
pub enum StoreKind {
    /// 行存 OLTP (PostgreSQL)
    Relational,
    /// 列存 OLAP (ClickHouse)
    Columnar,
    /// 缓存 (Redis)
    Cache,
}

impl StoreKind {
    pub fn name(self) -> &'static str {
        self.into()
    }
}

/// 会话隔离级别标签 (只读)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, Default)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum IsolationLevel {
    ReadUncommitted,
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
    /// 存储本身不提供事务隔离 (ClickHouse / Redis)
    Unisolated,
}

impl IsolationLevel {
    /// PostgreSQL `SET TRANSACTION ISOLATION LEVEL` 子句
    pub fn sql_clause(&self) -> Option<&'static str> {
        match self {
            IsolationLevel::ReadUncommitted => Some("READ UNCOMMITTED"),
            IsolationLevel::ReadCommitted => Some("READ COMMITTED"),
            IsolationLevel::RepeatableRead => Some("REPEATABLE READ"),
            IsolationLevel::Serializable => Some("SERIALIZABLE"),
            IsolationLevel::Unisolated => None,
        }
    }
}

/// 单个参与者会话的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, Default)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Active,     // 已打开，尚未 prepare
    Prepared,   // 已 flush + prepare
    Committed,  // 已提交
    /// 提交中途失败，之前发送的写入已生效，无法再回滚
    PartiallyCommitted,
    RolledBack, // 已回滚
    Closed,     // 已关闭
}

/// 事务日志中的状态值
///
/// 日志只追加不修改，读取时以最后一条为准。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TransactionState {
    Started,
    Prepared,
    Committed,
    /// 部分参与者已提交后另一个提交失败，需要人工对账
    CommittedPartial,
    RolledBack,
    /// 准入阶段被拒绝 (死锁风险)
    Rejected,
}

impl TransactionState {
    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionState::Committed
                | TransactionState::CommittedPartial
                | TransactionState::RolledBack
                | TransactionState::Rejected
        )
    }
}
