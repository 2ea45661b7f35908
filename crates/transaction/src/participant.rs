use anyhow::Result;
use async_trait::async_trait;
use std::any::Any;
use std::sync::Arc;
use tandem_core::{IsolationLevel, SessionStatus, StoreKind, TransactionId};

/// 事务参与者会话接口
///
/// 每个事务、每个存储一个会话，只归属于创建它的协调器事务。
/// 协调器只依赖这个接口；PostgreSQL / ClickHouse / Redis 各有一份实现。
#[async_trait]
pub trait ParticipantSession: Send {
    /// 存储类型，决定 prepare/commit 的固定顺序
    fn kind(&self) -> StoreKind;

    /// 会话隔离级别标签 (只读)
    fn isolation_level(&self) -> IsolationLevel;

    fn status(&self) -> SessionStatus;

    /// 把挂起的写入推到存储端，尽早暴露约束错误
    async fn flush(&mut self) -> Result<()>;

    /// Phase 1：确认会话可以提交，并标记为 prepared
    async fn prepare(&mut self, xid: &TransactionId) -> Result<()>;

    /// Phase 2：提交
    ///
    /// 失败时若已有部分写入生效，实现必须把状态置为 `PartiallyCommitted`。
    async fn commit(&mut self, xid: &TransactionId) -> Result<()>;

    /// 回滚 (prepared 或 active 状态均可)
    async fn rollback(&mut self, xid: &TransactionId) -> Result<()>;

    /// 释放底层资源，提交/回滚后调用
    async fn close(&mut self) -> Result<()>;

    /// 供业务代码向下转型拿到具体会话 (例如 PostgreSQL 连接)
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// 参与者工厂：协调器通过它为每个事务打开新会话
#[async_trait]
pub trait ParticipantStore: Send + Sync {
    fn kind(&self) -> StoreKind;

    async fn open_session(&self, xid: &TransactionId) -> Result<Box<dyn ParticipantSession>>;
}

pub type StoreRef = Arc<dyn ParticipantStore>;

/// 一个事务内已打开的全部会话，按存储类型名称排序
pub struct Sessions {
    entries: Vec<Box<dyn ParticipantSession>>,
}

impl Sessions {
    pub(crate) fn new(mut entries: Vec<Box<dyn ParticipantSession>>) -> Self {
        sort_by_kind_name(&mut entries);
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 固定顺序下的存储类型列表
    pub fn kinds(&self) -> Vec<StoreKind> {
        self.entries.iter().map(|s| s.kind()).collect()
    }

    pub fn get_mut(&mut self, kind: StoreKind) -> Option<&mut dyn ParticipantSession> {
        self.entries
            .iter_mut()
            .find(|s| s.kind() == kind)
            .map(|s| s.as_mut() as &mut dyn ParticipantSession)
    }

    /// 按具体类型取会话，例如 `sessions.downcast_mut::<PgSession>()`
    pub fn downcast_mut<S: ParticipantSession + 'static>(&mut self) -> Option<&mut S> {
        self.entries
            .iter_mut()
            .find_map(|s| s.as_any_mut().downcast_mut::<S>())
    }

    pub(crate) fn entries_mut(&mut self) -> &mut [Box<dyn ParticipantSession>] {
        &mut self.entries
    }
}

/// 按存储类型名称排序 (与调用方传入顺序无关)
fn sort_by_kind_name(entries: &mut [Box<dyn ParticipantSession>]) {
    entries.sort_by(|a, b| a.kind().name().cmp(b.kind().name()));
}
