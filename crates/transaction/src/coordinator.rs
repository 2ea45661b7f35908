use crate::consistency::ConsistencyValidator;
use crate::deadlock::{AdmissionRejection, DeadlockDetector};
use crate::error::{TransactionError, TransactionErrorKind};
use crate::log::TransactionLog;
use crate::metrics::TransactionMetrics;
use crate::participant::{Sessions, StoreRef};
use anyhow::anyhow;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tandem_core::{SessionStatus, StoreKind, TransactionId, TransactionSettings, TransactionState};
use tracing::{error, info, warn};

/// **分布式事务协调器**：在 PostgreSQL / ClickHouse / Redis 之间提供类两阶段提交语义。
///
/// 流程：
/// 1. Admission: 死锁检测器准入，失败直接返回 `DeadlockDetected`，不打开任何会话。
/// 2. Phase 1: 按存储类型名称的固定顺序 flush + prepare，任一失败则逆序回滚全部会话。
/// 3. Body: 业务代码拿着已 prepare 的会话继续写入，报错/超时/panic 都走完整回滚。
/// 4. Phase 2: 同样顺序提交。已有参与者提交后再失败即为部分提交 (`CommitFailed`)。
/// 5. 每次状态变化都写事务日志并更新计数器。
/// 6. 清理：关闭所有会话，最后才把事务 ID 移出活跃集合。
///
/// 由启动流程显式构造，`Arc` 共享给调用方，不使用全局单例。
pub struct TransactionCoordinator {
    detector: DeadlockDetector,
    log: TransactionLog,
    metrics: Arc<TransactionMetrics>,
    consistency_history: usize,
}

impl TransactionCoordinator {
    pub fn new(settings: &TransactionSettings) -> Self {
        Self {
            detector: DeadlockDetector::new(settings.max_concurrent_transactions),
            log: TransactionLog::new(settings.log_capacity),
            metrics: Arc::new(TransactionMetrics::new()),
            consistency_history: settings.consistency_history,
        }
    }

    /// 快捷构造：只指定并发上限，其余使用默认配置
    pub fn with_ceiling(max_concurrent_transactions: usize) -> Self {
        Self::new(&TransactionSettings {
            max_concurrent_transactions,
            ..TransactionSettings::default()
        })
    }

    pub fn metrics(&self) -> &Arc<TransactionMetrics> {
        &self.metrics
    }

    pub fn log(&self) -> &TransactionLog {
        &self.log
    }

    pub fn detector(&self) -> &DeadlockDetector {
        &self.detector
    }

    pub fn active_transactions(&self) -> usize {
        self.detector.active_count()
    }

    /// 与本协调器共享计数器的一致性校验器
    pub fn consistency_validator(&self) -> ConsistencyValidator {
        ConsistencyValidator::new(self.metrics.clone(), self.consistency_history)
    }

    // =========================================================================
    // 1. 手动控制：begin -> prepare -> commit / abort
    // =========================================================================

    /// 开启事务 (协调器生成事务 ID)：准入 + 打开所有参与者会话
    pub async fn begin_transaction(
        &self,
        participants: &[StoreRef],
    ) -> Result<DistributedTransaction<'_>, TransactionError> {
        self.begin_transaction_with_id(TransactionId::generate(), participants)
            .await
    }

    /// 开启事务 (调用方指定事务 ID)
    pub async fn begin_transaction_with_id(
        &self,
        xid: TransactionId,
        participants: &[StoreRef],
    ) -> Result<DistributedTransaction<'_>, TransactionError> {
        self.metrics.record_attempt();

        let mut stores: Vec<StoreRef> = participants.to_vec();
        stores.sort_by(|a, b| a.kind().name().cmp(b.kind().name()));
        let kinds: Vec<StoreKind> = stores.iter().map(|s| s.kind()).collect();

        // --- Admission ---
        if let Err(rejection) = self.detector.check_admission(&xid, &kinds) {
            self.metrics.record_deadlock_prevented();
            warn!(
                target: "tandem::admission",
                transaction_id = %xid,
                reason = %rejection,
                active = self.detector.active_count(),
                ceiling = self.detector.ceiling(),
                "admission rejected"
            );
            // 重复 ID 时不写日志，避免覆盖正在进行的那个事务的最新状态
            if !matches!(rejection, AdmissionRejection::AlreadyActive(_)) {
                self.log
                    .append(&xid, TransactionState::Rejected, &kinds, Some(rejection.to_string()));
            }
            return Err(TransactionError::new(
                xid,
                TransactionErrorKind::DeadlockDetected,
                rejection.to_string(),
            ));
        }
        self.log.append(&xid, TransactionState::Started, &kinds, None);

        let mut txn = DistributedTransaction {
            coordinator: self,
            xid,
            kinds,
            sessions: Sessions::new(Vec::new()),
            prepared: false,
            finished: false,
        };

        // --- 打开会话 ---
        let mut opened = Vec::with_capacity(stores.len());
        for store in &stores {
            match store.open_session(&txn.xid).await {
                Ok(session) => opened.push(session),
                Err(e) => {
                    txn.sessions = Sessions::new(opened);
                    let message = format!("failed to open {} session: {:#}", store.kind(), e);
                    return Err(txn
                        .rollback_all(TransactionErrorKind::PrepareFailed, message)
                        .await);
                }
            }
        }
        txn.sessions = Sessions::new(opened);
        Ok(txn)
    }

    // =========================================================================
    // 2. 作用域形式：begin -> prepare -> body -> commit，任何退出路径都保证提交或回滚
    // =========================================================================

    /// 在一个分布式事务中执行 `body`
    ///
    /// ```ignore
    /// let id = coordinator
    ///     .run_in_transaction(&[pg, clickhouse], |sessions| Box::pin(async move {
    ///         let pg = sessions.downcast_mut::<PgSession>().context("no pg session")?;
    ///         sqlx::query("INSERT ...").execute(pg.connection()?).await?;
    ///         Ok(42)
    ///     }))
    ///     .await?;
    /// ```
    pub async fn run_in_transaction<T, F>(&self, participants: &[StoreRef], body: F) -> Result<T, TransactionError>
    where
        T: Send,
        F: for<'s> FnOnce(&'s mut Sessions) -> BoxFuture<'s, anyhow::Result<T>> + Send,
    {
        self.execute(TransactionId::generate(), participants, None, body)
            .await
    }

    pub async fn run_in_transaction_with_id<T, F>(
        &self,
        xid: TransactionId,
        participants: &[StoreRef],
        body: F,
    ) -> Result<T, TransactionError>
    where
        T: Send,
        F: for<'s> FnOnce(&'s mut Sessions) -> BoxFuture<'s, anyhow::Result<T>> + Send,
    {
        self.execute(xid, participants, None, body).await
    }

    /// 带调用方截止时间：`body` 超时视为 `BodyError`，走同一条回滚路径
    pub async fn run_in_transaction_with_deadline<T, F>(
        &self,
        participants: &[StoreRef],
        deadline: Duration,
        body: F,
    ) -> Result<T, TransactionError>
    where
        T: Send,
        F: for<'s> FnOnce(&'s mut Sessions) -> BoxFuture<'s, anyhow::Result<T>> + Send,
    {
        self.execute(TransactionId::generate(), participants, Some(deadline), body)
            .await
    }

    async fn execute<T, F>(
        &self,
        xid: TransactionId,
        participants: &[StoreRef],
        deadline: Option<Duration>,
        body: F,
    ) -> Result<T, TransactionError>
    where
        T: Send,
        F: for<'s> FnOnce(&'s mut Sessions) -> BoxFuture<'s, anyhow::Result<T>> + Send,
    {
        let mut txn = self.begin_transaction_with_id(xid, participants).await?;
        txn.prepare().await?;

        let outcome = {
            let guarded = AssertUnwindSafe(body(txn.sessions_mut())).catch_unwind();
            match deadline {
                Some(limit) => match tokio::time::timeout(limit, guarded).await {
                    Ok(result) => result,
                    Err(_) => Ok(Err(anyhow!("deadline of {:?} exceeded", limit))),
                },
                None => guarded.await,
            }
        };

        match outcome {
            Ok(Ok(value)) => {
                txn.commit().await?;
                Ok(value)
            }
            Ok(Err(e)) => Err(txn.abort(format!("{:#}", e)).await),
            Err(panic) => Err(txn
                .abort(format!("body panicked: {}", panic_message(&*panic)))
                .await),
        }
    }
}

/// 一个进行中的分布式事务
///
/// 未完成 (未 commit / abort) 就被丢弃时，Drop 会释放准入名额；
/// sqlx 事务在 drop 时自动回滚，缓冲型参与者直接丢弃缓冲。
pub struct DistributedTransaction<'c> {
    coordinator: &'c TransactionCoordinator,
    xid: TransactionId,
    kinds: Vec<StoreKind>,
    sessions: Sessions,
    prepared: bool,
    finished: bool,
}

impl DistributedTransaction<'_> {
    pub fn id(&self) -> &TransactionId {
        &self.xid
    }

    /// 固定顺序下的参与者类型
    pub fn participants(&self) -> &[StoreKind] {
        &self.kinds
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    pub fn sessions_mut(&mut self) -> &mut Sessions {
        &mut self.sessions
    }

    /// Phase 1：按固定顺序 flush + prepare
    ///
    /// 失败时已逆序回滚全部会话并完成清理，返回 `PrepareFailed`。
    pub async fn prepare(&mut self) -> Result<(), TransactionError> {
        if self.prepared {
            return Ok(());
        }

        let mut failure = None;
        for session in self.sessions.entries_mut().iter_mut() {
            let kind = session.kind();
            let result = match session.flush().await {
                Ok(()) => session.prepare(&self.xid).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                failure = Some(format!("{} failed to prepare: {:#}", kind, e));
                break;
            }
        }

        if let Some(message) = failure {
            return Err(self
                .rollback_all(TransactionErrorKind::PrepareFailed, message)
                .await);
        }

        self.prepared = true;
        self.coordinator
            .log
            .append(&self.xid, TransactionState::Prepared, &self.kinds, None);
        Ok(())
    }

    /// Phase 2：按同样的顺序提交
    pub async fn commit(mut self) -> Result<(), TransactionError> {
        self.prepare().await?;

        let mut committed = Vec::new();
        let mut failure = None;
        for session in self.sessions.entries_mut().iter_mut() {
            let kind = session.kind();
            match session.commit(&self.xid).await {
                Ok(()) => committed.push(kind),
                Err(e) => {
                    if session.status() == SessionStatus::PartiallyCommitted {
                        committed.push(kind);
                    }
                    failure = Some(format!("{} failed to commit: {:#}", kind, e));
                    break;
                }
            }
        }

        match failure {
            None => {
                self.coordinator
                    .log
                    .append(&self.xid, TransactionState::Committed, &self.kinds, None);
                self.coordinator.metrics.record_commit();
                self.cleanup().await;
                Ok(())
            }
            // 还没有任何写入生效，整体仍可干净回滚
            Some(message) if committed.is_empty() => Err(self
                .rollback_all(TransactionErrorKind::CommitAborted, message)
                .await),
            Some(message) => Err(self.fail_partial(committed, message).await),
        }
    }

    /// 业务侧主动放弃：逆序回滚全部会话
    pub async fn abort(mut self, reason: impl Into<String>) -> TransactionError {
        self.rollback_all(TransactionErrorKind::BodyError, reason.into())
            .await
    }

    /// 逆序回滚所有尚未提交/回滚的会话，返回回滚失败信息
    async fn undo(&mut self) -> Vec<String> {
        let mut failures = Vec::new();
        for session in self.sessions.entries_mut().iter_mut().rev() {
            if matches!(
                session.status(),
                SessionStatus::Committed
                    | SessionStatus::PartiallyCommitted
                    | SessionStatus::RolledBack
                    | SessionStatus::Closed
            ) {
                continue;
            }
            let kind = session.kind();
            if let Err(e) = session.rollback(&self.xid).await {
                error!(
                    transaction_id = %self.xid,
                    participant = %kind,
                    "rollback failed: {:#}", e
                );
                failures.push(format!("{} rollback failed: {:#}", kind, e));
            }
        }
        failures
    }

    async fn rollback_all(&mut self, kind: TransactionErrorKind, message: String) -> TransactionError {
        warn!(
            transaction_id = %self.xid,
            reason = %kind,
            "rolling back distributed transaction: {}", message
        );
        let failures = self.undo().await;

        let text = join_failures(message, &failures);
        self.coordinator
            .log
            .append(&self.xid, TransactionState::RolledBack, &self.kinds, Some(text.clone()));
        if failures.is_empty() {
            self.coordinator.metrics.record_rollback();
        } else {
            self.coordinator.metrics.record_failed_rollback();
        }

        self.cleanup().await;
        TransactionError::new(self.xid.clone(), kind, text)
    }

    /// 部分提交：剩余 prepared 会话仍要回滚，不能悬挂在 prepared 状态
    async fn fail_partial(&mut self, committed: Vec<StoreKind>, message: String) -> TransactionError {
        let failures = self.undo().await;

        let text = join_failures(message, &failures);
        self.coordinator.log.append(
            &self.xid,
            TransactionState::CommittedPartial,
            &self.kinds,
            Some(text.clone()),
        );
        self.coordinator.metrics.record_partial_commit();

        self.cleanup().await;
        TransactionError {
            transaction_id: self.xid.clone(),
            kind: TransactionErrorKind::CommitFailed,
            message: text,
            committed,
        }
    }

    /// 关闭所有会话，最后释放准入名额
    async fn cleanup(&mut self) {
        for session in self.sessions.entries_mut().iter_mut() {
            if let Err(e) = session.close().await {
                warn!(
                    transaction_id = %self.xid,
                    participant = %session.kind(),
                    "failed to close session: {:#}", e
                );
            }
        }
        self.coordinator.detector.release(&self.xid);
        self.finished = true;
        info!(transaction_id = %self.xid, "distributed transaction finished");
    }
}

impl Drop for DistributedTransaction<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        warn!(
            transaction_id = %self.xid,
            "distributed transaction dropped before completion, uncommitted work discarded"
        );
        self.coordinator.log.append(
            &self.xid,
            TransactionState::RolledBack,
            &self.kinds,
            Some("transaction handle dropped before completion".to_string()),
        );
        self.coordinator.metrics.record_rollback();
        self.coordinator.detector.release(&self.xid);
    }
}

fn join_failures(message: String, failures: &[String]) -> String {
    if failures.is_empty() {
        message
    } else {
        format!("{}; {}", message, failures.join("; "))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
