use serde::Serialize;
use strum::{Display, EnumString};
use tandem_core::{StoreKind, TransactionId};
use thiserror::Error;

/// 事务失败原因码 (reason code)
///
/// 业务层根据原因码翻译成 API 响应，不需要解析错误文本。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TransactionErrorKind {
    /// 准入被拒绝 (并发上限 / 重复事务 ID / 重复参与者)，没有打开任何会话
    DeadlockDetected,
    /// 打开会话或 Phase 1 失败，已全部回滚
    PrepareFailed,
    /// 业务代码报错、超时或 panic，已全部回滚
    BodyError,
    /// 第一个参与者提交即失败且没有写入生效，已全部回滚
    CommitAborted,
    /// 已有参与者提交后另一个提交失败，数据处于部分提交状态
    CommitFailed,
}

/// 协调器对外唯一的错误类型
#[derive(Debug, Error)]
#[error("transaction {transaction_id} failed [{kind}]: {message}")]
pub struct TransactionError {
    pub transaction_id: TransactionId,
    pub kind: TransactionErrorKind,
    pub message: String,
    /// 已提交或部分写入已生效的参与者 (仅 CommitFailed 时非空)
    pub committed: Vec<StoreKind>,
}

impl TransactionError {
    pub fn new(transaction_id: TransactionId, kind: TransactionErrorKind, message: impl Into<String>) -> Self {
        Self {
            transaction_id,
            kind,
            message: message.into(),
            committed: Vec::new(),
        }
    }

    pub fn reason_code(&self) -> String {
        self.kind.to_string()
    }

    /// 调用方能否 (退避后) 直接重试
    pub fn is_retryable(&self) -> bool {
        !self.requires_reconciliation()
    }

    /// 是否需要人工对账 (部分提交)
    pub fn requires_reconciliation(&self) -> bool {
        self.kind == TransactionErrorKind::CommitFailed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_partial_commit_requires_reconciliation() {
        let xid = TransactionId::from("txn_1");
        for kind in [
            TransactionErrorKind::DeadlockDetected,
            TransactionErrorKind::PrepareFailed,
            TransactionErrorKind::BodyError,
            TransactionErrorKind::CommitAborted,
        ] {
            let err = TransactionError::new(xid.clone(), kind, "x");
            assert!(err.is_retryable(), "{} should be retryable", kind);
        }

        let err = TransactionError::new(xid, TransactionErrorKind::CommitFailed, "boom");
        assert!(err.requires_reconciliation());
        assert_eq!(err.reason_code(), "commit_failed");
        assert!(err.to_string().contains("[commit_failed]"));
    }
}
