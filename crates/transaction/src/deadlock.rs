use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use tandem_core::{StoreKind, TransactionId};
use thiserror::Error;
use tracing::warn;

/// 准入拒绝原因
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionRejection {
    #[error("concurrency ceiling reached ({active}/{ceiling} active transactions)")]
    CeilingReached { active: usize, ceiling: usize },

    #[error("transaction id {0} already has an outstanding transaction")]
    AlreadyActive(TransactionId),

    #[error("participant {0} requested more than once")]
    DuplicateParticipant(StoreKind),
}

/// 死锁检测器 (启发式)
///
/// 并不是真正的 wait-for 图环检测：活跃事务数达到上限就拒绝新事务，
/// 把它当作锁竞争失控的代理指标。宁可误拒 (false positive)，上限需按部署调优。
///
/// 内部只有一个短暂持有的互斥锁，绝不跨 `.await` 持有。
pub struct DeadlockDetector {
    ceiling: usize,
    active: Mutex<HashMap<TransactionId, BTreeSet<StoreKind>>>,
}

impl DeadlockDetector {
    pub fn new(ceiling: usize) -> Self {
        Self {
            ceiling: ceiling.max(1),
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// 检查并登记：通过则把事务加入活跃集合，拒绝则不留下任何痕迹
    ///
    /// 检查与登记在同一把锁内完成，并发请求不会同时越过上限。
    pub fn check_admission(&self, xid: &TransactionId, kinds: &[StoreKind]) -> Result<(), AdmissionRejection> {
        let mut held = BTreeSet::new();
        for kind in kinds {
            if !held.insert(*kind) {
                return Err(AdmissionRejection::DuplicateParticipant(*kind));
            }
        }

        let mut active = self.lock();
        if active.contains_key(xid) {
            return Err(AdmissionRejection::AlreadyActive(xid.clone()));
        }
        if active.len() >= self.ceiling {
            return Err(AdmissionRejection::CeilingReached {
                active: active.len(),
                ceiling: self.ceiling,
            });
        }
        active.insert(xid.clone(), held);
        Ok(())
    }

    /// 释放 (提交/回滚的清理阶段调用)。重复释放是无害的。
    pub fn release(&self, xid: &TransactionId) -> bool {
        self.lock().remove(xid).is_some()
    }

    pub fn active_count(&self) -> usize {
        self.lock().len()
    }

    pub fn is_active(&self, xid: &TransactionId) -> bool {
        self.lock().contains_key(xid)
    }

    /// 当前持有某个存储的事务数
    pub fn holders_of(&self, kind: StoreKind) -> usize {
        self.lock().values().filter(|held| held.contains(&kind)).count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<TransactionId, BTreeSet<StoreKind>>> {
        // 持锁期间不会 panic，中毒时直接沿用内部数据
        self.active.lock().unwrap_or_else(|poisoned| {
            warn!("admission registry mutex poisoned, recovering");
            poisoned.into_inner()
        })
    }
}
