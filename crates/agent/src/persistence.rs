use crate::snapshot::StateSnapshot;
use crate::store::{RunStore, StateCache};
use crate::types::{AgentRunState, ResumePoint, SaveOutcome, ThreadContext};
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex};
use tandem_core::{Clock, PersistenceSettings, SubAgentResult, TandemError};
use tracing::{debug, error, info, warn};

const TARGET: &str = "tandem::persistence";

pub fn state_key(run_id: &str) -> String {
    format!("agent_state:{}", run_id)
}

pub fn result_key(run_id: &str, agent_name: &str) -> String {
    format!("agent_result:{}:{}", run_id, agent_name)
}

pub fn thread_context_key(thread_id: &str) -> String {
    format!("thread_context:{}", thread_id)
}

/// **状态持久化引擎**：Agent 运行的 checkpoint / 恢复
///
/// * 写：先落持久层 (失败即 `success = false`)，再写缓存；缓存写失败时删掉旧副本，
///   保证同一进程内随后的读取不会拿到上一次的状态。
/// * 读：缓存优先，未命中回源持久层并回填缓存 (read-through)。
/// * 所有调用都在引擎内部吞掉异常并记录日志，只返回 bool / Option，
///   丢失一次 checkpoint 不能中断正在运行的 Agent。
///
/// 由启动流程显式构造并以 `Arc` 共享。
pub struct StatePersistence {
    cache: Arc<dyn StateCache>,
    store: Arc<dyn RunStore>,
    state_ttl_secs: u64,
    thread_context_ttl_secs: u64,
    /// 缓存中可能仍是旧值的 key (覆盖和删除都失败过)，读取时绕过缓存
    stale: Mutex<HashSet<String>>,
}

impl StatePersistence {
    pub fn new(cache: Arc<dyn StateCache>, store: Arc<dyn RunStore>, settings: &PersistenceSettings) -> Self {
        Self {
            cache,
            store,
            state_ttl_secs: settings.state_ttl_secs,
            thread_context_ttl_secs: settings.thread_context_ttl_secs(),
            stale: Mutex::new(HashSet::new()),
        }
    }

    // =========================================================================
    // 1. Agent 状态
    // =========================================================================

    pub async fn save_agent_state(
        &self,
        run_id: &str,
        thread_id: &str,
        user_id: &str,
        state: &AgentRunState,
    ) -> SaveOutcome {
        let snapshot = StateSnapshot::new(run_id, thread_id, user_id, state.clone());
        let snapshot_id = snapshot.snapshot_id.clone();

        let encoded = snapshot.encode().and_then(|bytes| Ok((bytes, snapshot.to_value()?)));
        let (bytes, doc) = match encoded {
            Ok(pair) => pair,
            Err(e) => {
                error!(target: TARGET, run_id, error = %e, "failed to encode agent state");
                return SaveOutcome {
                    success: false,
                    snapshot_id,
                };
            }
        };

        if let Err(e) = self.store.save_state(run_id, &doc).await {
            error!(target: TARGET, run_id, snapshot_id = %snapshot_id, "checkpoint lost, durable write failed: {:#}", e);
            return SaveOutcome {
                success: false,
                snapshot_id,
            };
        }

        let cached = self.replace_cached(&state_key(run_id), &bytes).await;
        self.refresh_thread_context(&snapshot, None).await;
        info!(
            target: TARGET,
            run_id,
            snapshot_id = %snapshot_id,
            step = snapshot.state.step_count,
            cached,
            "agent state saved"
        );
        SaveOutcome {
            success: true,
            snapshot_id,
        }
    }

    pub async fn load_agent_state(&self, run_id: &str) -> Option<AgentRunState> {
        self.load_snapshot(run_id).await.map(|s| s.state)
    }

    /// 读取完整快照信封 (含 thread / user 关联)
    pub async fn load_snapshot(&self, run_id: &str) -> Option<StateSnapshot> {
        let key = state_key(run_id);

        if let Some(bytes) = self.fresh_cache_get(&key).await {
            match StateSnapshot::decode(&bytes) {
                Ok(snapshot) => return Some(snapshot),
                Err(e) => {
                    // 缓存里是坏数据或其它进程写入的新版本：丢弃，回源持久层
                    warn!(target: TARGET, run_id, error = %e, "discarding unreadable cached state");
                    self.cache_delete(&key).await;
                }
            }
        }

        let doc = match self.store.load_state(run_id).await {
            Ok(Some(doc)) => doc,
            Ok(None) => {
                debug!(target: TARGET, run_id, "no checkpoint for run");
                return None;
            }
            Err(e) => {
                error!(target: TARGET, run_id, "failed to read durable state: {:#}", e);
                return None;
            }
        };

        let snapshot = match StateSnapshot::from_value(doc) {
            Ok(snapshot) => snapshot,
            Err(e @ TandemError::UnsupportedFormat { .. }) => {
                warn!(target: TARGET, run_id, error = %e, "durable state written by a newer version, ignored");
                return None;
            }
            Err(e) => {
                error!(target: TARGET, run_id, error = %e, "durable state is corrupted");
                return None;
            }
        };

        // read-through：以当前格式回填缓存
        match snapshot.encode() {
            Ok(bytes) => {
                if self.replace_cached(&key, &bytes).await {
                    debug!(target: TARGET, run_id, "cache repopulated from durable state");
                }
            }
            Err(e) => warn!(target: TARGET, run_id, error = %e, "failed to re-encode state for cache"),
        }
        Some(snapshot)
    }

    /// 删除缓存中的状态副本，下次读取回源持久层
    pub async fn invalidate_cached_state(&self, run_id: &str) -> bool {
        let key = state_key(run_id);
        if self.cache_delete(&key).await {
            self.set_stale(&key, false);
            true
        } else {
            self.set_stale(&key, true);
            false
        }
    }

    // =========================================================================
    // 2. 子 Agent 结果
    // =========================================================================

    pub async fn save_sub_agent_result(&self, run_id: &str, agent_name: &str, result: Value) -> bool {
        let record = SubAgentResult::new(run_id, agent_name, result);
        let key = result_key(run_id, agent_name);

        let bytes = match serde_json::to_vec(&record) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(target: TARGET, run_id, agent_name, error = %e, "failed to encode sub-agent result");
                return false;
            }
        };

        if let Err(e) = self.store.save_result(&record).await {
            error!(target: TARGET, run_id, agent_name, "sub-agent result lost, durable write failed: {:#}", e);
            return false;
        }
        let cached = self.replace_cached(&key, &bytes).await;

        if let Some(snapshot) = self.load_snapshot(run_id).await {
            self.refresh_thread_context(&snapshot, Some(agent_name)).await;
        }
        info!(target: TARGET, run_id, agent_name, cached, "sub-agent result saved");
        true
    }

    pub async fn load_sub_agent_result(&self, run_id: &str, agent_name: &str) -> Option<SubAgentResult> {
        let key = result_key(run_id, agent_name);

        if let Some(bytes) = self.fresh_cache_get(&key).await {
            match serde_json::from_slice::<SubAgentResult>(&bytes) {
                Ok(result) => return Some(result),
                Err(e) => {
                    warn!(target: TARGET, run_id, agent_name, error = %e, "discarding unreadable cached result");
                    self.cache_delete(&key).await;
                }
            }
        }

        let result = match self.store.load_result(run_id, agent_name).await {
            Ok(result) => result?,
            Err(e) => {
                error!(target: TARGET, run_id, agent_name, "failed to read durable result: {:#}", e);
                return None;
            }
        };

        if let Ok(bytes) = serde_json::to_vec(&result) {
            self.replace_cached(&key, &bytes).await;
        }
        Some(result)
    }

    // =========================================================================
    // 3. 线程上下文 / 恢复点
    // =========================================================================

    /// 线程级摘要，只存在于缓存 (过期即返回 None)
    pub async fn get_thread_context(&self, thread_id: &str) -> Option<ThreadContext> {
        let bytes = self.cache_get(&thread_context_key(thread_id)).await?;
        match serde_json::from_slice(&bytes) {
            Ok(ctx) => Some(ctx),
            Err(e) => {
                warn!(target: TARGET, thread_id, error = %e, "discarding unreadable thread context");
                None
            }
        }
    }

    /// 重建中断运行的位置：已完成的阶段直接复用结果，不再重复执行
    ///
    /// `pipeline` 为该类运行的阶段顺序 (子 Agent 名称)。
    pub async fn resume_point(&self, run_id: &str, pipeline: &[&str]) -> ResumePoint {
        let state = self.load_agent_state(run_id).await;

        let mut completed = Vec::new();
        let mut pending = Vec::new();
        match self.store.load_results(run_id).await {
            Ok(results) => {
                for name in pipeline {
                    match results.iter().find(|r| r.agent_name == *name) {
                        Some(result) => completed.push(result.clone()),
                        None => pending.push(name.to_string()),
                    }
                }
            }
            Err(e) => {
                // 持久层不可用时逐个查缓存，尽量少重跑
                warn!(target: TARGET, run_id, "failed to list durable results, falling back to cache: {:#}", e);
                for name in pipeline {
                    match self.load_sub_agent_result(run_id, name).await {
                        Some(result) => completed.push(result),
                        None => pending.push(name.to_string()),
                    }
                }
            }
        }

        info!(
            target: TARGET,
            run_id,
            step = state.as_ref().map(|s| s.step_count).unwrap_or_default(),
            completed = completed.len(),
            pending = pending.len(),
            "resume point reconstructed"
        );
        ResumePoint {
            run_id: run_id.to_string(),
            state,
            completed,
            pending,
        }
    }

    async fn refresh_thread_context(&self, snapshot: &StateSnapshot, new_category: Option<&str>) {
        if snapshot.thread_id.is_empty() {
            return;
        }

        // 同一线程换了新的运行时，类别从该运行已落盘的结果重新累计
        let mut result_categories = match self.get_thread_context(&snapshot.thread_id).await {
            Some(ctx) if ctx.run_id == snapshot.run_id => ctx.result_categories,
            _ => self.durable_categories(&snapshot.run_id).await,
        };
        if let Some(category) = new_category {
            result_categories.insert(category.to_string());
        }

        let ctx = ThreadContext {
            thread_id: snapshot.thread_id.clone(),
            run_id: snapshot.run_id.clone(),
            user_id: snapshot.user_id.clone(),
            last_step: snapshot.state.step_count,
            phase: snapshot.state.phase.clone(),
            result_categories,
            updated_at: Clock::now(),
        };
        match serde_json::to_vec(&ctx) {
            Ok(bytes) => {
                self.cache_set(&thread_context_key(&ctx.thread_id), &bytes, self.thread_context_ttl_secs)
                    .await;
            }
            Err(e) => warn!(target: TARGET, thread_id = %ctx.thread_id, error = %e, "failed to encode thread context"),
        }
    }

    async fn durable_categories(&self, run_id: &str) -> BTreeSet<String> {
        match self.store.load_results(run_id).await {
            Ok(results) => results.into_iter().map(|r| r.agent_name).collect(),
            Err(e) => {
                warn!(target: TARGET, run_id, "failed to list durable results for thread context: {:#}", e);
                BTreeSet::new()
            }
        }
    }

    // --- 缓存访问：失败只记日志 ---

    /// 用新值覆盖缓存；写不进去就删除旧值，删也删不掉就记为 stale，
    /// 之后的读取绕过缓存直到覆盖成功
    async fn replace_cached(&self, key: &str, value: &[u8]) -> bool {
        if self.cache_set(key, value, self.state_ttl_secs).await {
            self.set_stale(key, false);
            return true;
        }
        let deleted = self.cache_delete(key).await;
        if !deleted {
            warn!(target: TARGET, key, "cache entry may be stale, reads bypass the cache");
        }
        self.set_stale(key, !deleted);
        false
    }

    async fn fresh_cache_get(&self, key: &str) -> Option<Vec<u8>> {
        if self.is_stale(key) {
            return None;
        }
        self.cache_get(key).await
    }

    fn stale_keys(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.stale.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_stale(&self, key: &str, stale: bool) {
        if stale {
            self.stale_keys().insert(key.to_string());
        } else {
            self.stale_keys().remove(key);
        }
    }

    fn is_stale(&self, key: &str) -> bool {
        self.stale_keys().contains(key)
    }

    async fn cache_get(&self, key: &str) -> Option<Vec<u8>> {
        match self.cache.get(key).await {
            Ok(hit) => hit,
            Err(e) => {
                warn!(target: TARGET, key, "cache read failed: {:#}", e);
                None
            }
        }
    }

    async fn cache_set(&self, key: &str, value: &[u8], ttl_secs: u64) -> bool {
        match self.cache.set(key, value, ttl_secs).await {
            Ok(()) => true,
            Err(e) => {
                warn!(target: TARGET, key, "cache write failed: {:#}", e);
                false
            }
        }
    }

    async fn cache_delete(&self, key: &str) -> bool {
        match self.cache.delete(key).await {
            Ok(()) => true,
            Err(e) => {
                warn!(target: TARGET, key, "cache delete failed: {:#}", e);
                false
            }
        }
    }
}
