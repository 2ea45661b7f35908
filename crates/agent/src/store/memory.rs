use super::{RunStore, StateCache};
use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tandem_core::{Clock, SubAgentResult};

/// 进程内缓存 (未配置 Redis 时使用，也用于测试)
///
/// 支持 TTL，并可模拟缓存不可用 / 淘汰。
#[derive(Default)]
pub struct MemoryCache {
    /// key -> (value, 过期时间戳 ms)
    entries: Mutex<HashMap<String, (Vec<u8>, i64)>>,
    unavailable: AtomicBool,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// 模拟缓存宕机：之后所有操作都返回错误
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// 模拟淘汰某个 key
    pub fn evict(&self, key: &str) -> bool {
        self.lock().remove(key).is_some()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// 当前未过期的条目数
    pub fn len(&self) -> usize {
        let now = Clock::now_ms();
        self.lock().values().filter(|(_, exp)| *exp > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 剩余 TTL (秒)，不存在或已过期时为 None
    pub fn ttl_of(&self, key: &str) -> Option<u64> {
        let now = Clock::now_ms();
        self.lock()
            .get(key)
            .filter(|(_, exp)| *exp > now)
            .map(|(_, exp)| ((exp - now) / 1000) as u64)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, (Vec<u8>, i64)>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            bail!("cache unavailable");
        }
        Ok(())
    }
}

#[async_trait]
impl StateCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check_available()?;
        let now = Clock::now_ms();
        let mut entries = self.lock();
        match entries.get(key) {
            Some((value, exp)) if *exp > now => Ok(Some(value.clone())),
            Some(_) => {
                // 惰性清理过期条目
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl_secs: u64) -> Result<()> {
        self.check_available()?;
        self.lock()
            .insert(key.to_string(), (value.to_vec(), Clock::expires_at_ms(ttl_secs)));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check_available()?;
        self.lock().remove(key);
        Ok(())
    }
}

/// 进程内持久层 (测试用)
#[derive(Default)]
pub struct MemoryRunStore {
    states: Mutex<HashMap<String, Value>>,
    results: Mutex<BTreeMap<(String, String), SubAgentResult>>,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 模拟持久层写入失败
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// 模拟持久层读取失败
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// 直接写入原始文档 (用于模拟旧版本数据)
    pub fn insert_raw_state(&self, run_id: &str, doc: Value) {
        self.states
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(run_id.to_string(), doc);
    }

    pub fn raw_state(&self, run_id: &str) -> Option<Value> {
        self.states
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(run_id)
            .cloned()
    }

    fn check_write(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("durable store rejected the write");
        }
        Ok(())
    }

    fn check_read(&self) -> Result<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            bail!("durable store unreachable");
        }
        Ok(())
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn load_state(&self, run_id: &str) -> Result<Option<Value>> {
        self.check_read()?;
        Ok(self.raw_state(run_id))
    }

    async fn save_state(&self, run_id: &str, snapshot: &Value) -> Result<()> {
        self.check_write()?;
        self.insert_raw_state(run_id, snapshot.clone());
        Ok(())
    }

    async fn save_result(&self, result: &SubAgentResult) -> Result<()> {
        self.check_write()?;
        self.results
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert((result.run_id.clone(), result.agent_name.clone()), result.clone());
        Ok(())
    }

    async fn load_result(&self, run_id: &str, agent_name: &str) -> Result<Option<SubAgentResult>> {
        self.check_read()?;
        Ok(self
            .results
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&(run_id.to_string(), agent_name.to_string()))
            .cloned())
    }

    async fn load_results(&self, run_id: &str) -> Result<Vec<SubAgentResult>> {
        self.check_read()?;
        let mut results: Vec<_> = self
            .results
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .filter(|r| r.run_id == run_id)
            .cloned()
            .collect();
        results.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(results)
    }
}
