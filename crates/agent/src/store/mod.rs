pub mod local;
pub mod memory;
pub mod postgres;
pub mod redis;

pub use local::LocalFileRunStore;
pub use memory::{MemoryCache, MemoryRunStore};
pub use postgres::PgRunStore;
pub use self::redis::RedisStateCache;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tandem_core::SubAgentResult;

/// 快速缓存接口
///
/// 缓存是共享的外部资源，其它进程也可能读写相同的 key；
/// 持久化引擎只把它当作可丢弃、可从持久层重建的副本。
/// 不假设任何事务保证。
#[async_trait]
pub trait StateCache: Send + Sync {
    /// * `Ok(None)` - 未命中 (不是错误)
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: &[u8], ttl_secs: u64) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;
}

/// 运行记录持久层接口 (唯一可信来源)
///
/// 状态快照以 JSON 文档的形式存取，版本兼容检查由上层负责。
#[async_trait]
pub trait RunStore: Send + Sync {
    /// 读取运行的状态快照
    ///
    /// # 返回
    /// * `Ok(Some(doc))` - 找到记录
    /// * `Ok(None)` - 运行不存在，或从未 checkpoint
    /// * `Err(e)` - 读取过程出错
    async fn load_state(&self, run_id: &str) -> Result<Option<Value>>;

    /// 覆盖运行的状态快照
    async fn save_state(&self, run_id: &str, snapshot: &Value) -> Result<()>;

    /// 写入子 Agent 结果，同一 (run_id, agent_name) 覆盖
    async fn save_result(&self, result: &SubAgentResult) -> Result<()>;

    async fn load_result(&self, run_id: &str, agent_name: &str) -> Result<Option<SubAgentResult>>;

    /// 某次运行已产出的全部子 Agent 结果
    async fn load_results(&self, run_id: &str) -> Result<Vec<SubAgentResult>>;
}
