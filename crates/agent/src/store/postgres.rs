use super::RunStore;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tandem_core::SubAgentResult;
use tandem_storage::RunRepository;

/// 状态快照在 `runs.metadata` 中的字段名
pub const STATE_FIELD: &str = "agent_state";

/// PostgreSQL 持久层
///
/// 状态镜像到运行记录的 `metadata.agent_state`，子 Agent 结果写入 `agent_results` 表。
#[derive(Clone)]
pub struct PgRunStore {
    repo: RunRepository,
}

impl PgRunStore {
    pub fn new(repo: RunRepository) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl RunStore for PgRunStore {
    async fn load_state(&self, run_id: &str) -> Result<Option<Value>> {
        self.repo.find_metadata_field(run_id, STATE_FIELD).await
    }

    async fn save_state(&self, run_id: &str, snapshot: &Value) -> Result<()> {
        self.repo.set_metadata_field(run_id, STATE_FIELD, snapshot).await
    }

    async fn save_result(&self, result: &SubAgentResult) -> Result<()> {
        self.repo.upsert_result(result).await?;
        Ok(())
    }

    async fn load_result(&self, run_id: &str, agent_name: &str) -> Result<Option<SubAgentResult>> {
        self.repo.find_result(run_id, agent_name).await
    }

    async fn load_results(&self, run_id: &str) -> Result<Vec<SubAgentResult>> {
        self.repo.find_results_by_run(run_id).await
    }
}
