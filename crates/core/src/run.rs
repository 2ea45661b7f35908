use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;

/// 子 Agent 产出实体 (Sub-Agent Result)
///
/// 对应数据库表: `agent_results`，主键 (run_id, agent_name)
///
/// 一次运行中的某个执行阶段 (如 "triage", "data_analysis") 产出的结构化结果。
/// 同一个 (run_id, agent_name) 重复写入时覆盖，不追加。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct SubAgentResult {
    /// 所属运行 ID
    pub run_id: String,

    /// 产出该结果的 Agent 名称
    /// 示例: "triage", "data_analysis", "optimization"
    pub agent_name: String,

    /// 结果内容 (任意 JSON)
    /// 数据库存储: JSONB
    pub payload: Value,

    /// 写入时间
    pub created_at: DateTime<Utc>,
}

impl SubAgentResult {
    pub fn new(run_id: &str, agent_name: &str, payload: Value) -> Self {
        Self {
            run_id: run_id.to_string(),
            agent_name: agent_name.to_string(),
            payload,
            created_at: Utc::now(),
        }
    }
}
