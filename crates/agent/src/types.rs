use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tandem_core::SubAgentResult;

/// 1. 运行状态：一次 Agent 运行的执行上下文快照
///
/// 每次 checkpoint 整体覆盖，只保留当前版本。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentRunState {
    /// 已完成的步数
    pub step_count: u64,

    /// 当前阶段标记
    /// e.g. "triage", "data_analysis"
    #[serde(default)]
    pub phase: Option<String>,

    /// 最近一次用户请求
    #[serde(default)]
    pub user_request: Option<String>,

    /// 任意键值元数据 (BTreeMap 保证序列化顺序稳定)
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl AgentRunState {
    pub fn new(user_request: impl Into<String>) -> Self {
        Self {
            user_request: Some(user_request.into()),
            ..Self::default()
        }
    }

    /// 进入下一步，并标记所处阶段
    pub fn advance(&mut self, phase: impl Into<String>) {
        self.step_count += 1;
        self.phase = Some(phase.into());
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// 2. 线程上下文：比完整状态更粗粒度的缓存条目
///
/// 供 UI / 进度查询使用，不需要反序列化完整状态。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadContext {
    pub thread_id: String,
    pub run_id: String,
    pub user_id: String,
    pub last_step: u64,
    #[serde(default)]
    pub phase: Option<String>,
    /// 已产出结果的类别 (子 Agent 名称)
    #[serde(default)]
    pub result_categories: BTreeSet<String>,
    pub updated_at: DateTime<Utc>,
}

/// 3. 保存结果
///
/// `success = false` 表示本次 checkpoint 丢失，调用方继续运行即可。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveOutcome {
    pub success: bool,
    pub snapshot_id: String,
}

/// 4. 恢复点：中断的运行从这里继续，跳过已完成的阶段
#[derive(Debug, Clone, PartialEq)]
pub struct ResumePoint {
    pub run_id: String,
    pub state: Option<AgentRunState>,
    /// 已完成阶段的产出 (按流水线顺序)
    pub completed: Vec<SubAgentResult>,
    /// 尚未产出结果的阶段
    pub pending: Vec<String>,
}

impl ResumePoint {
    pub fn is_finished(&self) -> bool {
        self.pending.is_empty()
    }

    /// 下一个需要执行的阶段
    pub fn next_phase(&self) -> Option<&str> {
        self.pending.first().map(String::as_str)
    }
}
