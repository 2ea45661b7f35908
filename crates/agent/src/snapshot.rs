use crate::types::AgentRunState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tandem_core::{Clock, TandemError};
use uuid::Uuid;

/// 当前快照格式版本
///
/// * v1: 扁平 JSON (`step` / `request` / `phase` 与其它字段混在顶层)，没有版本字段
/// * v2: 显式信封 + 嵌套 `state`
pub const SNAPSHOT_FORMAT_VERSION: u32 = 2;

/// 缓存与持久层共用的状态快照信封
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub format_version: u32,
    pub snapshot_id: String,
    pub run_id: String,
    #[serde(default)]
    pub thread_id: String,
    #[serde(default)]
    pub user_id: String,
    pub saved_at: DateTime<Utc>,
    pub state: AgentRunState,
}

impl StateSnapshot {
    pub fn new(run_id: &str, thread_id: &str, user_id: &str, state: AgentRunState) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            snapshot_id: format!("snap_{}", Uuid::new_v4().simple()),
            run_id: run_id.to_string(),
            thread_id: thread_id.to_string(),
            user_id: user_id.to_string(),
            saved_at: Clock::now(),
            state,
        }
    }

    pub fn to_value(&self) -> Result<Value, TandemError> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn encode(&self) -> Result<Vec<u8>, TandemError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, TandemError> {
        let value: Value = serde_json::from_slice(bytes)?;
        Self::from_value(value)
    }

    /// 读取时的兼容性检查：旧版本迁移，新版本拒绝
    pub fn from_value(value: Value) -> Result<Self, TandemError> {
        let version = match value.get("format_version") {
            None => 1,
            Some(v) => v
                .as_u64()
                .and_then(|v| u32::try_from(v).ok())
                .ok_or_else(|| TandemError::InvalidData(format!("format_version is not a number: {}", v)))?,
        };

        match version {
            1 => migrate_v1(value),
            SNAPSHOT_FORMAT_VERSION => Ok(serde_json::from_value(value)?),
            found => Err(TandemError::UnsupportedFormat {
                found,
                supported: SNAPSHOT_FORMAT_VERSION,
            }),
        }
    }
}

/// v1 -> v2
///
/// 识别的顶层字段映射到新结构，其余字段全部放进 `state.metadata`。
fn migrate_v1(value: Value) -> Result<StateSnapshot, TandemError> {
    let Value::Object(mut fields) = value else {
        return Err(TandemError::InvalidData("legacy snapshot is not a JSON object".to_string()));
    };

    let step_count = match fields.remove("step") {
        None | Some(Value::Null) => 0,
        Some(v) => v
            .as_u64()
            .ok_or_else(|| TandemError::InvalidData(format!("legacy step is not a counter: {}", v)))?,
    };
    let user_request = take_string(&mut fields, "request");
    let phase = take_string(&mut fields, "phase");
    let run_id = take_string(&mut fields, "run_id").unwrap_or_default();
    let thread_id = take_string(&mut fields, "thread_id").unwrap_or_default();
    let user_id = take_string(&mut fields, "user_id").unwrap_or_default();
    let saved_at = take_string(&mut fields, "timestamp")
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(Clock::now);

    Ok(StateSnapshot {
        format_version: SNAPSHOT_FORMAT_VERSION,
        snapshot_id: "legacy".to_string(),
        run_id,
        thread_id,
        user_id,
        saved_at,
        state: AgentRunState {
            step_count,
            phase,
            user_request,
            metadata: fields.into_iter().collect(),
        },
    })
}

fn take_string(fields: &mut Map<String, Value>, key: &str) -> Option<String> {
    match fields.remove(key)? {
        Value::String(s) => Some(s),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}
