use super::RunStore;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tandem_core::SubAgentResult;
use tokio::fs;

/// 本地 JSON 文件持久层 (开发环境)
///
/// 目录布局:
/// ```text
/// {root}/{run_id}/state.json
/// {root}/{run_id}/results/{agent_name}.json
/// ```
pub struct LocalFileRunStore {
    root_dir: PathBuf,
}

impl LocalFileRunStore {
    /// 初始化存储，如果目录不存在则创建
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let root_dir = path.into();
        // 同步创建目录（仅在程序启动时执行一次，可接受同步）
        if !root_dir.exists() {
            std::fs::create_dir_all(&root_dir).with_context(|| {
                format!("Failed to create local run store directory {}", root_dir.display())
            })?;
        }
        Ok(Self { root_dir })
    }

    fn run_dir(&self, run_id: &str) -> Result<PathBuf> {
        ensure_path_segment(run_id)?;
        Ok(self.root_dir.join(run_id))
    }

    fn result_path(&self, run_id: &str, agent_name: &str) -> Result<PathBuf> {
        ensure_path_segment(agent_name)?;
        Ok(self
            .run_dir(run_id)?
            .join("results")
            .join(format!("{}.json", agent_name)))
    }
}

/// run_id / agent_name 直接作为路径片段，不能跳出根目录
fn ensure_path_segment(name: &str) -> Result<()> {
    tandem_core::ensure_not_empty!(name, "Path segment must not be empty");
    tandem_core::ensure_that!(
        name != "." && name != ".." && !name.contains(['/', '\\']),
        "Invalid path segment: {}",
        name
    );
    Ok(())
}

async fn write_json(path: &Path, value: &impl serde::Serialize) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    // 序列化 (Pretty Print 方便人工调试)
    let content = serde_json::to_string_pretty(value)?;

    // 先写临时文件再 rename，避免读到写了一半的文件
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, content).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !fs::try_exists(path).await? {
        return Ok(None);
    }
    let content = fs::read_to_string(path).await?;
    let value = serde_json::from_str(&content)
        .with_context(|| format!("Corrupted file {}", path.display()))?;
    Ok(Some(value))
}

#[async_trait]
impl RunStore for LocalFileRunStore {
    async fn load_state(&self, run_id: &str) -> Result<Option<Value>> {
        read_json(&self.run_dir(run_id)?.join("state.json")).await
    }

    async fn save_state(&self, run_id: &str, snapshot: &Value) -> Result<()> {
        write_json(&self.run_dir(run_id)?.join("state.json"), snapshot).await
    }

    async fn save_result(&self, result: &SubAgentResult) -> Result<()> {
        write_json(&self.result_path(&result.run_id, &result.agent_name)?, result).await
    }

    async fn load_result(&self, run_id: &str, agent_name: &str) -> Result<Option<SubAgentResult>> {
        read_json(&self.result_path(run_id, agent_name)?).await
    }

    async fn load_results(&self, run_id: &str) -> Result<Vec<SubAgentResult>> {
        let dir = self.run_dir(run_id)?.join("results");
        if !fs::try_exists(&dir).await? {
            return Ok(Vec::new());
        }

        let mut results = Vec::new();
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(result) = read_json::<SubAgentResult>(&path).await? {
                results.push(result);
            }
        }
        results.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(results)
    }
}
