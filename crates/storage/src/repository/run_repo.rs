use anyhow::{bail, Result};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::PgPool;
use tandem_core::SubAgentResult;

/// 运行记录仓储层
///
/// `runs` 表由 CRUD 层维护，这里只读写其中的 `metadata` (JSONB) 字段：
///
/// ```sql
/// CREATE TABLE runs (
///     id         TEXT PRIMARY KEY,
///     metadata   JSONB NOT NULL DEFAULT '{}'::jsonb,
///     ...
/// );
///
/// CREATE TABLE agent_results (
///     run_id     TEXT NOT NULL,
///     agent_name TEXT NOT NULL,
///     payload    JSONB NOT NULL,
///     created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
///     PRIMARY KEY (run_id, agent_name)
/// );
/// ```
#[derive(Clone)]
pub struct RunRepository {
    pool: PgPool,
}

impl RunRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    // =========================================================================
    // 1. Run metadata
    // =========================================================================

    /// 读取 `metadata` 中的某个顶层字段
    ///
    /// * `Ok(None)` - 运行记录不存在，或字段不存在
    pub async fn find_metadata_field(&self, run_id: &str, field: &str) -> Result<Option<Value>> {
        let value: Option<Option<Value>> = sqlx::query_scalar(
            r#"
            SELECT metadata -> $2
            FROM runs
            WHERE id = $1
            "#,
        )
        .bind(run_id)
        .bind(field)
        .fetch_optional(&self.pool)
        .await?;

        Ok(value.flatten())
    }

    /// 覆盖 `metadata` 中的某个顶层字段，其它字段保持不变
    ///
    /// 运行记录不存在时返回错误 (运行记录的创建归 CRUD 层负责)。
    pub async fn set_metadata_field(&self, run_id: &str, field: &str, value: &Value) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE runs
            SET metadata = jsonb_set(COALESCE(metadata, '{}'::jsonb), ARRAY[$2], $3, true)
            WHERE id = $1
            "#,
        )
        .bind(run_id)
        .bind(field)
        .bind(Json(value))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            bail!("Run record not found: {}", run_id);
        }
        Ok(())
    }

    // =========================================================================
    // 2. Sub-agent artifacts
    // =========================================================================

    /// 写入子 Agent 结果 (Upsert，同一 (run_id, agent_name) 覆盖)
    pub async fn upsert_result(&self, result: &SubAgentResult) -> Result<u64> {
        let done = sqlx::query(
            r#"
            INSERT INTO agent_results (run_id, agent_name, payload, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (run_id, agent_name) DO UPDATE
            SET payload = EXCLUDED.payload,
                created_at = EXCLUDED.created_at
            "#,
        )
        .bind(&result.run_id)
        .bind(&result.agent_name)
        .bind(Json(&result.payload))
        .bind(result.created_at)
        .execute(&self.pool)
        .await?;

        Ok(done.rows_affected())
    }

    pub async fn find_result(&self, run_id: &str, agent_name: &str) -> Result<Option<SubAgentResult>> {
        let result = sqlx::query_as::<_, SubAgentResult>(
            r#"
            SELECT run_id, agent_name, payload, created_at
            FROM agent_results
            WHERE run_id = $1 AND agent_name = $2
            "#,
        )
        .bind(run_id)
        .bind(agent_name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(result)
    }

    /// 查询某次运行的全部子 Agent 结果
    pub async fn find_results_by_run(&self, run_id: &str) -> Result<Vec<SubAgentResult>> {
        let results = sqlx::query_as::<_, SubAgentResult>(
            r#"
            SELECT run_id, agent_name, payload, created_at
            FROM agent_results
            WHERE run_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(results)
    }
}
