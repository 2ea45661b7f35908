use anyhow::{Context, Result};
use reqwest::Client;
use std::time::Duration;
use tandem_core::{ClickHouseSettings, TandemError};
use tracing::debug;

/// ClickHouse HTTP 客户端
///
/// 只用到两类操作：执行写语句 (INSERT / ALTER) 和读取单个计数值。
/// ClickHouse 没有跨语句事务，原子性由调用方 (列存参与者) 通过“先缓冲、提交时再发送”保证。
#[derive(Clone)]
pub struct ClickHouseClient {
    http: Client,
    url: String,
    database: String,
    user: String,
    password: String,
}

impl ClickHouseClient {
    pub fn new(settings: &ClickHouseSettings) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build ClickHouse HTTP client")?;

        Ok(Self {
            http,
            url: settings.url.trim_end_matches('/').to_string(),
            database: settings.database.clone(),
            user: settings.user.clone(),
            password: settings.password.clone(),
        })
    }

    async fn post(&self, sql: &str) -> Result<String> {
        debug!(database = %self.database, "clickhouse <- {}", sql);

        let response = self
            .http
            .post(&self.url)
            .query(&[("database", self.database.as_str())])
            .header("X-ClickHouse-User", &self.user)
            .header("X-ClickHouse-Key", &self.password)
            .body(sql.to_string())
            .send()
            .await
            .context("ClickHouse request failed")?;

        let status = response.status();
        let body = response
            .text()
            .await
            .context("Failed to read ClickHouse response body")?;

        if !status.is_success() {
            return Err(TandemError::ClickHouseError(format!("HTTP {}: {}", status, body.trim())).into());
        }
        Ok(body)
    }

    /// 连通性检查
    pub async fn ping(&self) -> Result<()> {
        let body = self.post("SELECT 1").await?;
        if body.trim() != "1" {
            return Err(TandemError::ClickHouseError(format!("Unexpected ping response: {}", body.trim())).into());
        }
        Ok(())
    }

    /// 执行一条写语句
    pub async fn execute(&self, sql: &str) -> Result<()> {
        self.post(sql).await?;
        Ok(())
    }

    /// 执行返回单个无符号整数的查询 (e.g. `SELECT count() FROM ...`)
    pub async fn query_u64(&self, sql: &str) -> Result<u64> {
        let body = self.post(&format!("{} FORMAT TabSeparated", sql)).await?;
        parse_scalar_u64(&body)
    }
}

/// 解析 TabSeparated 格式的单值结果
pub fn parse_scalar_u64(body: &str) -> Result<u64> {
    let text = body.trim();
    text.parse::<u64>()
        .map_err(|_| TandemError::ClickHouseError(format!("Expected a single integer, got '{}'", text)).into())
}

/// 转义字符串字面量 (单引号与反斜杠)
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_scalar_u64() {
        assert_eq!(parse_scalar_u64("42\n").unwrap(), 42);
        assert!(parse_scalar_u64("").is_err());
        assert!(parse_scalar_u64("1\t2\n").is_err());
    }

    #[test]
    fn test_quote_literal() {
        assert_eq!(quote_literal("abc"), "'abc'");
        assert_eq!(quote_literal("o'neil"), "'o\\'neil'");
        assert_eq!(quote_literal("a\\b"), "'a\\\\b'");
    }
}
