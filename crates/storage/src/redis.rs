use anyhow::{Context, Result};
use deadpool_redis::{Config, Pool, Runtime};
use redis::AsyncCommands;

/// 缓存写操作 (用于 MULTI/EXEC 批量提交)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheOp {
    Set {
        key: String,
        value: Vec<u8>,
        ttl_secs: Option<u64>,
    },
    Delete {
        key: String,
    },
}

#[derive(Clone)]
pub struct RedisService {
    pool: Pool,
}

impl RedisService {
    /// 初始化 Redis 连接池
    pub fn new(redis_url: &str) -> Result<Self> {
        let cfg = Config::from_url(redis_url);
        // 使用 Tokio 运行时创建连接池
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .context("Failed to create Redis pool")?;

        Ok(Self { pool })
    }

    async fn get_connection(&self) -> Result<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .context("Failed to get redis connection")
    }

    /// 连通性检查
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    /// 基础 Set 操作 (二进制安全)
    ///
    /// 带 TTL 时使用 `SET key value EX ttl`，保证写入与过期时间是原子的。
    pub async fn set_bytes(&self, key: &str, value: &[u8], expire_seconds: Option<u64>) -> Result<()> {
        let mut conn = self.get_connection().await?;

        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(seconds) = expire_seconds {
            cmd.arg("EX").arg(seconds);
        }
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    /// 基础 Get 操作 (二进制安全)
    pub async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.get_connection().await?;
        let result: Option<Vec<u8>> = conn.get(key).await?;
        Ok(result)
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let _: () = conn.del(key).await?;
        Ok(())
    }

    /// 【核心功能】以 MULTI/EXEC 原子地执行一批写操作
    ///
    /// 要么全部生效，要么 (连接失败时) 全部不生效。
    pub async fn exec_atomic(&self, ops: &[CacheOp]) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut conn = self.get_connection().await?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in ops {
            match op {
                CacheOp::Set {
                    key,
                    value,
                    ttl_secs,
                } => {
                    let cmd = pipe.cmd("SET").arg(key).arg(value.as_slice());
                    if let Some(seconds) = ttl_secs {
                        cmd.arg("EX").arg(*seconds);
                    }
                    cmd.ignore();
                }
                CacheOp::Delete { key } => {
                    pipe.cmd("DEL").arg(key).ignore();
                }
            }
        }

        let _: () = pipe
            .query_async(&mut conn)
            .await
            .context(format!("Failed to execute MULTI/EXEC with {} ops", ops.len()))?;
        Ok(())
    }
}
