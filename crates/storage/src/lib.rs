// 声明子模块
pub mod clickhouse;
pub mod db;
pub mod redis;
pub mod repository;

pub use self::clickhouse::ClickHouseClient;
pub use self::redis::{CacheOp, RedisService};
pub use repository::RunRepository;
