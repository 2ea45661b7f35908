pub mod clickhouse;
pub mod postgres;
pub mod redis;

pub use self::clickhouse::{ClickHouseRecordCounter, ClickHouseSession, ClickHouseStore};
pub use self::postgres::{PgRecordCounter, PgSession, PgStore};
pub use self::redis::{RedisSession, RedisStore};
