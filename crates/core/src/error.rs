use thiserror::Error;

/// 统一的基础设施错误定义
/// 使用 `thiserror` 宏自动生成 Display 和 Error trait
#[derive(Error, Debug)]
pub enum TandemError {
    // =================================================================
    // 1. 系统与配置类 (System & Config)
    // =================================================================
    #[error("Configuration error: {0}")]
    ConfigError(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unknown internal error: {0}")]
    InternalError(String),

    // =================================================================
    // 2. 数据与解析类 (Data & Serialization)
    // =================================================================
    #[error("Failed to serialize/deserialize data: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Invalid data format: {0}")]
    InvalidData(String),

    /// 快照格式版本比当前程序支持的更新，拒绝解析以免破坏数据
    #[error("Unsupported snapshot format version {found} (supported up to {supported})")]
    UnsupportedFormat { found: u32, supported: u32 },

    // =================================================================
    // 3. 基础设施类 (Infrastructure)
    // =================================================================
    #[error("Database storage error: {0}")]
    StorageError(#[from] sqlx::Error),

    #[error("Redis storage error: {0}")]
    RedisError(#[from] redis::RedisError),

    #[error("ClickHouse error: {0}")]
    ClickHouseError(String),
}

impl From<std::io::Error> for TandemError {
    fn from(err: std::io::Error) -> Self {
        TandemError::InternalError(err.to_string())
    }
}
