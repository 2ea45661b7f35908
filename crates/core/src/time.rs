use chrono::{DateTime, Utc};

pub struct Clock;

impl Clock {
    /// 获取当前时间戳 (毫秒)
    #[inline]
    pub fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    /// 获取当前 UTC 时间对象
    pub fn now() -> DateTime<Utc> {
        Utc::now()
    }

    /// 时间戳 (ms) -> DateTime<Utc>
    pub fn from_timestamp_ms(ms: i64) -> DateTime<Utc> {
        let seconds = ms.div_euclid(1000);
        let nsecs = (ms.rem_euclid(1000) * 1_000_000) as u32;
        // from_timestamp 防止溢出，失败时退回 UNIX_EPOCH
        DateTime::from_timestamp(seconds, nsecs).unwrap_or_default()
    }

    /// 从现在起 `ttl_secs` 秒后的过期时间戳 (ms)
    pub fn expires_at_ms(ttl_secs: u64) -> i64 {
        Self::now_ms().saturating_add((ttl_secs as i64).saturating_mul(1000))
    }
}

// =========================================================================
// 单元测试
// =========================================================================
