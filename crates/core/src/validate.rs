pub mod validate {
    /// 核心校验宏：如果条件为假，则返回格式化的错误信息
    #[macro_export]
    macro_rules! ensure_that {
        ($cond:expr, $($arg:tt)+) => {
            if !($cond) {
                return Err(::anyhow::anyhow!($($arg)+));
            }
        };
    }

    /// 校验字符串、Vec、HashMap 等集合不为空
    #[macro_export]
    macro_rules! ensure_not_empty {
        ($container:expr, $($arg:tt)+) => {
            if $container.is_empty() {
                return Err(::anyhow::anyhow!($($arg)+));
            }
        };
    }

    /// 校验数值在范围内 (包含边界 [min, max])
    #[macro_export]
    macro_rules! ensure_range {
        ($val:expr, $min:expr, $max:expr, $($arg:tt)+) => {
            if $val < $min || $val > $max {
                return Err(::anyhow::anyhow!($($arg)+));
            }
        };
    }
}

/// 校验 SQL 标识符 (表名 / 列名)
///
/// 只允许字母、数字、下划线和 `.`，防止拼接 SQL 时注入。
pub fn validate_identifier(name: &str) -> anyhow::Result<()> {
    crate::ensure_not_empty!(name, "SQL identifier must not be empty");
    crate::ensure_that!(
        name.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.'),
        "Invalid SQL identifier: {}",
        name
    );
    crate::ensure_that!(
        !name.starts_with(|c: char| c.is_ascii_digit()),
        "SQL identifier must not start with a digit: {}",
        name
    );
    Ok(())
}
