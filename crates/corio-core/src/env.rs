//! Environment variable utilities
//!
//! ```ignore
//! use corio_core::env::{env_get, env_get_bool};
//!
//! let pool: usize = env_get("COR_POOL_SIZE", 1000);
//! let hook = env_get_bool("COR_HOOK", true);
//! ```

use std::str::FromStr;

/// Get environment variable parsed as `T`, or return `default`.
///
/// Unset and unparsable values both fall back to the default.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Get environment variable as boolean.
///
/// "1", "true", "yes", "on" are true and "0", "false", "no", "off" are
/// false (case-insensitive). Anything else, including unset, returns the
/// default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => match val.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

/// Get environment variable as optional value
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default() {
        let val: usize = env_get("__COR_TEST_NONEXISTENT__", 42);
        assert_eq!(val, 42);
    }

    #[test]
    fn test_env_get_set() {
        std::env::set_var("__COR_TEST_USIZE__", " 123 ");
        let val: usize = env_get("__COR_TEST_USIZE__", 0);
        assert_eq!(val, 123);
        std::env::remove_var("__COR_TEST_USIZE__");
    }

    #[test]
    fn test_env_get_invalid() {
        std::env::set_var("__COR_TEST_INVALID__", "not_a_number");
        let val: usize = env_get("__COR_TEST_INVALID__", 99);
        assert_eq!(val, 99);
        std::env::remove_var("__COR_TEST_INVALID__");
    }

    #[test]
    fn test_env_get_bool() {
        std::env::set_var("__COR_TEST_BOOL_ON__", "Yes");
        assert!(env_get_bool("__COR_TEST_BOOL_ON__", false));
        std::env::remove_var("__COR_TEST_BOOL_ON__");

        std::env::set_var("__COR_TEST_BOOL_OFF__", "off");
        assert!(!env_get_bool("__COR_TEST_BOOL_OFF__", true));
        std::env::remove_var("__COR_TEST_BOOL_OFF__");

        std::env::set_var("__COR_TEST_BOOL_JUNK__", "maybe");
        assert!(env_get_bool("__COR_TEST_BOOL_JUNK__", true));
        std::env::remove_var("__COR_TEST_BOOL_JUNK__");
    }

    #[test]
    fn test_env_get_opt() {
        let val: Option<u64> = env_get_opt("__COR_TEST_OPT_NONE__");
        assert_eq!(val, None);
    }
}
