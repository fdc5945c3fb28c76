//! Cache key constants and builders for the Tariffa catalog cache
//!
//! # Key Patterns
//!
//! - `rate:{key}` - Rate definition by rate key
//! - `plan:{name}:{yyyymmdd}` - Plan version effective on a day
//! - `service:{name}:{yyyymmdd}` - Service version effective on a day
//!
//! # Example
//!
//! ```
//! use tariffa_cache::keys;
//!
//! assert_eq!(keys::rate_key("INTL"), "rate:INTL");
//! ```

use chrono::{DateTime, Utc};

/// Prefix for cached rates
pub const RATE_KEY_PREFIX: &str = "rate";

/// Prefix for cached plan versions
pub const PLAN_KEY_PREFIX: &str = "plan";

/// Prefix for cached service versions
pub const SERVICE_KEY_PREFIX: &str = "service";

/// Default TTL for rates (1 hour)
pub const RATE_TTL_SECS: u64 = 3600;

/// Default TTL for plans and services (15 minutes)
pub const PLAN_TTL_SECS: u64 = 900;

/// Build a cache key for a rate
#[inline]
pub fn rate_key(key: &str) -> String {
    format!("{}:{}", RATE_KEY_PREFIX, key)
}

/// Build a cache key for the plan version effective on the day of `at`
#[inline]
pub fn plan_key(name: &str, at: DateTime<Utc>) -> String {
    format!("{}:{}:{}", PLAN_KEY_PREFIX, name, at.format("%Y%m%d"))
}

/// Build a cache key for the service version effective on the day of `at`
#[inline]
pub fn service_key(name: &str, at: DateTime<Utc>) -> String {
    format!("{}:{}:{}", SERVICE_KEY_PREFIX, name, at.format("%Y%m%d"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_rate_key() {
        assert_eq!(rate_key("LOCAL"), "rate:LOCAL");
    }

    #[test]
    fn test_dated_keys() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 17, 45, 0).unwrap();
        assert_eq!(plan_key("GOLD", at), "plan:GOLD:20240309");
        assert_eq!(service_key("ROAMING", at), "service:ROAMING:20240309");
    }

    #[test]
    fn test_same_day_shares_key() {
        let morning = Utc.with_ymd_and_hms(2024, 3, 9, 0, 0, 1).unwrap();
        let night = Utc.with_ymd_and_hms(2024, 3, 9, 23, 59, 59).unwrap();
        assert_eq!(plan_key("GOLD", morning), plan_key("GOLD", night));
    }
}
