//! Typed lookups for environment-driven configuration.
//!
//! Unset or blank variables fall back to the caller's default; values that are present but
//! malformed are reported instead of silently ignored.
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use crate::error::CommonError;

/// Returns the trimmed value of `var`, or `None` when it is unset or blank.
pub fn string(var: &str) -> Option<String> {
    std::env::var(var)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn parse<T>(var: &str) -> Result<Option<T>, CommonError>
where
    T: FromStr,
    T::Err: Display,
{
    let Some(raw) = string(var) else {
        return Ok(None);
    };
    raw.parse::<T>()
        .map(Some)
        .map_err(|e| CommonError::InvalidEnv {
            var: var.to_string(),
            value: raw.clone(),
            reason: e.to_string(),
        })
}

pub fn parse_or<T>(var: &str, default: T) -> Result<T, CommonError>
where
    T: FromStr,
    T::Err: Display,
{
    Ok(parse(var)?.unwrap_or(default))
}

pub fn secs_or(var: &str, default_secs: u64) -> Result<Duration, CommonError> {
    parse_or(var, default_secs).map(Duration::from_secs)
}

pub fn millis_or(var: &str, default_ms: u64) -> Result<Duration, CommonError> {
    parse_or(var, default_ms).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_values_fall_back_to_default() {
        std::env::set_var("RFP_COMMON_TEST_BLANK", "   ");
        assert_eq!(parse_or("RFP_COMMON_TEST_BLANK", 7u32).unwrap(), 7);
        assert_eq!(string("RFP_COMMON_TEST_BLANK"), None);
    }

    #[test]
    fn malformed_values_are_reported() {
        std::env::set_var("RFP_COMMON_TEST_BAD", "ten");
        let err = parse::<u32>("RFP_COMMON_TEST_BAD").unwrap_err();
        assert!(matches!(err, CommonError::InvalidEnv { ref var, .. } if var == "RFP_COMMON_TEST_BAD"));
    }

    #[test]
    fn durations_use_their_unit() {
        std::env::set_var("RFP_COMMON_TEST_SECS", "3");
        std::env::set_var("RFP_COMMON_TEST_MS", "250");
        assert_eq!(secs_or("RFP_COMMON_TEST_SECS", 1).unwrap(), Duration::from_secs(3));
        assert_eq!(millis_or("RFP_COMMON_TEST_MS", 1).unwrap(), Duration::from_millis(250));
        assert_eq!(millis_or("RFP_COMMON_TEST_UNSET", 9).unwrap(), Duration::from_millis(9));
    }
}
