//! Per-call reply timeout.
//!
//! This module provides a validated timeout type so no call can wait forever.

use std::time::Duration;

use crate::config::{ConfigError, ConfigResult};

/// How long a call waits for its reply, publish included.
///
/// # Valid Range
///
/// - Minimum: 1 millisecond (zero would time out before publishing)
/// - Maximum: 300 seconds
/// - Default: 5 seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallTimeout(Duration);

impl CallTimeout {
    /// Default timeout: 5 seconds
    pub const DEFAULT_MILLIS: u64 = 5_000;

    /// Maximum valid timeout: 300 seconds
    pub const MAX_SECS: u64 = 300;

    /// Create a new CallTimeout with validation.
    pub fn new(duration: Duration) -> ConfigResult<Self> {
        if duration.is_zero() {
            return Err(ConfigError::Invalid(
                "call timeout must be greater than zero".to_string(),
            ));
        }
        if duration > Duration::from_secs(Self::MAX_SECS) {
            return Err(ConfigError::Invalid(format!(
                "call timeout must be at most {}s, got {:?}",
                Self::MAX_SECS,
                duration
            )));
        }
        Ok(Self(duration))
    }

    pub fn from_millis(millis: u64) -> ConfigResult<Self> {
        Self::new(Duration::from_millis(millis))
    }

    pub fn as_duration(&self) -> Duration {
        self.0
    }
}

impl Default for CallTimeout {
    fn default() -> Self {
        Self(Duration::from_millis(Self::DEFAULT_MILLIS))
    }
}

impl From<CallTimeout> for Duration {
    fn from(timeout: CallTimeout) -> Self {
        timeout.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_five_seconds() {
        assert_eq!(CallTimeout::default().as_duration(), Duration::from_secs(5));
    }

    #[test]
    fn rejects_zero_and_out_of_range() {
        assert!(CallTimeout::new(Duration::ZERO).is_err());
        assert!(CallTimeout::new(Duration::from_secs(301)).is_err());
        assert!(CallTimeout::new(Duration::from_millis(300_001)).is_err());
    }

    #[test]
    fn rejection_names_the_limit_once() {
        let err = CallTimeout::from_millis(0).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid configuration: call timeout must be greater than zero"
        );
    }

    #[test]
    fn accepts_boundaries() {
        assert!(CallTimeout::from_millis(1).is_ok());
        assert!(CallTimeout::new(Duration::from_secs(300)).is_ok());
    }
}
