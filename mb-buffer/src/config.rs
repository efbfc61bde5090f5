use crate::error::{Result, SchedulerError};
use std::time::Duration;

pub const DEFAULT_INITIAL_TIMEOUT_SECONDS: u64 = 30;
pub const DEFAULT_INTER_MESSAGE_TIMEOUT_SECONDS: u64 = 15;
pub const DEFAULT_POLL_GRANULARITY_SECONDS: u64 = 1;

/// Timing policy of a [`CoalescingScheduler`](crate::CoalescingScheduler).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Hard cap, measured from the most recent accepted message.
    pub initial_timeout: Duration,
    /// Quiet period after the last message that completes a burst.
    pub inter_message_timeout: Duration,
    /// Tick of the per-user wait loop.
    pub poll_granularity: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from_seconds(
            DEFAULT_INITIAL_TIMEOUT_SECONDS,
            DEFAULT_INTER_MESSAGE_TIMEOUT_SECONDS,
            DEFAULT_POLL_GRANULARITY_SECONDS,
        )
    }
}

impl SchedulerConfig {
    pub fn from_seconds(initial: u64, inter_message: u64, poll_granularity: u64) -> Self {
        Self {
            initial_timeout: Duration::from_secs(initial),
            inter_message_timeout: Duration::from_secs(inter_message),
            poll_granularity: Duration::from_secs(poll_granularity),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.initial_timeout.is_zero() {
            return Err(SchedulerError::InvalidInput(
                "initial timeout must be > 0".to_string(),
            ));
        }
        if self.inter_message_timeout.is_zero() {
            return Err(SchedulerError::InvalidInput(
                "inter-message timeout must be > 0".to_string(),
            ));
        }
        if self.poll_granularity.is_zero() {
            return Err(SchedulerError::InvalidInput(
                "poll granularity must be > 0".to_string(),
            ));
        }
        if self.poll_granularity > self.initial_timeout {
            return Err(SchedulerError::InvalidInput(format!(
                "poll granularity ({:?}) must not exceed the initial timeout ({:?})",
                self.poll_granularity, self.initial_timeout
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_policy() {
        let cfg = SchedulerConfig::default();
        assert_eq!(cfg.initial_timeout, Duration::from_secs(30));
        assert_eq!(cfg.inter_message_timeout, Duration::from_secs(15));
        assert_eq!(cfg.poll_granularity, Duration::from_secs(1));
        cfg.validate().expect("defaults are valid");
    }

    #[test]
    fn validate_rejects_zero_and_oversized_tick() {
        assert!(SchedulerConfig::from_seconds(0, 15, 1).validate().is_err());
        assert!(SchedulerConfig::from_seconds(30, 0, 1).validate().is_err());
        assert!(SchedulerConfig::from_seconds(30, 15, 0).validate().is_err());
        let err = SchedulerConfig::from_seconds(5, 15, 10)
            .validate()
            .expect_err("tick larger than cap");
        assert!(err.to_string().contains("poll granularity"));
    }
}
