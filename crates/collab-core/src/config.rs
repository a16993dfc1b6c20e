//! Session configuration: save debounce, typing timeout and reconnect policy.
//!
//! `validate` rejects settings that would spin or never back off.

use crate::transport::ReconnectConfig;
use std::time::Duration;

/// Timing configuration for a document session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Quiet period after the last local edit before a snapshot is written
    pub save_debounce: Duration,
    /// Inactivity after which the local typing flag resets
    pub typing_timeout: Duration,
    /// Transport reconnect policy
    pub reconnect: ReconnectConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            save_debounce: Duration::from_millis(400),
            typing_timeout: Duration::from_millis(1500),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Reject settings that would spin or never fire.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reconnect.initial_delay.is_zero() {
            return Err(ConfigError::ZeroReconnectDelay);
        }
        if self.reconnect.backoff_factor < 1.0 {
            return Err(ConfigError::ShrinkingBackoff(self.reconnect.backoff_factor));
        }
        if self.typing_timeout.is_zero() {
            return Err(ConfigError::ZeroTypingTimeout);
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Reconnect initial delay must be greater than zero")]
    ZeroReconnectDelay,

    #[error("Backoff factor must be at least 1.0, got {0}")]
    ShrinkingBackoff(f64),

    #[error("Typing timeout must be greater than zero")]
    ZeroTypingTimeout,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.save_debounce, Duration::from_millis(400));
        assert_eq!(config.typing_timeout, Duration::from_millis(1500));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_shrinking_backoff() {
        let mut config = SessionConfig::default();
        config.reconnect.backoff_factor = 0.5;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ShrinkingBackoff(_))
        ));
    }
}
