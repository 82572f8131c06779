use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Result, ShardMqError};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConsumptionConfig {
    pub grouped: GroupedSourceConfig,
    pub ungrouped: UngroupedSourceConfig,
    pub selector: SelectorConfig,
    pub delay: DelayConfig,
    pub error_threshold: ErrorThresholdConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupedSourceConfig {
    /// Watermark that triggers replenishment fetches while total in-flight
    /// is below it. One fetch batch may momentarily overshoot it.
    pub max_in_flight_messages: usize,
}

impl Default for GroupedSourceConfig {
    fn default() -> Self {
        Self {
            max_in_flight_messages: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UngroupedSourceConfig {
    /// Bound on the local overflow buffer. `None` keeps the overflow
    /// unbounded and relies on upstream backpressure; `Some(n)` skips
    /// delegate fetches while the overflow holds at least `n` messages.
    pub max_overflow_messages: Option<usize>,
}

impl Default for UngroupedSourceConfig {
    fn default() -> Self {
        Self {
            max_overflow_messages: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectorConfig {
    /// Messages requested from each source per fetch.
    pub batch_size: usize,
    /// Backoff before re-arming a holder whose fetch returned no messages.
    pub empty_refetch_delay_ms: u64,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            batch_size: 64,
            empty_refetch_delay_ms: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelayConfig {
    /// Minimum age a retry-queue message must reach before release.
    pub delay_ms: u64,
}

impl Default for DelayConfig {
    fn default() -> Self {
        Self { delay_ms: 1_000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorThresholdConfig {
    pub window_size_ms: u64,
    pub tick_rate_ms: u64,
    /// Percentage of window datapoints tolerated as errors.
    pub pct_error_threshold: f32,
}

impl Default for ErrorThresholdConfig {
    fn default() -> Self {
        Self {
            window_size_ms: 60_000,
            tick_rate_ms: 1_000,
            pct_error_threshold: 10.0,
        }
    }
}

impl ConsumptionConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: ConsumptionConfig = toml::from_str(&raw)
            .map_err(|e| ShardMqError::InvalidConfig(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.grouped.max_in_flight_messages == 0 {
            return Err(ShardMqError::InvalidConfig(
                "max_in_flight_messages must be greater than 0".to_string(),
            ));
        }
        if self.selector.batch_size == 0 {
            return Err(ShardMqError::InvalidConfig(
                "selector batch_size must be greater than 0".to_string(),
            ));
        }
        self.error_threshold.validate()?;
        Ok(())
    }
}

impl ErrorThresholdConfig {
    pub fn validate(&self) -> Result<()> {
        if self.tick_rate_ms == 0 {
            return Err(ShardMqError::InvalidConfig(
                "tick_rate_ms must be greater than 0".to_string(),
            ));
        }
        if self.window_size_ms % self.tick_rate_ms != 0 {
            return Err(ShardMqError::InvalidConfig(format!(
                "window_size_ms {} must be a multiple of tick_rate_ms {}",
                self.window_size_ms, self.tick_rate_ms
            )));
        }
        if !(0.0..=100.0).contains(&self.pct_error_threshold) {
            return Err(ShardMqError::InvalidConfig(format!(
                "pct_error_threshold {} must be within [0, 100]",
                self.pct_error_threshold
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ConsumptionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.grouped.max_in_flight_messages, 100);
    }

    #[test]
    fn test_window_must_align_to_tick_rate() {
        let config = ErrorThresholdConfig {
            window_size_ms: 1_000,
            tick_rate_ms: 300,
            pct_error_threshold: 10.0,
        };
        assert!(matches!(
            config.validate(),
            Err(ShardMqError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_parse_from_toml() {
        let raw = r#"
            [grouped]
            max_in_flight_messages = 50

            [ungrouped]
            max_overflow_messages = 256

            [selector]
            batch_size = 32
            empty_refetch_delay_ms = 5

            [delay]
            delay_ms = 500

            [error_threshold]
            window_size_ms = 1000
            tick_rate_ms = 100
            pct_error_threshold = 10.0
        "#;
        let config: ConsumptionConfig = toml::from_str(raw).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.grouped.max_in_flight_messages, 50);
        assert_eq!(config.ungrouped.max_overflow_messages, Some(256));
        assert_eq!(config.selector.batch_size, 32);
        assert_eq!(config.delay.delay_ms, 500);
    }
}
