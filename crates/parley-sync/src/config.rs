//! Engine configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the engine can start with zero
//! configuration.

use std::time::Duration;

use parley_shared::constants::{
    DEFAULT_EVENT_BUFFER, DEFAULT_RETRY_BASE, DEFAULT_RETRY_CAP, DEFAULT_RETRY_MULTIPLIER,
    DEFAULT_TYPING_DEBOUNCE, DEFAULT_TYPING_IDLE,
};

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// First retry delay after a failed delivery.
    /// Env: `PARLEY_RETRY_BASE_MS`
    pub retry_base: Duration,

    /// Multiplicative growth between consecutive retry delays.
    /// Env: `PARLEY_RETRY_MULTIPLIER`
    pub retry_multiplier: u32,

    /// Upper cap on the retry delay.
    /// Env: `PARLEY_RETRY_CAP_MS`
    pub retry_cap: Duration,

    /// Window in which rapid typing calls coalesce into one remote write.
    /// Env: `PARLEY_TYPING_DEBOUNCE_MS`
    pub typing_debounce: Duration,

    /// Idle time after the last keystroke before the typing signal is
    /// cleared remotely.
    /// Env: `PARLEY_TYPING_IDLE_MS`
    pub typing_idle: Duration,

    /// Buffered events on the broadcast channel.
    /// Env: `PARLEY_EVENT_BUFFER`
    pub event_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            retry_base: DEFAULT_RETRY_BASE,
            retry_multiplier: DEFAULT_RETRY_MULTIPLIER,
            retry_cap: DEFAULT_RETRY_CAP,
            typing_debounce: DEFAULT_TYPING_DEBOUNCE,
            typing_idle: DEFAULT_TYPING_IDLE,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

impl SyncConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults.  Invalid values warn and keep the default.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(ms) = env_u64("PARLEY_RETRY_BASE_MS") {
            config.retry_base = Duration::from_millis(ms);
        }
        if let Some(factor) = env_u64("PARLEY_RETRY_MULTIPLIER") {
            config.retry_multiplier = factor as u32;
        }
        if let Some(ms) = env_u64("PARLEY_RETRY_CAP_MS") {
            config.retry_cap = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("PARLEY_TYPING_DEBOUNCE_MS") {
            config.typing_debounce = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("PARLEY_TYPING_IDLE_MS") {
            config.typing_idle = Duration::from_millis(ms);
        }
        if let Some(n) = env_u64("PARLEY_EVENT_BUFFER") {
            if n > 0 {
                config.event_buffer = n as usize;
            }
        }

        config
    }

    /// Delay before the next attempt, after `failures` failed deliveries
    /// (`failures >= 1`): `base * multiplier^(failures-1)`, capped.
    pub fn backoff_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(20);
        let factor = (self.retry_multiplier as u64)
            .checked_pow(exponent)
            .unwrap_or(u64::MAX);
        let delay = self
            .retry_base
            .as_millis()
            .saturating_mul(factor as u128)
            .min(self.retry_cap.as_millis());
        Duration::from_millis(delay as u64)
    }
}

fn env_u64(name: &str) -> Option<u64> {
    let raw = std::env::var(name).ok()?;
    match raw.parse::<u64>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "invalid value, using default");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = SyncConfig::default();
        assert_eq!(config.retry_base, Duration::from_secs(2));
        assert_eq!(config.retry_multiplier, 2);
        assert_eq!(config.retry_cap, Duration::from_secs(300));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let config = SyncConfig::default();

        let mut previous = Duration::ZERO;
        for failures in 1..=16 {
            let delay = config.backoff_delay(failures);
            assert!(delay >= previous, "delay shrank at failure {failures}");
            assert!(delay <= config.retry_cap);
            previous = delay;
        }

        assert_eq!(config.backoff_delay(1), Duration::from_secs(2));
        assert_eq!(config.backoff_delay(2), Duration::from_secs(4));
        assert_eq!(config.backoff_delay(3), Duration::from_secs(8));
        assert_eq!(config.backoff_delay(16), config.retry_cap);
    }

    #[test]
    fn backoff_survives_huge_failure_counts() {
        let config = SyncConfig::default();
        assert_eq!(config.backoff_delay(u32::MAX), config.retry_cap);
    }
}
