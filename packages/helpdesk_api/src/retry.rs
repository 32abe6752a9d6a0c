use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry and circuit-breaker tunables (lives under `[retry]` in config.toml).
///
/// One value is owned per client; the executor and its breaker both read it,
/// so two clients in the same process never share retry state.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryConfig {
    #[serde(default = "default_max_rate_limit_retries")]
    pub max_rate_limit_retries: u32,
    #[serde(default = "default_max_5xx_retries")]
    pub max_5xx_retries: u32,
    /// Base for `base * 2^attempt` when a 429 carries no Retry-After.
    #[serde(default = "default_rate_limit_base_delay_ms")]
    pub rate_limit_base_delay_ms: u64,
    #[serde(default = "default_server_error_retry_delay_ms")]
    pub server_error_retry_delay_ms: u64,
    #[serde(default = "default_circuit_breaker_threshold")]
    pub circuit_breaker_threshold: u32,
    #[serde(default = "default_circuit_breaker_reset_secs")]
    pub circuit_breaker_reset_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_rate_limit_retries: default_max_rate_limit_retries(),
            max_5xx_retries: default_max_5xx_retries(),
            rate_limit_base_delay_ms: default_rate_limit_base_delay_ms(),
            server_error_retry_delay_ms: default_server_error_retry_delay_ms(),
            circuit_breaker_threshold: default_circuit_breaker_threshold(),
            circuit_breaker_reset_secs: default_circuit_breaker_reset_secs(),
        }
    }
}

impl RetryConfig {
    pub fn rate_limit_base_delay(&self) -> Duration {
        Duration::from_millis(self.rate_limit_base_delay_ms)
    }

    pub fn server_error_retry_delay(&self) -> Duration {
        Duration::from_millis(self.server_error_retry_delay_ms)
    }

    pub fn circuit_breaker_reset(&self) -> Duration {
        Duration::from_secs(self.circuit_breaker_reset_secs)
    }

    /// Backoff for the given zero-based 429 attempt when the server sent no Retry-After.
    pub fn rate_limit_backoff(&self, attempt: u32) -> Duration {
        // 2^16 * base is already far beyond any sane budget
        self.rate_limit_base_delay() * 2u32.pow(attempt.min(16))
    }
}

fn default_max_rate_limit_retries() -> u32 {
    3
}
fn default_max_5xx_retries() -> u32 {
    1
}
fn default_rate_limit_base_delay_ms() -> u64 {
    1000
}
fn default_server_error_retry_delay_ms() -> u64 {
    1000
}
fn default_circuit_breaker_threshold() -> u32 {
    5
}
fn default_circuit_breaker_reset_secs() -> u64 {
    30
}

/// Polling behavior for `202 Accepted` + `Location` responses (lives under `[wait]`).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct WaitConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_wait_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_wait_interval_ms")]
    pub interval_ms: u64,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout_secs: default_wait_timeout_secs(),
            interval_ms: default_wait_interval_ms(),
        }
    }
}

impl WaitConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

fn default_wait_timeout_secs() -> u64 {
    60
}
fn default_wait_interval_ms() -> u64 {
    2000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_backoff_doubles() {
        let cfg = RetryConfig {
            rate_limit_base_delay_ms: 100,
            ..Default::default()
        };
        assert_eq!(cfg.rate_limit_backoff(0), Duration::from_millis(100));
        assert_eq!(cfg.rate_limit_backoff(1), Duration::from_millis(200));
        assert_eq!(cfg.rate_limit_backoff(3), Duration::from_millis(800));
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let cfg: RetryConfig = serde_json::from_str(r#"{"max_5xx_retries": 4}"#).unwrap();
        assert_eq!(cfg.max_5xx_retries, 4);
        assert_eq!(cfg.max_rate_limit_retries, 3);
        assert_eq!(cfg.circuit_breaker_reset(), Duration::from_secs(30));
    }
}
