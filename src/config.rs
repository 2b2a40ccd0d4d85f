//! Engine configuration
//!
//! Defaults match the behaviour the tool has always had; every knob can be
//! overridden from `GOLDEN_PATH_*` environment variables.

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Bounded exponential backoff for throttled API calls
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }
}

/// Path analysis polling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisConfig {
    pub poll_interval_ms: u64,
    /// Ceiling for one analysis from start to verdict
    pub timeout_ms: u64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            timeout_ms: 300_000,
        }
    }
}

impl AnalysisConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Flow-log traffic enrichment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowLogConfig {
    pub enabled: bool,
    pub lookback_hours: i64,
    /// Aggregated rows read per query
    pub max_records: usize,
}

impl Default for FlowLogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            lookback_hours: 24,
            max_records: 100,
        }
    }
}

/// Session cache lifetime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Upper bound for reusing a session handle
    pub ttl_secs: u64,
    /// Handles are dropped this long before the credential really expires
    pub expiry_margin_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 50 * 60,
            expiry_margin_secs: 5 * 60,
        }
    }
}

/// Wall-clock ceilings for work that talks to the cloud
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadlineConfig {
    /// One check end to end: sessions, lookups and its analysis
    pub check_ms: u64,
    /// One account's survey, discovery or flow-log query
    pub account_ms: u64,
}

impl Default for DeadlineConfig {
    fn default() -> Self {
        Self {
            check_ms: 360_000,
            account_ms: 300_000,
        }
    }
}

impl DeadlineConfig {
    pub fn check(&self) -> Duration {
        Duration::from_millis(self.check_ms)
    }

    pub fn account(&self) -> Duration {
        Duration::from_millis(self.account_ms)
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    pub retry: RetryPolicy,
    pub analysis: AnalysisConfig,
    pub flow_logs: FlowLogConfig,
    pub session: SessionConfig,
    pub deadlines: DeadlineConfig,
    /// Checks verified concurrently
    pub verify_concurrency: usize,
}

impl EngineConfig {
    /// Defaults overridden by `GOLDEN_PATH_*` environment variables
    pub fn from_env() -> Self {
        let mut config = Self::with_defaults();

        if let Some(v) = env_parse("GOLDEN_PATH_MAX_RETRIES") {
            config.retry.max_retries = v;
        }
        if let Some(v) = env_parse("GOLDEN_PATH_RETRY_BASE_MS") {
            config.retry.base_delay_ms = v;
        }
        if let Some(v) = env_parse("GOLDEN_PATH_POLL_INTERVAL_MS") {
            config.analysis.poll_interval_ms = v;
        }
        if let Some(v) = env_parse::<u64>("GOLDEN_PATH_ANALYSIS_TIMEOUT_SECS") {
            config.analysis.timeout_ms = v.saturating_mul(1000);
        }
        if let Some(v) = env_parse::<bool>("GOLDEN_PATH_FLOW_LOGS") {
            config.flow_logs.enabled = v;
        }
        if let Some(v) = env_parse("GOLDEN_PATH_FLOW_LOG_LOOKBACK_HOURS") {
            config.flow_logs.lookback_hours = v;
        }
        if let Some(v) = env_parse("GOLDEN_PATH_SESSION_TTL_SECS") {
            config.session.ttl_secs = v;
        }
        if let Some(v) = env_parse::<u64>("GOLDEN_PATH_CHECK_DEADLINE_SECS") {
            config.deadlines.check_ms = v.saturating_mul(1000);
        }
        if let Some(v) = env_parse::<u64>("GOLDEN_PATH_ACCOUNT_DEADLINE_SECS") {
            config.deadlines.account_ms = v.saturating_mul(1000);
        }
        if let Some(v) = env_parse::<usize>("GOLDEN_PATH_CONCURRENCY") {
            config.verify_concurrency = v.max(1);
        }

        config
    }

    pub fn with_defaults() -> Self {
        Self {
            verify_concurrency: 4,
            ..Default::default()
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_millis(8000));
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::with_defaults();
        assert_eq!(config.verify_concurrency, 4);
        assert_eq!(config.analysis.timeout(), Duration::from_secs(300));
        assert!(config.session.ttl_secs < 60 * 60);
        assert_eq!(config.flow_logs.lookback_hours, 24);
        assert!(config.deadlines.check() > config.analysis.timeout());
    }

    #[test]
    fn test_env_overrides() {
        // Only this test sets these variables
        env::set_var("GOLDEN_PATH_ANALYSIS_TIMEOUT_SECS", "18446744073709551615");
        env::set_var("GOLDEN_PATH_CONCURRENCY", "0");
        env::set_var("GOLDEN_PATH_CHECK_DEADLINE_SECS", "90");
        let config = EngineConfig::from_env();
        env::remove_var("GOLDEN_PATH_ANALYSIS_TIMEOUT_SECS");
        env::remove_var("GOLDEN_PATH_CONCURRENCY");
        env::remove_var("GOLDEN_PATH_CHECK_DEADLINE_SECS");

        assert_eq!(config.analysis.timeout_ms, u64::MAX);
        assert_eq!(config.deadlines.check(), Duration::from_secs(90));
        assert_eq!(config.deadlines.account_ms, DeadlineConfig::default().account_ms);
        assert_eq!(config.verify_concurrency, 1);
    }
}
