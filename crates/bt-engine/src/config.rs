//! Environment-driven engine configuration, loaded once at daemon startup.

use std::collections::HashSet;
use std::time::Duration;

use serde_json::Value;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_concurrent_backtests: usize,
    pub job_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub dispatcher_poll_interval: Duration,
    pub timeout_watch_interval: Duration,
    pub cron_poll_interval: Duration,
    /// Base config merged with each job's `BacktestConfig` before the
    /// container starts. Empty object when the deployment has none.
    pub base_config_template: Value,
    /// Exchanges configured in futures mode, driving the `BASE/QUOTE` pair
    /// rewrite in `bt-container::config_merge`.
    pub futures_exchanges: HashSet<String>,
    pub strategy_class_env: String,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self {
            max_concurrent_backtests: env_usize("BT_MAX_CONCURRENT_BACKTESTS", 4),
            job_timeout: env_duration_secs("BT_JOB_TIMEOUT_SECS", 60 * 60),
            shutdown_timeout: env_duration_secs("BT_SHUTDOWN_TIMEOUT_SECS", 30),
            max_retries: env_usize("BT_MAX_RETRIES", 2) as u32,
            retry_backoff: Duration::from_secs(5),
            dispatcher_poll_interval: env_duration_secs("BT_DISPATCH_POLL_INTERVAL_SECS", 5),
            timeout_watch_interval: Duration::from_secs(30),
            cron_poll_interval: Duration::from_secs(30),
            base_config_template: Value::Object(Default::default()),
            futures_exchanges: std::env::var("BT_FUTURES_EXCHANGES")
                .ok()
                .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
                .unwrap_or_default(),
            strategy_class_env: "Strategy".to_string(),
        }
    }

    pub fn exchange_trading_mode(&self, exchange: &str) -> Option<String> {
        self.futures_exchanges.contains(exchange).then(|| "futures".to_string())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_backtests: 4,
            job_timeout: Duration::from_secs(60 * 60),
            shutdown_timeout: Duration::from_secs(30),
            max_retries: 2,
            retry_backoff: Duration::from_secs(5),
            dispatcher_poll_interval: Duration::from_secs(5),
            timeout_watch_interval: Duration::from_secs(30),
            cron_poll_interval: Duration::from_secs(30),
            base_config_template: Value::Object(Default::default()),
            futures_exchanges: HashSet::new(),
            strategy_class_env: "Strategy".to_string(),
        }
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_duration_secs(key: &str, default_secs: u64) -> Duration {
    Duration::from_secs(env_usize(key, default_secs as usize) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = EngineConfig::default();
        assert_eq!(config.max_concurrent_backtests, 4);
        assert_eq!(config.job_timeout, Duration::from_secs(3600));
        assert_eq!(config.retry_backoff, Duration::from_secs(5));
    }

    #[test]
    fn futures_mode_only_for_listed_exchanges() {
        let mut config = EngineConfig::default();
        config.futures_exchanges.insert("binance".to_string());
        assert_eq!(config.exchange_trading_mode("binance"), Some("futures".to_string()));
        assert_eq!(config.exchange_trading_mode("kraken"), None);
    }
}
