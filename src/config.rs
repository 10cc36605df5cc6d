//! Configuration
//!
//! [`Settings`] is the flat, environment-driven surface parsed by clap.
//! [`EngineConfig`] is the typed configuration the engine consumes, built
//! from it and validated once at startup.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::adapters::TradingHours;
use crate::cache::{LayerLimits, LayerTtlBounds, TtlPolicy, DEFAULT_QUERY_TIMEOUT};
use crate::cache::{L1Config, L2Config, L3Config};
use crate::error::{Error, Result};
use crate::feed::ChangeFeedConfig;
use crate::monitoring::MemoryMonitorConfig;

/// Largest batch accepted by default
pub const DEFAULT_MAX_BATCH_SIZE: usize = 1_000;

// =============================================================================
// Engine Configuration
// =============================================================================

/// Typed configuration of the cache engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Service-level switch; when off every request takes the direct path
    pub enabled: bool,
    pub layers: LayerLimits,
    pub ttl: TtlPolicy,
    /// Timeout of deduplicated loads and batch resolutions
    pub query_timeout: Duration,
    pub max_batch_size: usize,
    pub memory: MemoryMonitorConfig,
    pub feed: ChangeFeedConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            layers: LayerLimits::default(),
            ttl: TtlPolicy::default(),
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            memory: MemoryMonitorConfig::default(),
            feed: ChangeFeedConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        self.layers.validate()?;
        self.ttl.validate()?;
        if self.query_timeout.is_zero() {
            return Err(Error::Config("query timeout must be positive".into()));
        }
        if self.max_batch_size == 0 {
            return Err(Error::Config("max batch size must be positive".into()));
        }
        self.memory.validate()?;
        self.feed.validate()?;
        Ok(())
    }
}

// =============================================================================
// CLI / Environment Settings
// =============================================================================

/// Settings for the symbol mapping cache, from flags or environment
#[derive(Parser, Debug, Clone)]
pub struct Settings {
    /// Enable the cache layers (false serves every request from the store)
    #[arg(long, env = "SYMBOL_CACHE_ENABLED", default_value_t = true, action = clap::ArgAction::Set)]
    pub cache_enabled: bool,

    /// Maximum rule sets held in L1
    #[arg(long, env = "L1_MAX_ENTRIES", default_value = "1000")]
    pub l1_max_entries: usize,

    /// L1 base TTL in seconds
    #[arg(long, env = "L1_TTL_SECS", default_value = "86400")]
    pub l1_ttl_secs: u64,

    /// L1 minimum TTL in seconds
    #[arg(long, env = "L1_TTL_MIN_SECS", default_value = "3600")]
    pub l1_ttl_min_secs: u64,

    /// L1 maximum TTL in seconds
    #[arg(long, env = "L1_TTL_MAX_SECS", default_value = "172800")]
    pub l1_ttl_max_secs: u64,

    /// Maximum symbol mappings held in L2
    #[arg(long, env = "L2_MAX_ENTRIES", default_value = "100000")]
    pub l2_max_entries: usize,

    /// L2 base TTL in seconds
    #[arg(long, env = "L2_TTL_SECS", default_value = "43200")]
    pub l2_ttl_secs: u64,

    /// L2 minimum TTL in seconds
    #[arg(long, env = "L2_TTL_MIN_SECS", default_value = "1800")]
    pub l2_ttl_min_secs: u64,

    /// L2 maximum TTL in seconds
    #[arg(long, env = "L2_TTL_MAX_SECS", default_value = "86400")]
    pub l2_ttl_max_secs: u64,

    /// Maximum batch results held in L3
    #[arg(long, env = "L3_MAX_ENTRIES", default_value = "10000")]
    pub l3_max_entries: usize,

    /// L3 base TTL in seconds
    #[arg(long, env = "L3_TTL_SECS", default_value = "300")]
    pub l3_ttl_secs: u64,

    /// L3 minimum TTL in seconds
    #[arg(long, env = "L3_TTL_MIN_SECS", default_value = "30")]
    pub l3_ttl_min_secs: u64,

    /// L3 maximum TTL in seconds
    #[arg(long, env = "L3_TTL_MAX_SECS", default_value = "3600")]
    pub l3_ttl_max_secs: u64,

    /// Multiplier applied to base TTLs while a market is open
    #[arg(long, env = "OPEN_SESSION_TTL_FACTOR", default_value = "0.5")]
    pub open_session_ttl_factor: f64,

    /// Deduplicated query timeout in milliseconds
    #[arg(long, env = "QUERY_TIMEOUT_MS", default_value = "5000")]
    pub query_timeout_ms: u64,

    /// Largest accepted batch
    #[arg(long, env = "MAX_BATCH_SIZE", default_value = "1000")]
    pub max_batch_size: usize,

    /// Memory check interval in seconds
    #[arg(long, env = "MEMORY_CHECK_INTERVAL_SECS", default_value = "30")]
    pub memory_check_interval_secs: u64,

    /// Memory warning watermark (percent)
    #[arg(long, env = "MEMORY_WARNING_PERCENT", default_value = "70")]
    pub memory_warning_percent: f64,

    /// Memory critical watermark (percent)
    #[arg(long, env = "MEMORY_CRITICAL_PERCENT", default_value = "80")]
    pub memory_critical_percent: f64,

    /// Memory budget in bytes (defaults to the cgroup limit or total RAM)
    #[arg(long, env = "MEMORY_LIMIT_BYTES")]
    pub memory_limit_bytes: Option<u64>,

    /// Samples skipped after a successful cleanup
    #[arg(long, env = "POST_CLEANUP_GRACE_SAMPLES", default_value = "1")]
    pub post_cleanup_grace_samples: u32,

    /// First change feed reconnect delay in milliseconds
    #[arg(long, env = "FEED_RECONNECT_BASE_MS", default_value = "1000")]
    pub feed_reconnect_base_ms: u64,

    /// Longest change feed reconnect delay in milliseconds
    #[arg(long, env = "FEED_RECONNECT_MAX_MS", default_value = "30000")]
    pub feed_reconnect_max_ms: u64,

    /// Reconnect jitter ratio (0.0 - 1.0)
    #[arg(long, env = "FEED_RECONNECT_JITTER", default_value = "0.1")]
    pub feed_reconnect_jitter: f64,

    /// Directory of `<provider>.yaml` rule files
    #[arg(long, env = "RULES_DIR", default_value = "./rules")]
    pub rules_dir: PathBuf,

    /// Rule directory poll interval in seconds
    #[arg(long, env = "RULES_POLL_INTERVAL_SECS", default_value = "5")]
    pub rules_poll_interval_secs: u64,

    /// Pre-market start (UTC, HH:MM)
    #[arg(long, env = "SESSION_PRE_OPEN", default_value = "09:00")]
    pub session_pre_open: String,

    /// Regular session start (UTC, HH:MM)
    #[arg(long, env = "SESSION_OPEN", default_value = "14:30")]
    pub session_open: String,

    /// Regular session end (UTC, HH:MM)
    #[arg(long, env = "SESSION_CLOSE", default_value = "21:00")]
    pub session_close: String,

    /// After-hours end (UTC, HH:MM)
    #[arg(long, env = "SESSION_POST_CLOSE", default_value = "23:00")]
    pub session_post_close: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    pub metrics_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    pub health_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    pub log_json: bool,
}

impl Settings {
    /// Build and validate the engine configuration
    pub fn engine_config(&self) -> Result<EngineConfig> {
        let secs = Duration::from_secs;
        let config = EngineConfig {
            enabled: self.cache_enabled,
            layers: LayerLimits {
                l1: L1Config {
                    max_entries: self.l1_max_entries,
                },
                l2: L2Config {
                    max_entries: self.l2_max_entries,
                },
                l3: L3Config {
                    max_entries: self.l3_max_entries,
                },
            },
            ttl: TtlPolicy {
                l1: LayerTtlBounds::new(
                    secs(self.l1_ttl_secs),
                    secs(self.l1_ttl_min_secs),
                    secs(self.l1_ttl_max_secs),
                ),
                l2: LayerTtlBounds::new(
                    secs(self.l2_ttl_secs),
                    secs(self.l2_ttl_min_secs),
                    secs(self.l2_ttl_max_secs),
                ),
                l3: LayerTtlBounds::new(
                    secs(self.l3_ttl_secs),
                    secs(self.l3_ttl_min_secs),
                    secs(self.l3_ttl_max_secs),
                ),
                open_factor: self.open_session_ttl_factor,
            },
            query_timeout: Duration::from_millis(self.query_timeout_ms),
            max_batch_size: self.max_batch_size,
            memory: MemoryMonitorConfig {
                check_interval: secs(self.memory_check_interval_secs),
                warning_percent: self.memory_warning_percent,
                critical_percent: self.memory_critical_percent,
                post_cleanup_grace_samples: self.post_cleanup_grace_samples,
            },
            feed: ChangeFeedConfig {
                base_delay: Duration::from_millis(self.feed_reconnect_base_ms),
                max_delay: Duration::from_millis(self.feed_reconnect_max_ms),
                jitter_ratio: self.feed_reconnect_jitter,
            },
        };
        config.validate()?;
        Ok(config)
    }

    pub fn rules_poll_interval(&self) -> Duration {
        Duration::from_secs(self.rules_poll_interval_secs)
    }

    /// Default trading day used to derive market sessions
    pub fn trading_hours(&self) -> Result<TradingHours> {
        TradingHours::parse(
            &self.session_pre_open,
            &self.session_open,
            &self.session_close,
            &self.session_post_close,
        )
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn parse(args: &[&str]) -> Settings {
        let mut argv = vec!["symbol-cache"];
        argv.extend_from_slice(args);
        Settings::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_default_engine_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_settings_defaults_match_engine_defaults() {
        let settings = parse(&[]);
        let config = settings.engine_config().unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(settings.rules_poll_interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_settings_overrides() {
        let settings = parse(&[
            "--cache-enabled",
            "false",
            "--l2-max-entries",
            "50",
            "--query-timeout-ms",
            "250",
            "--memory-critical-percent",
            "90",
        ]);
        let config = settings.engine_config().unwrap();
        assert!(!config.enabled);
        assert_eq!(config.layers.l2.max_entries, 50);
        assert_eq!(config.query_timeout, Duration::from_millis(250));
        assert_eq!(config.memory.critical_percent, 90.0);
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let settings = parse(&["--l3-ttl-secs", "90000", "--l3-ttl-max-secs", "90000"]);
        assert_matches!(settings.engine_config(), Err(Error::Config(_)));

        let settings = parse(&["--memory-warning-percent", "85"]);
        assert_matches!(settings.engine_config(), Err(Error::Config(_)));

        let settings = parse(&["--query-timeout-ms", "0"]);
        assert_matches!(settings.engine_config(), Err(Error::Config(_)));

        let settings = parse(&["--l1-max-entries", "0"]);
        assert_matches!(settings.engine_config(), Err(Error::Config(_)));
    }

    #[test]
    fn test_trading_hours_from_settings() {
        let hours = parse(&[]).trading_hours().unwrap();
        assert!(hours.open < hours.close);

        let settings = parse(&["--session-open", "25:00"]);
        assert_matches!(settings.trading_hours(), Err(Error::Config(_)));
    }

    #[test]
    fn test_unknown_flag_rejected() {
        assert!(Settings::try_parse_from(["symbol-cache", "--l4-max-entries", "1"]).is_err());
    }
}
