// =============================================================================
// Runtime Configuration — Hot-reloadable engine settings with atomic save
// =============================================================================
//
// Central configuration hub for the Meridian trading engine.  Every tunable
// parameter lives here so that the engine can be reconfigured at runtime
// without a restart.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.  All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
//
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::exit::MonitorConfig;
use crate::gate::GateConfig;
use crate::types::{AccountMode, TradingMode};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbols() -> Vec<String> {
    vec![
        "AAPL".to_string(),
        "MSFT".to_string(),
        "NVDA".to_string(),
        "SPY".to_string(),
        "TSLA".to_string(),
    ]
}

fn default_tick_interval_secs() -> u64 {
    60
}

fn default_min_secs_between_trades() -> i64 {
    60
}

fn default_signal_improvement_factor() -> f64 {
    1.3
}

fn default_levels_ttl_hours() -> i64 {
    24
}

fn default_trigger_buffer() -> f64 {
    0.001
}

fn default_max_exit_retries() -> u32 {
    3
}

fn default_exit_retry_delay_ms() -> u64 {
    2000
}

fn default_fill_poll_delay_ms() -> u64 {
    2000
}

fn default_max_position_notional() -> f64 {
    10_000.0
}

fn default_max_equity_fraction() -> f64 {
    0.10
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the Meridian engine.
///
/// Every field has a serde default so that older JSON files missing new
/// fields will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Operational modes ---------------------------------------------------

    /// Current trading mode: Live, Paused, or Killed. Entries are blocked
    /// unless Live; the exit sweep runs in every mode.
    #[serde(default)]
    pub trading_mode: TradingMode,

    /// Demo (in-process ledger) or Live (remote ledger).
    #[serde(default)]
    pub account_mode: AccountMode,

    // --- Symbols & scheduling ------------------------------------------------

    /// Watchlist displayed in status output.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Seconds between scheduled exit-monitoring invocations.
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,

    // --- Trade gate ----------------------------------------------------------

    /// Per-symbol cooldown between trades, in seconds.
    #[serde(default = "default_min_secs_between_trades")]
    pub min_secs_between_trades: i64,

    /// Relative margin a re-entry signal must beat the last recorded
    /// strength by (1.3 = 30 % stronger).
    #[serde(default = "default_signal_improvement_factor")]
    pub signal_improvement_factor: f64,

    /// Absolute per-trade notional ceiling.
    #[serde(default = "default_max_position_notional")]
    pub max_position_notional: f64,

    /// Maximum per-trade notional as a fraction of account equity.
    #[serde(default = "default_max_equity_fraction")]
    pub max_equity_fraction: f64,

    // --- Exit monitor --------------------------------------------------------

    /// Hours until a stored levels record expires (dead-man's-switch).
    #[serde(default = "default_levels_ttl_hours")]
    pub levels_ttl_hours: i64,

    /// Fractional buffer on trigger thresholds.
    #[serde(default = "default_trigger_buffer")]
    pub trigger_buffer: f64,

    /// Exit order submission attempts before giving up for this invocation.
    #[serde(default = "default_max_exit_retries")]
    pub max_exit_retries: u32,

    /// Fixed delay between exit submission attempts, in milliseconds.
    #[serde(default = "default_exit_retry_delay_ms")]
    pub exit_retry_delay_ms: u64,

    /// Delay before the single post-submit fill poll, in milliseconds.
    #[serde(default = "default_fill_poll_delay_ms")]
    pub fill_poll_delay_ms: u64,

    /// Arms the operator emergency stop. Off by default.
    #[serde(default)]
    pub emergency_stop_enabled: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            trading_mode: TradingMode::Paused,
            account_mode: AccountMode::Demo,
            symbols: default_symbols(),
            tick_interval_secs: default_tick_interval_secs(),
            min_secs_between_trades: default_min_secs_between_trades(),
            signal_improvement_factor: default_signal_improvement_factor(),
            max_position_notional: default_max_position_notional(),
            max_equity_fraction: default_max_equity_fraction(),
            levels_ttl_hours: default_levels_ttl_hours(),
            trigger_buffer: default_trigger_buffer(),
            max_exit_retries: default_max_exit_retries(),
            exit_retry_delay_ms: default_exit_retry_delay_ms(),
            fill_poll_delay_ms: default_fill_poll_delay_ms(),
            emergency_stop_enabled: false,
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            trading_mode = %config.trading_mode,
            account_mode = %config.account_mode,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    ///
    /// This prevents corruption if the process crashes mid-write.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Derived component configs
    // -------------------------------------------------------------------------

    pub fn gate_config(&self) -> GateConfig {
        GateConfig {
            min_secs_between_trades: self.min_secs_between_trades,
            signal_improvement_factor: self.signal_improvement_factor,
            max_position_notional: self.max_position_notional,
            max_equity_fraction: self.max_equity_fraction,
        }
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            trigger_buffer: self.trigger_buffer,
            max_exit_retries: self.max_exit_retries,
            exit_retry_delay_ms: self.exit_retry_delay_ms,
            fill_poll_delay_ms: self.fill_poll_delay_ms,
            emergency_stop_enabled: self.emergency_stop_enabled,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.trading_mode, TradingMode::Paused);
        assert_eq!(cfg.account_mode, AccountMode::Demo);
        assert_eq!(cfg.symbols.len(), 5);
        assert_eq!(cfg.min_secs_between_trades, 60);
        assert!((cfg.signal_improvement_factor - 1.3).abs() < f64::EPSILON);
        assert_eq!(cfg.levels_ttl_hours, 24);
        assert!((cfg.trigger_buffer - 0.001).abs() < f64::EPSILON);
        assert_eq!(cfg.max_exit_retries, 3);
        assert!(!cfg.emergency_stop_enabled);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.trading_mode, TradingMode::Paused);
        assert_eq!(cfg.account_mode, AccountMode::Demo);
        assert_eq!(cfg.tick_interval_secs, 60);
        assert!((cfg.max_equity_fraction - 0.10).abs() < f64::EPSILON);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "trading_mode": "Live", "min_secs_between_trades": 120 }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.trading_mode, TradingMode::Live);
        assert_eq!(cfg.min_secs_between_trades, 120);
        assert_eq!(cfg.max_exit_retries, 3);
        assert_eq!(cfg.levels_ttl_hours, 24);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = RuntimeConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.symbols, cfg2.symbols);
        assert_eq!(cfg.trading_mode, cfg2.trading_mode);
        assert_eq!(cfg.min_secs_between_trades, cfg2.min_secs_between_trades);
    }

    #[test]
    fn derived_configs_carry_tunables() {
        let mut cfg = RuntimeConfig::default();
        cfg.trigger_buffer = 0.002;
        cfg.max_position_notional = 5_000.0;

        assert!((cfg.monitor_config().trigger_buffer - 0.002).abs() < f64::EPSILON);
        assert!((cfg.gate_config().max_position_notional - 5_000.0).abs() < f64::EPSILON);
    }
}
