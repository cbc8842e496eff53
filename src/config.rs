// =============================================================================
// Runtime Configuration — Hot-reloadable engine settings with atomic save
// =============================================================================
//
// Every tunable the Risk Evaluator and Price Feed need lives here so the
// engine can be reconfigured without a restart. Persistence uses an atomic
// tmp + rename pattern to prevent corruption on crash. All fields carry
// `#[serde(default)]` so that adding new fields never breaks loading an
// older config file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::TradingMode;

fn default_symbols() -> Vec<String> {
    vec![
        "BTCUSDT".to_string(),
        "ETHUSDT".to_string(),
        "BNBUSDT".to_string(),
        "XRPUSDT".to_string(),
        "SOLUSDT".to_string(),
    ]
}

fn default_price_stale_ms() -> u64 {
    5_000
}

fn default_eval_tick_ms() -> u64 {
    1_000
}

fn default_max_eval_concurrency() -> u32 {
    32
}

fn default_access_ttl_s() -> u64 {
    900
}

fn default_refresh_ttl_s() -> u64 {
    60 * 60 * 24 * 30
}

fn default_leaderboard_cache_ttl_s() -> u64 {
    60
}

/// Top-level runtime configuration for the engine.
///
/// Every field has a serde default so that older JSON files missing new
/// fields still deserialize correctly (teacher's `runtime_config.rs`
/// convention).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// System-wide maintenance switch, independent of any challenge's own
    /// lifecycle status.
    #[serde(default)]
    pub trading_mode: TradingMode,

    /// Tracked USDT-perpetual symbols (spec.md §1 Non-goals: fixed list).
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Staleness threshold above which a price reading is treated as
    /// unknown (spec.md §4.1, env `PRICE_STALE_MS`).
    #[serde(default = "default_price_stale_ms")]
    pub price_stale_ms: u64,

    /// Risk Evaluator tick cadence (spec.md §4.3, env `EVAL_TICK_MS`).
    #[serde(default = "default_eval_tick_ms")]
    pub eval_tick_ms: u64,

    /// Bounded worker pool size for the Risk Evaluator (spec.md §5, env
    /// `MAX_EVAL_CONCURRENCY`).
    #[serde(default = "default_max_eval_concurrency")]
    pub max_eval_concurrency: u32,

    /// Access token TTL in seconds (env `ACCESS_TTL_S`).
    #[serde(default = "default_access_ttl_s")]
    pub access_ttl_s: u64,

    /// Refresh token TTL in seconds (env `REFRESH_TTL_S`).
    #[serde(default = "default_refresh_ttl_s")]
    pub refresh_ttl_s: u64,

    /// Leaderboard cache TTL in seconds (spec.md §4.6: 60s).
    #[serde(default = "default_leaderboard_cache_ttl_s")]
    pub leaderboard_cache_ttl_s: u64,

    /// Origins allowed to make cross-origin requests (env `ALLOWED_ORIGINS`,
    /// comma-separated).
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            trading_mode: TradingMode::Live,
            symbols: default_symbols(),
            price_stale_ms: default_price_stale_ms(),
            eval_tick_ms: default_eval_tick_ms(),
            max_eval_concurrency: default_max_eval_concurrency(),
            access_ttl_s: default_access_ttl_s(),
            refresh_ttl_s: default_refresh_ttl_s(),
            leaderboard_cache_ttl_s: default_leaderboard_cache_ttl_s(),
            allowed_origins: Vec::new(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`, then apply recognized
    /// environment variable overrides on top (spec.md §6).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let mut config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        config.apply_env_overrides();

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            trading_mode = %config.trading_mode,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Build the default config, then apply environment variable overrides
    /// — used when no config file exists yet.
    pub fn from_env_defaults() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(syms) = std::env::var("AURORA_SYMBOLS") {
            let parsed: Vec<String> = syms
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
            if !parsed.is_empty() {
                self.symbols = parsed;
            }
        }
        if let Ok(v) = std::env::var("PRICE_STALE_MS") {
            if let Ok(n) = v.parse() {
                self.price_stale_ms = n;
            }
        }
        if let Ok(v) = std::env::var("EVAL_TICK_MS") {
            if let Ok(n) = v.parse() {
                self.eval_tick_ms = n;
            }
        }
        if let Ok(v) = std::env::var("MAX_EVAL_CONCURRENCY") {
            if let Ok(n) = v.parse() {
                self.max_eval_concurrency = n;
            }
        }
        if let Ok(v) = std::env::var("ACCESS_TTL_S") {
            if let Ok(n) = v.parse() {
                self.access_ttl_s = n;
            }
        }
        if let Ok(v) = std::env::var("REFRESH_TTL_S") {
            if let Ok(n) = v.parse() {
                self.refresh_ttl_s = n;
            }
        }
        if let Ok(v) = std::env::var("ALLOWED_ORIGINS") {
            self.allowed_origins = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename) to survive a crash mid-write.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialize runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    pub fn price_stale(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.price_stale_ms)
    }

    pub fn eval_tick(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.eval_tick_ms)
    }
}

/// Warn-and-fall-back-to-defaults loader, matching the teacher's `main.rs`
/// call site: a missing config file is not an error, a malformed one is.
pub fn load_or_default(path: impl AsRef<Path>) -> RuntimeConfig {
    let path = path.as_ref();
    if !path.exists() {
        warn!(path = %path.display(), "no runtime config found, using defaults + env overrides");
        return RuntimeConfig::from_env_defaults();
    }
    match RuntimeConfig::load(path) {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!(error = %e, "failed to load config, using defaults + env overrides");
            RuntimeConfig::from_env_defaults()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.trading_mode, TradingMode::Live);
        assert_eq!(cfg.symbols.len(), 5);
        assert_eq!(cfg.symbols[0], "BTCUSDT");
        assert_eq!(cfg.price_stale_ms, 5000);
        assert_eq!(cfg.eval_tick_ms, 1000);
        assert_eq!(cfg.max_eval_concurrency, 32);
    }

    #[test]
    fn deserialize_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.trading_mode, TradingMode::Live);
        assert_eq!(cfg.eval_tick_ms, 1000);
        assert_eq!(cfg.max_eval_concurrency, 32);
    }

    #[test]
    fn deserialize_partial_json_fills_defaults() {
        let json = r#"{ "symbols": ["ETHUSDT"] }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.symbols, vec!["ETHUSDT"]);
        assert_eq!(cfg.price_stale_ms, 5000);
    }

    #[test]
    fn roundtrip_serialization() {
        let cfg = RuntimeConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.symbols, cfg2.symbols);
        assert_eq!(cfg.eval_tick_ms, cfg2.eval_tick_ms);
    }
}
