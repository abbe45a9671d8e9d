// =============================================================================
// Config Manager — versioned document, dotted-path access, atomic save
// =============================================================================
//
// The configuration is a hierarchical JSON document with a monotonically
// increasing `_version` and an `_updated_at` timestamp. Components never keep
// a private copy of the environment or of tuning parameters; they read
// through this manager on every tick so that live edits propagate without a
// restart.
//
// Environment resolution priority: VELA_ENV env var > `environment` field >
// testnet. Every component that needs the environment calls `is_testnet()`
// here — there is deliberately no second implementation.
//
// Persistence uses the atomic tmp + rename pattern so a crash mid-write can
// never corrupt the file.
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::types::TradingEnvironment;

/// Env var that overrides the configured environment.
pub const ENV_VAR: &str = "VELA_ENV";

pub struct ConfigManager {
    doc: RwLock<Value>,
    path: PathBuf,
}

impl ConfigManager {
    /// Load the document from `path`, falling back to the default document
    /// when the file is missing or unreadable.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let doc = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<Value>(&content) {
                Ok(v) => {
                    info!(path = %path.display(), version = v["_version"].as_u64().unwrap_or(0), "config loaded");
                    v
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "config parse failed, using defaults");
                    default_document()
                }
            },
            Err(_) => {
                info!(path = %path.display(), "no config file, using defaults");
                default_document()
            }
        };
        Self {
            doc: RwLock::new(merge_defaults(doc)),
            path,
        }
    }

    /// In-memory manager for tests and dry-run tooling.
    pub fn in_memory() -> Self {
        Self {
            doc: RwLock::new(default_document()),
            path: PathBuf::from("vela_config.json"),
        }
    }

    // -------------------------------------------------------------------------
    // Dotted-path access
    // -------------------------------------------------------------------------

    /// Get the value at `dotted.path`, if present.
    pub fn get(&self, path: &str) -> Option<Value> {
        let doc = self.doc.read();
        lookup(&doc, path).cloned()
    }

    pub fn f64(&self, path: &str, default: f64) -> f64 {
        self.get(path).and_then(|v| v.as_f64()).unwrap_or(default)
    }

    pub fn u64(&self, path: &str, default: u64) -> u64 {
        self.get(path).and_then(|v| v.as_u64()).unwrap_or(default)
    }

    pub fn bool(&self, path: &str, default: bool) -> bool {
        self.get(path).and_then(|v| v.as_bool()).unwrap_or(default)
    }

    pub fn string(&self, path: &str, default: &str) -> String {
        self.get(path)
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| default.to_string())
    }

    pub fn string_list(&self, path: &str) -> Vec<String> {
        self.get(path)
            .and_then(|v| v.as_array().cloned())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Set the value at `dotted.path`, creating intermediate objects.
    pub fn set(&self, path: &str, value: Value) {
        let mut doc = self.doc.write();
        insert(&mut doc, path, value);
    }

    // -------------------------------------------------------------------------
    // Persistence
    // -------------------------------------------------------------------------

    /// Persist the document atomically, bumping `_version` and stamping
    /// `_updated_at`.
    pub fn save(&self) -> Result<()> {
        let content = {
            let mut doc = self.doc.write();
            let version = doc["_version"].as_u64().unwrap_or(0) + 1;
            doc["_version"] = json!(version);
            doc["_updated_at"] = json!(chrono::Utc::now().to_rfc3339());
            serde_json::to_string_pretty(&*doc).context("failed to serialise config")?
        };

        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("failed to rename tmp config to {}", self.path.display()))?;

        info!(path = %self.path.display(), "config saved (atomic)");
        Ok(())
    }

    /// The live document including `_version`, for the control surface.
    pub fn effective_config(&self) -> Value {
        self.doc.read().clone()
    }

    pub fn version(&self) -> u64 {
        self.doc.read()["_version"].as_u64().unwrap_or(0)
    }

    // -------------------------------------------------------------------------
    // Environment selection — the single source of truth
    // -------------------------------------------------------------------------

    /// Resolve the trading environment: env var > config field > testnet.
    pub fn environment(&self) -> TradingEnvironment {
        if let Ok(v) = std::env::var(ENV_VAR) {
            return parse_environment(&v);
        }
        let field = self.string("environment", "testnet");
        parse_environment(&field)
    }

    pub fn is_testnet(&self) -> bool {
        self.environment() == TradingEnvironment::Testnet
    }
}

fn parse_environment(s: &str) -> TradingEnvironment {
    match s.trim().to_ascii_lowercase().as_str() {
        "mainnet" | "live" | "prod" => TradingEnvironment::Mainnet,
        _ => TradingEnvironment::Testnet,
    }
}

// -----------------------------------------------------------------------------
// Dotted-path helpers
// -----------------------------------------------------------------------------

fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cur = doc;
    for part in path.split('.') {
        cur = cur.get(part)?;
    }
    Some(cur)
}

fn insert(doc: &mut Value, path: &str, value: Value) {
    let mut cur = doc;
    let parts: Vec<&str> = path.split('.').collect();
    for (i, part) in parts.iter().enumerate() {
        if i == parts.len() - 1 {
            cur[*part] = value;
            return;
        }
        if cur.get(*part).map(|v| !v.is_object()).unwrap_or(true) {
            cur[*part] = json!({});
        }
        cur = cur.get_mut(*part).expect("object inserted above");
    }
}

/// Fill in any top-level sections missing from a loaded document so older
/// files keep working as new knobs are added.
fn merge_defaults(mut doc: Value) -> Value {
    let defaults = default_document();
    if let (Some(doc_map), Some(def_map)) = (doc.as_object_mut(), defaults.as_object()) {
        for (k, v) in def_map {
            doc_map.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }
    doc
}

// -----------------------------------------------------------------------------
// Default document
// -----------------------------------------------------------------------------

pub fn default_document() -> Value {
    json!({
        "_version": 1,
        "_updated_at": "",
        "environment": "testnet",
        "symbols": ["BTCUSDT", "ETHUSDT"],
        "engine": {
            "run_mode": "dry_run",
            "autostart": true,
            "tick_interval_secs": 5,
            "bucket_seconds": 60,
            "position_policy": "ignore",
            "leverage": 3.0,
            "candle_interval": "5m",
            "candle_limit": 120
        },
        "hygiene": {
            "max_spread_pct": 0.1,
            "max_atr_pct": 5.0,
            "max_depth_imbalance": 0.85,
            "max_book_deviation_pct": 1.0,
            "max_consecutive_errors": 5
        },
        "regime": {
            "extreme_atr_pct": 3.5,
            "adx_trend_floor": 20.0,
            "adx_trend_ceiling": 40.0
        },
        "mtf": {
            "score_threshold": 0.5,
            "mult_a": 0.6,
            "mult_b": 0.4,
            "weight_trend_1m": 0.5,
            "weight_trend_5m": 0.3,
            "weight_vol_15m": 0.2
        },
        "meta": {
            "acceptance_floor": 0.25,
            "scaling": {
                "default": { "a": 1.0, "b": 0.0 }
            },
            "weights": {
                "trend_up":   { "trend_pullback": 1.5, "mean_reversion": 0.3, "vol_breakout": 1.0 },
                "trend_down": { "trend_pullback": 1.5, "mean_reversion": 0.3, "vol_breakout": 1.0 },
                "range":      { "trend_pullback": 0.3, "mean_reversion": 1.4, "vol_breakout": 0.6 },
                "high_vol":   { "trend_pullback": 0.5, "mean_reversion": 0.2, "vol_breakout": 0.4 },
                "choppy":     { "trend_pullback": 0.4, "mean_reversion": 0.8, "vol_breakout": 0.5 },
                "unknown":    { "trend_pullback": 0.0, "mean_reversion": 0.0, "vol_breakout": 0.0 }
            }
        },
        "sltp": {
            "k_sl": 1.5,
            "k_tp": 2.0,
            "trailing_mult": 0.5,
            "min_distance_pct": 0.3,
            "fallback_sl_pct": 1.0,
            "fallback_tp_pct": 1.5,
            "trailing_min_move_pct": 0.0,
            "time_stop_bars": 48
        },
        "risk": {
            "check_interval_secs": 30,
            "max_daily_loss_pct": 3.0,
            "max_leverage": 5.0,
            "max_open_orders": 10,
            "max_drawdown_pct": 10.0,
            "risk_pct_per_trade": 1.0,
            "max_position_notional": 25000.0,
            "high_vol_risk_scale": 0.5,
            "sizing_equity_fallback": 10000.0
        },
        "reconcile": {
            "interval_secs": 60,
            "executions_lookback": 50
        },
        "store": {
            "path": "vela.db"
        },
        "strategies": {
            "trend_pullback": { "ema_fast": 21, "ema_slow": 55, "adx_min": 22.0, "pullback_atr": 1.0 },
            "mean_reversion": { "bb_period": 20, "bb_k": 2.0, "limit_ttl_bars": 3, "zscore_guard": 3.0 },
            "vol_breakout":   { "squeeze_width_pct": 2.0, "expansion_pct": 25.0, "lookback": 20 }
        }
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dotted_get_and_set() {
        let cfg = ConfigManager::in_memory();
        assert_eq!(cfg.f64("sltp.k_sl", 0.0), 1.5);
        cfg.set("sltp.k_sl", json!(2.25));
        assert_eq!(cfg.f64("sltp.k_sl", 0.0), 2.25);
        // Missing paths fall back to the default.
        assert_eq!(cfg.f64("sltp.nope", 9.0), 9.0);
    }

    #[test]
    fn set_creates_intermediate_objects() {
        let cfg = ConfigManager::in_memory();
        cfg.set("meta.scaling.mean_reversion.BTCUSDT.a", json!(0.9));
        assert_eq!(cfg.f64("meta.scaling.mean_reversion.BTCUSDT.a", 0.0), 0.9);
    }

    #[test]
    fn environment_defaults_to_testnet() {
        let cfg = ConfigManager::in_memory();
        // Guard: the test environment must not set the override.
        if std::env::var(ENV_VAR).is_err() {
            assert!(cfg.is_testnet());
        }
    }

    #[test]
    fn environment_field_respected() {
        let cfg = ConfigManager::in_memory();
        cfg.set("environment", json!("mainnet"));
        if std::env::var(ENV_VAR).is_err() {
            assert_eq!(cfg.environment(), TradingEnvironment::Mainnet);
        }
    }

    #[test]
    fn save_bumps_version() {
        let dir = std::env::temp_dir().join(format!("vela-cfg-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");
        let cfg = ConfigManager::load(&path);
        let v0 = cfg.version();
        cfg.save().unwrap();
        assert_eq!(cfg.version(), v0 + 1);
        // Reload sees the bumped version.
        let cfg2 = ConfigManager::load(&path);
        assert_eq!(cfg2.version(), v0 + 1);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn merge_fills_missing_sections() {
        let doc = json!({ "_version": 7, "symbols": ["XRPUSDT"] });
        let merged = merge_defaults(doc);
        assert_eq!(merged["_version"], json!(7));
        assert_eq!(merged["symbols"], json!(["XRPUSDT"]));
        assert!(merged["sltp"]["k_sl"].as_f64().is_some());
    }
}
