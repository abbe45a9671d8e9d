// =============================================================================
// SL/TP manager — levels, trading-stop lifecycle, virtual safety net
// =============================================================================
//
// On entry the stop and target derive from the current ATR:
//
//   long:  SL = entry - k_sl * ATR,   TP = entry + k_tp * ATR
//   short: reflected
//
// with percentage fallbacks when ATR is unavailable and a minimum distance
// floor. The primary mechanism is the venue's trading-stop call — one
// request sets or clears both levels on the position and is inherently
// reduce-only, so there are no conditional-order handles to babysit. A
// virtual path watches live price as a safety net and market-closes when the
// venue path is unavailable.
//
// Trailing is a stepped ratchet: for every full ATR of favorable movement
// the stop advances by trailing_mult * ATR from entry, and it only ever
// tightens.
//
// State machine per position:
//   active -> (sl_hit | tp_hit | time_stop | closed_by_signal) -> closed
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::errors::EngineResult;
use crate::exchange::BybitClient;
use crate::store::{SlTpRecord, Store};
use crate::types::PositionSide;

/// Why a position left the market. Codes are stable snake_case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExitReason {
    SlHit,
    TpHit,
    TimeStop,
    ClosedBySignal,
}

impl ExitReason {
    pub fn code(self) -> &'static str {
        match self {
            Self::SlHit => "sl_hit",
            Self::TpHit => "tp_hit",
            Self::TimeStop => "time_stop",
            Self::ClosedBySignal => "closed_by_signal",
        }
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SlTpState {
    Active,
    Exited(ExitReason),
    Closed,
}

/// Config-sourced multipliers and floors.
#[derive(Debug, Clone, Copy)]
pub struct SlTpConfig {
    pub k_sl: f64,
    pub k_tp: f64,
    pub trailing_mult: f64,
    /// Minimum SL/TP distance as percent of entry.
    pub min_distance_pct: f64,
    /// Fallbacks when ATR is unavailable, percent of entry.
    pub fallback_sl_pct: f64,
    pub fallback_tp_pct: f64,
    /// Minimum favorable move (percent of entry) before a trailing update
    /// is pushed to the venue; 0 updates on every favorable step.
    pub trailing_min_move_pct: f64,
    /// Bars in position before the time stop fires (0 disables).
    pub time_stop_bars: u32,
}

impl Default for SlTpConfig {
    fn default() -> Self {
        Self {
            k_sl: 1.5,
            k_tp: 2.0,
            trailing_mult: 0.5,
            min_distance_pct: 0.3,
            fallback_sl_pct: 1.0,
            fallback_tp_pct: 1.5,
            trailing_min_move_pct: 0.0,
            time_stop_bars: 48,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SlTpLevels {
    pub sl: f64,
    pub tp: f64,
}

/// Compute entry levels. Geometry invariant: long => SL < entry < TP,
/// short => TP < entry < SL; both distances respect the configured floor.
pub fn compute_levels(
    side: PositionSide,
    entry: f64,
    atr: Option<f64>,
    cfg: &SlTpConfig,
) -> SlTpLevels {
    let min_dist = entry * cfg.min_distance_pct / 100.0;

    let sl_dist = atr
        .filter(|a| *a > 0.0)
        .map(|a| cfg.k_sl * a)
        .unwrap_or(entry * cfg.fallback_sl_pct / 100.0)
        .max(min_dist);
    let tp_dist = atr
        .filter(|a| *a > 0.0)
        .map(|a| cfg.k_tp * a)
        .unwrap_or(entry * cfg.fallback_tp_pct / 100.0)
        .max(min_dist);

    match side {
        PositionSide::Short => SlTpLevels {
            sl: entry + sl_dist,
            tp: entry - tp_dist,
        },
        // Flat never reaches here in practice; treat it as long geometry.
        _ => SlTpLevels {
            sl: entry - sl_dist,
            tp: entry + tp_dist,
        },
    }
}

/// Live tracking state for one position's levels.
#[derive(Debug, Clone, Serialize)]
pub struct SlTpTracker {
    pub position_id: String,
    pub symbol: String,
    pub side: PositionSide,
    pub entry: f64,
    pub qty: f64,
    pub atr: Option<f64>,
    pub sl: f64,
    pub tp: f64,
    pub closed_qty: f64,
    pub state: SlTpState,
    /// Bars observed since entry, for the time stop.
    pub bars_held: u32,
    pub max_bars: u32,
}

impl SlTpTracker {
    /// Virtual trigger check against the latest price. Long SL triggers on
    /// price <= SL, long TP on price >= TP; short reflected.
    pub fn check_virtual(&self, price: f64) -> Option<ExitReason> {
        if self.state != SlTpState::Active {
            return None;
        }
        match self.side {
            PositionSide::Long => {
                if price <= self.sl {
                    Some(ExitReason::SlHit)
                } else if price >= self.tp {
                    Some(ExitReason::TpHit)
                } else {
                    None
                }
            }
            PositionSide::Short => {
                if price >= self.sl {
                    Some(ExitReason::SlHit)
                } else if price <= self.tp {
                    Some(ExitReason::TpHit)
                } else {
                    None
                }
            }
            PositionSide::Flat => None,
        }
    }

    /// Count a closed bar; fires the time stop when the budget is spent.
    pub fn on_bar_close(&mut self) -> Option<ExitReason> {
        if self.state != SlTpState::Active || self.max_bars == 0 {
            return None;
        }
        self.bars_held += 1;
        if self.bars_held >= self.max_bars {
            Some(ExitReason::TimeStop)
        } else {
            None
        }
    }

    /// Stepped trailing candidate: for each full ATR of favorable movement,
    /// the stop sits trailing_mult * ATR * steps from entry. Returns the new
    /// stop only when it tightens by at least the min-move threshold.
    pub fn trailing_candidate(&self, price: f64, cfg: &SlTpConfig) -> Option<f64> {
        if self.state != SlTpState::Active {
            return None;
        }
        let atr = self.atr.filter(|a| *a > 0.0)?;
        let min_move = self.entry * cfg.trailing_min_move_pct / 100.0;

        match self.side {
            PositionSide::Long => {
                let steps = ((price - self.entry) / atr).floor();
                if steps < 1.0 {
                    return None;
                }
                let candidate = self.entry + cfg.trailing_mult * atr * steps;
                // Ratchet only: never widen, and clear the churn threshold.
                (candidate > self.sl + min_move && candidate < price).then_some(candidate)
            }
            PositionSide::Short => {
                let steps = ((self.entry - price) / atr).floor();
                if steps < 1.0 {
                    return None;
                }
                let candidate = self.entry - cfg.trailing_mult * atr * steps;
                (candidate < self.sl - min_move && candidate > price).then_some(candidate)
            }
            PositionSide::Flat => None,
        }
    }
}

/// Owns the venue trading-stop lifecycle plus the persisted level records.
pub struct SlTpManager {
    client: Arc<BybitClient>,
    store: Arc<Store>,
    pub cfg: SlTpConfig,
}

impl SlTpManager {
    pub fn new(client: Arc<BybitClient>, store: Arc<Store>, cfg: SlTpConfig) -> Self {
        Self { client, store, cfg }
    }

    /// Compute levels for a fresh entry, push the venue trading stop (one
    /// call, both levels), persist the record, and return the tracker.
    ///
    /// `tp_override` honors a strategy's take-profit-at-reference exit rule;
    /// it is ignored when it sits on the wrong side of the entry.
    #[allow(clippy::too_many_arguments)]
    pub async fn attach(
        &self,
        position_id: &str,
        symbol: &str,
        side: PositionSide,
        entry: f64,
        qty: f64,
        atr: Option<f64>,
        tp_override: Option<f64>,
        live: bool,
    ) -> EngineResult<SlTpTracker> {
        let mut levels = compute_levels(side, entry, atr, &self.cfg);
        if let Some(tp) = tp_override {
            let profitable = match side {
                PositionSide::Long => tp > entry,
                PositionSide::Short => tp < entry,
                PositionSide::Flat => false,
            };
            if profitable {
                levels.tp = tp;
            }
        }

        if live {
            self.client
                .set_trading_stop(symbol, Some(levels.sl), Some(levels.tp))
                .await?;
        }

        let record = SlTpRecord {
            position_id: position_id.to_string(),
            symbol: symbol.to_string(),
            side: side.to_string(),
            entry,
            qty,
            atr,
            sl: levels.sl,
            tp: levels.tp,
            closed_qty: 0.0,
            sl_hit: false,
            tp_hit: false,
            created_at: Utc::now().to_rfc3339(),
        };
        self.store.insert_sl_tp(&record)?;

        info!(
            symbol,
            position_id,
            %side,
            entry,
            sl = levels.sl,
            tp = levels.tp,
            ?atr,
            live,
            "SL/TP attached"
        );

        Ok(SlTpTracker {
            position_id: position_id.to_string(),
            symbol: symbol.to_string(),
            side,
            entry,
            qty,
            atr,
            sl: levels.sl,
            tp: levels.tp,
            closed_qty: 0.0,
            state: SlTpState::Active,
            bars_held: 0,
            max_bars: self.cfg.time_stop_bars,
        })
    }

    /// Push a ratcheted stop to the venue and persist it.
    pub async fn update_trailing(
        &self,
        tracker: &mut SlTpTracker,
        price: f64,
        live: bool,
    ) -> EngineResult<bool> {
        let Some(new_sl) = tracker.trailing_candidate(price, &self.cfg) else {
            return Ok(false);
        };

        if live {
            self.client
                .set_trading_stop(&tracker.symbol, Some(new_sl), Some(tracker.tp))
                .await?;
        }
        self.store.update_sl(&tracker.position_id, new_sl)?;

        debug!(
            symbol = %tracker.symbol,
            position_id = %tracker.position_id,
            old_sl = tracker.sl,
            new_sl,
            price,
            "trailing stop ratcheted"
        );
        tracker.sl = new_sl;
        Ok(true)
    }

    /// Record a partial close against the level; the trading stop stays in
    /// force for the remainder.
    pub fn on_partial_close(&self, tracker: &mut SlTpTracker, qty: f64) -> EngineResult<()> {
        tracker.closed_qty += qty;
        self.store.add_closed_qty(&tracker.position_id, qty)?;
        debug!(
            position_id = %tracker.position_id,
            closed_qty = tracker.closed_qty,
            remaining = tracker.qty - tracker.closed_qty,
            "partial close recorded"
        );
        Ok(())
    }

    /// Transition the tracker through the exit and clear the venue stop.
    pub async fn finalize_exit(
        &self,
        tracker: &mut SlTpTracker,
        reason: ExitReason,
        live: bool,
    ) -> EngineResult<()> {
        tracker.state = SlTpState::Exited(reason);

        self.store.mark_sl_tp_hit(
            &tracker.position_id,
            reason == ExitReason::SlHit,
            reason == ExitReason::TpHit,
        )?;

        // Clearing an already-consumed stop is harmless; clearing after a
        // signal exit is required.
        if live {
            if let Err(e) = self.client.set_trading_stop(&tracker.symbol, None, None).await {
                warn!(symbol = %tracker.symbol, error = %e, "failed to clear trading stop");
            }
        }

        tracker.state = SlTpState::Closed;
        info!(
            symbol = %tracker.symbol,
            position_id = %tracker.position_id,
            exit_reason = reason.code(),
            "position exit finalized"
        );
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(side: PositionSide, entry: f64, atr: f64, cfg: &SlTpConfig) -> SlTpTracker {
        let levels = compute_levels(side, entry, Some(atr), cfg);
        SlTpTracker {
            position_id: "p1".into(),
            symbol: "BTCUSDT".into(),
            side,
            entry,
            qty: 0.01,
            atr: Some(atr),
            sl: levels.sl,
            tp: levels.tp,
            closed_qty: 0.0,
            state: SlTpState::Active,
            bars_held: 0,
            max_bars: cfg.time_stop_bars,
        }
    }

    #[test]
    fn atr_levels_for_long() {
        let cfg = SlTpConfig::default();
        let levels = compute_levels(PositionSide::Long, 50_000.0, Some(500.0), &cfg);
        assert!((levels.sl - 49_250.0).abs() < 1e-9);
        assert!((levels.tp - 51_000.0).abs() < 1e-9);
    }

    #[test]
    fn geometry_invariant_both_sides() {
        let cfg = SlTpConfig::default();
        for atr in [None, Some(10.0), Some(500.0)] {
            let long = compute_levels(PositionSide::Long, 50_000.0, atr, &cfg);
            assert!(long.sl < 50_000.0 && 50_000.0 < long.tp, "long {atr:?}");
            let short = compute_levels(PositionSide::Short, 50_000.0, atr, &cfg);
            assert!(short.tp < 50_000.0 && 50_000.0 < short.sl, "short {atr:?}");
        }
    }

    #[test]
    fn minimum_distance_floor_applies() {
        let cfg = SlTpConfig::default();
        // Tiny ATR: 1.5 * 10 = 15 < 150 (0.3% of 50k) -> floored to 150.
        let levels = compute_levels(PositionSide::Long, 50_000.0, Some(10.0), &cfg);
        assert!((50_000.0 - levels.sl - 150.0).abs() < 1e-9);
        assert!((levels.tp - 50_000.0 - 150.0).abs() < 1e-9);
    }

    #[test]
    fn percentage_fallback_without_atr() {
        let cfg = SlTpConfig::default();
        let levels = compute_levels(PositionSide::Long, 50_000.0, None, &cfg);
        assert!((50_000.0 - levels.sl - 500.0).abs() < 1e-9); // 1.0%
        assert!((levels.tp - 50_000.0 - 750.0).abs() < 1e-9); // 1.5%
    }

    #[test]
    fn trailing_ratchets_up_and_never_widens() {
        let cfg = SlTpConfig::default();
        let mut t = tracker(PositionSide::Long, 50_000.0, 500.0, &cfg);
        assert!((t.sl - 49_250.0).abs() < 1e-9);

        // Favorable move to 51 200: two full ATRs -> SL = 50 000 + 0.5*500*2.
        let new_sl = t.trailing_candidate(51_200.0, &cfg).expect("ratchet");
        assert!((new_sl - 50_500.0).abs() < 1e-9);
        t.sl = new_sl;

        // Price retreats: candidate would be lower — never widen.
        assert!(t.trailing_candidate(50_600.0, &cfg).is_none());
        // No movement beyond a full ATR from entry: nothing to do.
        assert!(t.trailing_candidate(50_400.0, &cfg).is_none());
    }

    #[test]
    fn trailing_short_mirrors() {
        let cfg = SlTpConfig::default();
        let mut t = tracker(PositionSide::Short, 50_000.0, 500.0, &cfg);
        let new_sl = t.trailing_candidate(48_800.0, &cfg).expect("ratchet");
        assert!((new_sl - 49_500.0).abs() < 1e-9);
        t.sl = new_sl;
        assert!(t.trailing_candidate(49_400.0, &cfg).is_none());
    }

    #[test]
    fn trailing_min_move_suppresses_churn() {
        let cfg = SlTpConfig {
            trailing_min_move_pct: 5.0, // absurdly large threshold
            ..SlTpConfig::default()
        };
        let t = tracker(PositionSide::Long, 50_000.0, 500.0, &cfg);
        assert!(t.trailing_candidate(51_200.0, &cfg).is_none());
    }

    #[test]
    fn virtual_triggers_long_and_short() {
        let cfg = SlTpConfig::default();
        let long = tracker(PositionSide::Long, 50_000.0, 500.0, &cfg);
        assert_eq!(long.check_virtual(49_250.0), Some(ExitReason::SlHit));
        assert_eq!(long.check_virtual(49_100.0), Some(ExitReason::SlHit));
        assert_eq!(long.check_virtual(51_000.0), Some(ExitReason::TpHit));
        assert_eq!(long.check_virtual(50_500.0), None);

        let short = tracker(PositionSide::Short, 50_000.0, 500.0, &cfg);
        assert_eq!(short.check_virtual(50_750.0), Some(ExitReason::SlHit));
        assert_eq!(short.check_virtual(49_000.0), Some(ExitReason::TpHit));
        assert_eq!(short.check_virtual(50_200.0), None);
    }

    #[test]
    fn time_stop_counts_bars() {
        let cfg = SlTpConfig {
            time_stop_bars: 3,
            ..SlTpConfig::default()
        };
        let mut t = tracker(PositionSide::Long, 50_000.0, 500.0, &cfg);
        assert_eq!(t.on_bar_close(), None);
        assert_eq!(t.on_bar_close(), None);
        assert_eq!(t.on_bar_close(), Some(ExitReason::TimeStop));
    }

    #[test]
    fn exit_reason_codes() {
        assert_eq!(ExitReason::SlHit.code(), "sl_hit");
        assert_eq!(ExitReason::TpHit.code(), "tp_hit");
        assert_eq!(ExitReason::TimeStop.code(), "time_stop");
        assert_eq!(ExitReason::ClosedBySignal.code(), "closed_by_signal");
    }

    #[tokio::test]
    async fn attach_persists_levels_without_venue_in_dry_run() {
        let client = Arc::new(BybitClient::new("k", "s", true));
        let store = Arc::new(Store::open_in_memory().unwrap());
        let mgr = SlTpManager::new(client, store.clone(), SlTpConfig::default());

        let tracker = mgr
            .attach(
                "p1",
                "BTCUSDT",
                PositionSide::Long,
                50_000.0,
                0.01,
                Some(500.0),
                None,
                false,
            )
            .await
            .unwrap();
        assert!((tracker.sl - 49_250.0).abs() < 1e-9);
        assert!((tracker.tp - 51_000.0).abs() < 1e-9);

        let rec = store.get_sl_tp("p1").unwrap().unwrap();
        assert!((rec.sl - 49_250.0).abs() < 1e-9);
        assert_eq!(rec.closed_qty, 0.0);
    }

    #[tokio::test]
    async fn reference_take_profit_overrides_when_profitable() {
        let client = Arc::new(BybitClient::new("k", "s", true));
        let store = Arc::new(Store::open_in_memory().unwrap());
        let mgr = SlTpManager::new(client, store, SlTpConfig::default());

        let t = mgr
            .attach(
                "p2",
                "BTCUSDT",
                PositionSide::Long,
                50_000.0,
                0.01,
                Some(500.0),
                Some(50_600.0),
                false,
            )
            .await
            .unwrap();
        assert!((t.tp - 50_600.0).abs() < 1e-9);

        // An override below a long entry violates the geometry and is
        // ignored.
        let t = mgr
            .attach(
                "p3",
                "BTCUSDT",
                PositionSide::Long,
                50_000.0,
                0.01,
                Some(500.0),
                Some(49_000.0),
                false,
            )
            .await
            .unwrap();
        assert!((t.tp - 51_000.0).abs() < 1e-9);
    }
}
