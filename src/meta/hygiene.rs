// =============================================================================
// Hygiene filter — data-quality and market-condition no-trade zones
// =============================================================================
//
// When any gate fires, ALL candidates on the tick are blocked, not just one.
// The verdict records which gate fired and, for anomaly blocks, the specific
// sub-flags (e.g. anomaly_wick=1) so rejected ticks are fully auditable.
//
// Gates, in evaluation order:
//   excessive_spread, extreme_volatility, orderbook_invalid,
//   depth_imbalance_extreme, anomaly_block, too_many_errors
// =============================================================================

use serde::Serialize;
use tracing::debug;

use crate::errors::RejectReason;
use crate::features::FeatureFrame;

/// Config-sourced thresholds.
#[derive(Debug, Clone, Copy)]
pub struct HygieneParams {
    /// Max bid/ask spread as percent of mid.
    pub max_spread_pct: f64,
    /// Max ATR% before the market is considered untradeable.
    pub max_atr_pct: f64,
    /// Max |depth imbalance| before the book is considered one-sided.
    pub max_depth_imbalance: f64,
    /// Consecutive engine errors before trading pauses.
    pub max_consecutive_errors: u32,
}

impl Default for HygieneParams {
    fn default() -> Self {
        Self {
            max_spread_pct: 0.1,
            max_atr_pct: 5.0,
            max_depth_imbalance: 0.85,
            max_consecutive_errors: 5,
        }
    }
}

/// Outcome of the hygiene evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct HygieneVerdict {
    pub blocked: bool,
    pub reason: Option<RejectReason>,
    /// Anomaly sub-flags that fired (stable codes), empty unless the reason
    /// is `anomaly_block`.
    pub sub_flags: Vec<String>,
    /// Numeric inputs behind the decision, for the structured log record.
    pub observed: Vec<(String, f64)>,
}

impl HygieneVerdict {
    fn pass() -> Self {
        Self {
            blocked: false,
            reason: None,
            sub_flags: Vec::new(),
            observed: Vec::new(),
        }
    }

    fn block(reason: RejectReason, observed: Vec<(String, f64)>) -> Self {
        Self {
            blocked: true,
            reason: Some(reason),
            sub_flags: Vec::new(),
            observed,
        }
    }
}

pub struct HygieneFilter {
    pub params: HygieneParams,
}

impl HygieneFilter {
    pub fn new(params: HygieneParams) -> Self {
        Self { params }
    }

    /// Evaluate all gates against the latest frame. `consecutive_errors` is
    /// the bot's current error streak.
    pub fn evaluate(&self, frame: &FeatureFrame, consecutive_errors: u32) -> HygieneVerdict {
        let p = &self.params;

        // --- Spread -------------------------------------------------------
        if let Some(of) = &frame.orderflow {
            if of.spread_pct > p.max_spread_pct {
                let v = HygieneVerdict::block(
                    RejectReason::NoTradeZoneSpread,
                    vec![("spread_pct".into(), of.spread_pct)],
                );
                debug!(symbol = %frame.symbol, spread_pct = of.spread_pct, "hygiene: excessive_spread");
                return v;
            }
        }

        // --- Extreme volatility -------------------------------------------
        if let Some(atr_pct) = frame.last().and_then(|r| r.atr_pct) {
            if atr_pct > p.max_atr_pct {
                let v = HygieneVerdict::block(
                    RejectReason::NoTradeZoneAtr,
                    vec![("atr_pct".into(), atr_pct)],
                );
                debug!(symbol = %frame.symbol, atr_pct, "hygiene: extreme_volatility");
                return v;
            }
        }

        // --- Orderbook sanity ----------------------------------------------
        if let Some(of) = &frame.orderflow {
            if !of.book_valid {
                debug!(symbol = %frame.symbol, "hygiene: orderbook_invalid");
                return HygieneVerdict::block(RejectReason::OrderbookInvalid, Vec::new());
            }
            if of.depth_imbalance.abs() > p.max_depth_imbalance {
                let v = HygieneVerdict::block(
                    RejectReason::DepthImbalanceExtreme,
                    vec![("depth_imbalance".into(), of.depth_imbalance)],
                );
                debug!(symbol = %frame.symbol, imbalance = of.depth_imbalance, "hygiene: depth_imbalance_extreme");
                return v;
            }
        }

        // --- Anomalies on the decision bar ---------------------------------
        if let Some(last) = frame.last() {
            if last.anomalies.any() {
                let sub_flags: Vec<String> = last
                    .anomalies
                    .active()
                    .into_iter()
                    .map(str::to_string)
                    .collect();
                debug!(symbol = %frame.symbol, ?sub_flags, "hygiene: anomaly_block");
                let mut v = HygieneVerdict::block(RejectReason::AnomalyBlock, Vec::new());
                v.sub_flags = sub_flags;
                return v;
            }
        }

        // --- Error streak ----------------------------------------------------
        if consecutive_errors >= p.max_consecutive_errors {
            let v = HygieneVerdict::block(
                RejectReason::TooManyErrors,
                vec![("consecutive_errors".into(), consecutive_errors as f64)],
            );
            debug!(symbol = %frame.symbol, consecutive_errors, "hygiene: too_many_errors");
            return v;
        }

        HygieneVerdict::pass()
    }
}
