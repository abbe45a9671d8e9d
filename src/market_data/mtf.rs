// =============================================================================
// Multi-timeframe confluence scoring
// =============================================================================
//
// Combines three sub-signals into one score in [0, 1]:
//
//   trend_1m   (weight 0.5) — EMA(9)/EMA(21) alignment with the direction
//   trend_5m   (weight 0.3) — same stack on 5M
//   vol_15m    (weight 0.2) — 15M ATR% inside the tradeable band
//
// A sub-signal whose timeframe lacks data contributes the neutral value 0.5
// at HALF its weight, so missing data pulls the score toward neutral without
// dominating the bars that are present.
//
// The meta-layer turns the score into a soft confidence multiplier
// (clamp(a*score + b, 0, 1)); the score alone never hard-rejects a trade.
// =============================================================================

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::debug;

use crate::indicators::atr::atr_pct;
use crate::indicators::ema::ema_series;
use crate::market_data::candle_buffer::{CandleBuffer, CandleKey};
use crate::types::Direction;

const NEUTRAL: f64 = 0.5;

/// Sub-signal weights. Defaults mirror the configured 0.5 / 0.3 / 0.2 split.
#[derive(Debug, Clone, Copy)]
pub struct MtfWeights {
    pub trend_1m: f64,
    pub trend_5m: f64,
    pub vol_15m: f64,
}

impl Default for MtfWeights {
    fn default() -> Self {
        Self {
            trend_1m: 0.5,
            trend_5m: 0.3,
            vol_15m: 0.2,
        }
    }
}

/// Confluence score plus the per-sub-signal breakdown for observability.
#[derive(Debug, Clone, Serialize)]
pub struct MtfScore {
    pub score: f64,
    pub breakdown: BTreeMap<String, f64>,
}

impl MtfScore {
    /// Neutral score used when no MTF data exists at all.
    pub fn neutral() -> Self {
        Self {
            score: NEUTRAL,
            breakdown: BTreeMap::new(),
        }
    }
}

/// Compute the confluence score for `direction` on `symbol`.
pub fn confluence_score(
    buffer: &CandleBuffer,
    symbol: &str,
    direction: Direction,
    weights: &MtfWeights,
) -> MtfScore {
    let mut breakdown = BTreeMap::new();
    let mut weighted_sum = 0.0;
    let mut weight_total = 0.0;

    let mut add = |name: &str, value: Option<f64>, weight: f64| {
        let (v, w) = match value {
            Some(v) => (v, weight),
            // Missing input: neutral at reduced (half) weight.
            None => (NEUTRAL, weight / 2.0),
        };
        breakdown.insert(name.to_string(), v);
        weighted_sum += v * w;
        weight_total += w;
    };

    add(
        "trend_1m",
        trend_alignment(buffer, symbol, "1m", direction),
        weights.trend_1m,
    );
    add(
        "trend_5m",
        trend_alignment(buffer, symbol, "5m", direction),
        weights.trend_5m,
    );
    add(
        "vol_15m",
        volatility_band(buffer, symbol, "15m"),
        weights.vol_15m,
    );

    let score = if weight_total > 0.0 {
        (weighted_sum / weight_total).clamp(0.0, 1.0)
    } else {
        NEUTRAL
    };

    debug!(symbol, %direction, score, ?breakdown, "mtf confluence computed");

    MtfScore { score, breakdown }
}

/// EMA(9)/EMA(21) alignment mapped onto [0, 1] from the direction's point of
/// view: 1.0 fully aligned, 0.0 fully against, graded in between by the
/// normalized separation.
fn trend_alignment(
    buffer: &CandleBuffer,
    symbol: &str,
    interval: &str,
    direction: Direction,
) -> Option<f64> {
    let key = CandleKey::new(symbol, interval);
    let closes: Vec<f64> = buffer
        .get_closed(&key, 100)
        .iter()
        .map(|c| c.close)
        .collect();
    if closes.len() < 21 {
        return None;
    }

    let fast = *ema_series(&closes, 9).last()?;
    let slow = *ema_series(&closes, 21).last()?;
    if slow.abs() < f64::EPSILON {
        return None;
    }

    // Separation in percent, saturating at ±0.5% for full conviction.
    let sep_pct = (fast - slow) / slow * 100.0;
    let graded = (sep_pct / 0.5).clamp(-1.0, 1.0);

    let oriented = match direction {
        Direction::Long | Direction::CloseShort => graded,
        Direction::Short | Direction::CloseLong => -graded,
    };
    Some((oriented + 1.0) / 2.0)
}

/// 15M volatility regime: full marks when ATR% sits in a moderate band,
/// degrading toward 0 as it becomes dead or extreme.
fn volatility_band(buffer: &CandleBuffer, symbol: &str, interval: &str) -> Option<f64> {
    let key = CandleKey::new(symbol, interval);
    let candles = buffer.get_closed(&key, 60);
    let pct = atr_pct(&candles, 14)?;

    // Below 0.05% the market is asleep; above 3% it is disorderly.
    let score = if pct < 0.05 {
        pct / 0.05 * 0.5
    } else if pct <= 1.0 {
        1.0
    } else if pct <= 3.0 {
        1.0 - (pct - 1.0) / 2.0 * 0.8
    } else {
        0.1
    };
    Some(score.clamp(0.0, 1.0))
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::Candle;

    fn closed(open_time: i64, close: f64, interval: &str) -> Candle {
        Candle {
            open_time,
            close_time: open_time + 59_999,
            interval: interval.into(),
            open: close - 0.2,
            high: close + 0.5,
            low: close - 0.7,
            close,
            volume: 100.0,
            is_closed: true,
        }
    }

    fn fill(buffer: &CandleBuffer, symbol: &str, interval: &str, slope: f64) {
        let key = CandleKey::new(symbol, interval);
        for i in 0..60 {
            buffer.update(
                key.clone(),
                closed(i * 60_000, 100.0 + i as f64 * slope, interval),
            );
        }
    }

    #[test]
    fn all_timeframes_missing_is_neutral_score() {
        let buffer = CandleBuffer::new(200);
        let s = confluence_score(&buffer, "BTCUSDT", Direction::Long, &MtfWeights::default());
        assert!((s.score - 0.5).abs() < 1e-9);
        assert_eq!(s.breakdown.get("trend_1m"), Some(&0.5));
    }

    #[test]
    fn aligned_uptrend_scores_high_for_long() {
        let buffer = CandleBuffer::new(200);
        fill(&buffer, "BTCUSDT", "1m", 0.8);
        fill(&buffer, "BTCUSDT", "5m", 0.8);
        fill(&buffer, "BTCUSDT", "15m", 0.02);
        let s = confluence_score(&buffer, "BTCUSDT", Direction::Long, &MtfWeights::default());
        assert!(s.score > 0.7, "score {}", s.score);
        assert_eq!(s.breakdown.len(), 3);
    }

    #[test]
    fn aligned_uptrend_scores_low_for_short() {
        let buffer = CandleBuffer::new(200);
        fill(&buffer, "BTCUSDT", "1m", 0.8);
        fill(&buffer, "BTCUSDT", "5m", 0.8);
        fill(&buffer, "BTCUSDT", "15m", 0.02);
        let s = confluence_score(&buffer, "BTCUSDT", Direction::Short, &MtfWeights::default());
        assert!(s.score < 0.5, "score {}", s.score);
    }

    #[test]
    fn missing_timeframe_contributes_reduced_weight() {
        let buffer = CandleBuffer::new(200);
        // Only 1m present, strongly bullish.
        fill(&buffer, "BTCUSDT", "1m", 0.8);
        let s = confluence_score(&buffer, "BTCUSDT", Direction::Long, &MtfWeights::default());
        // 1m contributes ~1.0 * 0.5; 5m and 15m contribute 0.5 at half weight.
        // Expected ≈ (1.0*0.5 + 0.5*0.15 + 0.5*0.1) / 0.75 ≈ 0.83
        assert!(s.score > 0.75 && s.score < 0.95, "score {}", s.score);
    }
}
