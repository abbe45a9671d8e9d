// =============================================================================
// Regime scorer — continuous trend/range/volatility/chop scores
// =============================================================================
//
// Unlike a hard classifier, every regime gets a continuous score in [0, 1];
// the label is elected from the scores with one override: high_vol wins
// outright whenever the extreme-ATR condition holds, because no directional
// edge survives a volatility blow-off. Ties resolve trend > range > chop.
//
//   trend      — ADX remapped over [adx_floor, adx_ceiling]
//   range      — inverse trend, boosted by a narrow Bollinger width
//   volatility — ATR% remapped toward the extreme threshold
//   chop       — close-to-close direction flip rate over the window
// =============================================================================

use serde::Serialize;
use tracing::debug;

use crate::features::FeatureFrame;
use crate::indicators::adx::directional_bias;
use crate::market_data::Candle;

/// Dominant regime label. Codes are stable and snake_case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RegimeLabel {
    TrendUp,
    TrendDown,
    Range,
    HighVol,
    Choppy,
    Unknown,
}

impl RegimeLabel {
    pub fn code(self) -> &'static str {
        match self {
            Self::TrendUp => "trend_up",
            Self::TrendDown => "trend_down",
            Self::Range => "range",
            Self::HighVol => "high_vol",
            Self::Choppy => "choppy",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for RegimeLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Continuous regime scores, each in [0, 1].
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RegimeScores {
    pub trend: f64,
    pub range: f64,
    pub volatility: f64,
    pub chop: f64,
}

/// Scores plus the elected label.
#[derive(Debug, Clone, Serialize)]
pub struct RegimeAssessment {
    pub label: RegimeLabel,
    pub scores: RegimeScores,
    pub atr_pct: Option<f64>,
    pub extreme_atr: bool,
}

impl RegimeAssessment {
    pub fn unknown() -> Self {
        Self {
            label: RegimeLabel::Unknown,
            scores: RegimeScores {
                trend: 0.0,
                range: 0.0,
                volatility: 0.0,
                chop: 0.0,
            },
            atr_pct: None,
            extreme_atr: false,
        }
    }

    /// high_vol regimes run with reduced risk.
    pub fn risk_reduced(&self) -> bool {
        self.label == RegimeLabel::HighVol
    }
}

/// Thresholds sourced from config.
#[derive(Debug, Clone, Copy)]
pub struct RegimeScorer {
    pub extreme_atr_pct: f64,
    pub adx_trend_floor: f64,
    pub adx_trend_ceiling: f64,
}

impl Default for RegimeScorer {
    fn default() -> Self {
        Self {
            extreme_atr_pct: 3.5,
            adx_trend_floor: 20.0,
            adx_trend_ceiling: 40.0,
        }
    }
}

/// Minimum closed bars before the scorer will commit to a label.
const MIN_BARS: usize = 30;

impl RegimeScorer {
    /// Score the latest frame. `candles` is the same closed-bar window the
    /// frame was built from (needed for directional bias and flip rate).
    pub fn assess(&self, frame: &FeatureFrame, candles: &[Candle]) -> RegimeAssessment {
        let Some(last) = frame.last() else {
            return RegimeAssessment::unknown();
        };
        if frame.len() < MIN_BARS {
            return RegimeAssessment::unknown();
        }

        let adx = last.adx.unwrap_or(0.0);
        let atr_pct = last.atr_pct;
        let bb_width = last.bb_width.unwrap_or(0.0);

        // --- Trend ---------------------------------------------------------
        let trend = remap(adx, self.adx_trend_floor, self.adx_trend_ceiling, 0.0, 1.0);

        // --- Volatility ------------------------------------------------------
        let volatility = atr_pct
            .map(|pct| remap(pct, 0.3, self.extreme_atr_pct, 0.0, 1.0))
            .unwrap_or(0.0);

        // --- Chop: direction flip rate over the last 20 closes ---------------
        let chop = flip_rate(candles, 20).unwrap_or(0.0);

        // --- Range: weak trend + compressed bands, discounted by chop --------
        let narrow = remap(bb_width, 4.0, 1.0, 0.0, 1.0);
        let range = ((1.0 - trend) * 0.6 + narrow * 0.4) * (1.0 - chop * 0.5);

        let scores = RegimeScores {
            trend,
            range: range.clamp(0.0, 1.0),
            volatility,
            chop,
        };

        let extreme_atr = atr_pct.map(|p| p >= self.extreme_atr_pct).unwrap_or(false);
        let label = self.elect(&scores, extreme_atr, candles);

        debug!(
            symbol = %frame.symbol,
            label = %label,
            trend = format!("{:.2}", scores.trend),
            range = format!("{:.2}", scores.range),
            volatility = format!("{:.2}", scores.volatility),
            chop = format!("{:.2}", scores.chop),
            atr_pct = ?atr_pct,
            extreme_atr,
            "regime assessed"
        );

        RegimeAssessment {
            label,
            scores,
            atr_pct,
            extreme_atr,
        }
    }

    /// Elect the dominant label. high_vol has absolute priority under
    /// extreme ATR; otherwise the highest score wins with the tiebreak
    /// trend > range > chop.
    fn elect(&self, scores: &RegimeScores, extreme_atr: bool, candles: &[Candle]) -> RegimeLabel {
        if extreme_atr {
            return RegimeLabel::HighVol;
        }

        let trend_label = || match directional_bias(candles, 14) {
            Some(1) => RegimeLabel::TrendUp,
            Some(-1) => RegimeLabel::TrendDown,
            // Strong ADX with no directional bias reads as chop.
            _ => RegimeLabel::Choppy,
        };

        // Ordered by tiebreak priority; strictly-greater comparison against
        // later entries makes earlier entries win ties.
        let candidates = [
            (scores.trend, 0usize),
            (scores.range, 1),
            (scores.chop, 2),
        ];
        let winner = candidates
            .iter()
            .fold((f64::MIN, 3usize), |best, &(score, idx)| {
                if score > best.0 {
                    (score, idx)
                } else {
                    best
                }
            });

        match winner.1 {
            0 => trend_label(),
            1 => RegimeLabel::Range,
            2 => RegimeLabel::Choppy,
            _ => RegimeLabel::Unknown,
        }
    }
}

/// Fraction of bar-to-bar close moves that flipped direction.
fn flip_rate(candles: &[Candle], window: usize) -> Option<f64> {
    if candles.len() < window + 2 {
        return None;
    }
    let closes: Vec<f64> = candles[candles.len() - window - 1..]
        .iter()
        .map(|c| c.close)
        .collect();
    let mut flips = 0usize;
    let mut moves = 0usize;
    let mut prev_sign = 0i8;
    for w in closes.windows(2) {
        let diff = w[1] - w[0];
        let sign = if diff > 0.0 {
            1
        } else if diff < 0.0 {
            -1
        } else {
            0
        };
        if sign != 0 {
            if prev_sign != 0 && sign != prev_sign {
                flips += 1;
            }
            if prev_sign != 0 {
                moves += 1;
            }
            prev_sign = sign;
        }
    }
    if moves == 0 {
        return Some(0.0);
    }
    Some(flips as f64 / moves as f64)
}

/// Linearly remap `value` from `[in_lo, in_hi]` to `[out_lo, out_hi]`,
/// clamped to the output range. Works with inverted input ranges.
fn remap(value: f64, in_lo: f64, in_hi: f64, out_lo: f64, out_hi: f64) -> f64 {
    let t = if (in_hi - in_lo).abs() < f64::EPSILON {
        0.5
    } else {
        (value - in_lo) / (in_hi - in_lo)
    };
    out_lo + t.clamp(0.0, 1.0) * (out_hi - out_lo)
}
