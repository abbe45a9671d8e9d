// =============================================================================
// MeanReversion — fade excursions beyond the Bollinger envelope
// =============================================================================
//
// Setup (long; short mirrored):
//   1. The current bar closed below the lower band.
//   2. The volume z-score is not an outright panic (|z| below the guard),
//      because capitulation bars keep going.
//
// Entry is a limit_retest: rest a limit at the band edge with a short TTL so
// a snap-back fills us and a breakdown leaves us flat. The proposal carries
// a take-profit reference at the band midline plus a time stop.
// =============================================================================

use tracing::debug;

use crate::features::FeatureFrame;
use crate::strategy::{EntryMode, ExitRule, SignalProposal, Strategy};
use crate::types::Direction;

pub struct MeanReversion {
    pub limit_ttl_bars: u32,
    pub zscore_guard: f64,
    pub time_stop_bars: u32,
}

impl MeanReversion {
    pub fn new(limit_ttl_bars: u32, zscore_guard: f64, time_stop_bars: u32) -> Self {
        Self {
            limit_ttl_bars,
            zscore_guard,
            time_stop_bars,
        }
    }
}

impl Default for MeanReversion {
    fn default() -> Self {
        Self::new(3, 3.0, 24)
    }
}

impl Strategy for MeanReversion {
    fn name(&self) -> &'static str {
        "mean_reversion"
    }

    fn generate_signal(&mut self, frame: &FeatureFrame) -> Option<SignalProposal> {
        let last = frame.last()?;
        let bb_width = last.bb_width?;
        let atr = last.atr?;
        if atr <= 0.0 || bb_width <= 0.0 {
            return None;
        }

        // The frame stores the band width; rebuild the envelope around the
        // fast EMA, which tracks the SMA midline closely at this period.
        let mid = last.ema_fast.unwrap_or(last.close);
        let half_band = mid * bb_width / 100.0 / 2.0;
        if half_band <= 0.0 {
            return None;
        }
        let lower = mid - half_band;
        let upper = mid + half_band;

        // Capitulation guard: extreme volume means the move is not done.
        if let Some(z) = last.volume_zscore {
            if z.abs() > self.zscore_guard {
                debug!(symbol = %frame.symbol, zscore = z, "mean_reversion: capitulation guard");
                return None;
            }
        }

        let (direction, band_price, excursion) = if last.close < lower {
            (Direction::Long, lower, (lower - last.close) / half_band)
        } else if last.close > upper {
            (Direction::Short, upper, (last.close - upper) / half_band)
        } else {
            return None;
        };

        // Deeper excursions revert harder, saturating at one full band.
        let confidence = (0.4 + excursion * 0.5).clamp(0.0, 0.9);

        debug!(
            symbol = %frame.symbol,
            %direction,
            excursion = format!("{:.2}", excursion),
            band_price,
            confidence = format!("{:.2}", confidence),
            "mean_reversion setup"
        );

        Some(
            SignalProposal::new(
                self.name(),
                &frame.symbol,
                direction,
                confidence,
                EntryMode::LimitRetest,
            )
            .reason("band_excursion")
            .value("bb_width", bb_width)
            .value("excursion_bands", excursion)
            .value("band_price", band_price)
            .limit(band_price, self.limit_ttl_bars)
            .exit(ExitRule::TakeProfitAt { price: mid })
            .exit(ExitRule::TimeStop {
                max_bars: self.time_stop_bars,
            }),
        )
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{build_frame, PipelineParams};
    use crate::market_data::Candle;

    fn candle(i: i64, close: f64) -> Candle {
        Candle {
            open_time: i * 300_000,
            close_time: (i + 1) * 300_000 - 1,
            interval: "5m".into(),
            open: close + 0.1,
            high: close + 0.5,
            low: close - 0.5,
            close,
            volume: 100.0,
            is_closed: true,
        }
    }

    /// Range-bound series ending with a plunge through the lower band.
    fn plunge_series() -> Vec<Candle> {
        let mut out: Vec<Candle> = (0..70_i64)
            .map(|i| candle(i, 100.0 + if i % 2 == 0 { 0.4 } else { -0.4 }))
            .collect();
        out.push(candle(70, 97.0));
        out
    }

    #[test]
    fn fires_long_below_lower_band() {
        let candles = plunge_series();
        let frame = build_frame("BTCUSDT", "5m", &candles, None, None, &PipelineParams::default());
        let mut strat = MeanReversion::default();
        let prop = strat.generate_signal(&frame).expect("signal expected");
        assert_eq!(prop.direction, Direction::Long);
        assert_eq!(prop.entry_mode, EntryMode::LimitRetest);
        let hint = prop.limit_hint.expect("limit hint expected");
        assert_eq!(hint.ttl_bars, 3);
        assert!(hint.price > 97.0 && hint.price < 101.0);
        assert!(prop
            .exit_rules
            .iter()
            .any(|r| matches!(r, ExitRule::TakeProfitAt { .. })));
    }

    #[test]
    fn silent_inside_the_bands() {
        let candles: Vec<Candle> = (0..70_i64)
            .map(|i| candle(i, 100.0 + if i % 2 == 0 { 0.4 } else { -0.4 }))
            .collect();
        let frame = build_frame("BTCUSDT", "5m", &candles, None, None, &PipelineParams::default());
        let mut strat = MeanReversion::default();
        assert!(strat.generate_signal(&frame).is_none());
    }

    #[test]
    fn capitulation_volume_suppresses_signal() {
        let mut candles = plunge_series();
        // Re-issue the plunge bar with a volume explosion.
        let mut last = candles.pop().unwrap();
        last.volume = 5_000.0;
        candles.push(last);
        let frame = build_frame("BTCUSDT", "5m", &candles, None, None, &PipelineParams::default());
        let mut strat = MeanReversion::default();
        assert!(strat.generate_signal(&frame).is_none());
    }
}
