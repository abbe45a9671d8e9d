// =============================================================================
// VolBreakout — trade the expansion out of a volatility squeeze
// =============================================================================
//
// Setup (long; short mirrored):
//   1. Squeeze context: Bollinger width was compressed (below the squeeze
//      ceiling) and is now expanding (width change above the threshold).
//   2. Trigger: the current bar closed beyond the recent N-bar extreme.
//
// Fires immediately on the closed trigger bar and attaches an ATR stop, since
// failed breakouts die fast.
// =============================================================================

use tracing::debug;

use crate::features::FeatureFrame;
use crate::strategy::{EntryMode, ExitRule, SignalProposal, Strategy};
use crate::types::Direction;

pub struct VolBreakout {
    pub squeeze_width_pct: f64,
    pub expansion_pct: f64,
    pub lookback: usize,
}

impl VolBreakout {
    pub fn new(squeeze_width_pct: f64, expansion_pct: f64, lookback: usize) -> Self {
        Self {
            squeeze_width_pct,
            expansion_pct,
            lookback,
        }
    }
}

impl Default for VolBreakout {
    fn default() -> Self {
        Self::new(2.0, 25.0, 20)
    }
}

impl Strategy for VolBreakout {
    fn name(&self) -> &'static str {
        "vol_breakout"
    }

    fn generate_signal(&mut self, frame: &FeatureFrame) -> Option<SignalProposal> {
        let last = frame.last()?;
        let width = last.bb_width?;
        let expansion = last.bb_width_change_pct?;
        last.atr?;

        if frame.len() < self.lookback + 2 {
            return None;
        }

        // Expansion out of compression; a wide, already-volatile band is not
        // a squeeze break.
        if width > self.squeeze_width_pct * (1.0 + self.expansion_pct / 100.0)
            || expansion < self.expansion_pct
        {
            return None;
        }

        // N-bar extreme excluding the trigger bar.
        let window = &frame.rows[frame.len() - 1 - self.lookback..frame.len() - 1];
        let recent_high = window.iter().map(|r| r.high).fold(f64::MIN, f64::max);
        let recent_low = window.iter().map(|r| r.low).fold(f64::MAX, f64::min);

        let direction = if last.close > recent_high {
            Direction::Long
        } else if last.close < recent_low {
            Direction::Short
        } else {
            return None;
        };

        // Stronger expansion, stronger conviction; saturate at 3x threshold.
        let confidence = (0.4 + (expansion / self.expansion_pct - 1.0) * 0.15).clamp(0.3, 0.85);

        debug!(
            symbol = %frame.symbol,
            %direction,
            width = format!("{:.2}", width),
            expansion = format!("{:.1}", expansion),
            confidence = format!("{:.2}", confidence),
            "vol_breakout setup"
        );

        Some(
            SignalProposal::new(
                self.name(),
                &frame.symbol,
                direction,
                confidence,
                EntryMode::Immediate,
            )
            .reason("squeeze_expansion")
            .reason("range_break")
            .value("bb_width", width)
            .value("bb_width_change_pct", expansion)
            .value("range_high", recent_high)
            .value("range_low", recent_low)
            .exit(ExitRule::AtrStop { mult: 1.2 }),
        )
    }
}
