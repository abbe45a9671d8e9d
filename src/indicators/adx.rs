// =============================================================================
// Average Directional Index (ADX)
// =============================================================================
//
// ADX quantifies trend strength regardless of direction.
//
//   1. +DM / -DM per bar, True Range per bar.
//   2. Wilder's smoothing over `period`.
//   3. +DI = smoothed(+DM) / smoothed(TR) * 100, -DI likewise.
//   4. DX  = |+DI - -DI| / (+DI + -DI) * 100
//   5. ADX = Wilder's smoothed average of DX.
//
// Interpretation: ADX > 25 trending, ADX < 20 ranging.
// =============================================================================

use crate::market_data::Candle;

/// Most recent ADX value. Needs at least `2 * period + 1` candles: `period`
/// bars to seed the directional smoothing and another `period` DX values to
/// seed the ADX average.
pub fn adx(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < 2 * period + 1 {
        return None;
    }

    let mut plus_dm = Vec::with_capacity(candles.len() - 1);
    let mut minus_dm = Vec::with_capacity(candles.len() - 1);
    let mut tr = Vec::with_capacity(candles.len() - 1);

    for i in 1..candles.len() {
        let up = candles[i].high - candles[i - 1].high;
        let down = candles[i - 1].low - candles[i].low;
        plus_dm.push(if up > down && up > 0.0 { up } else { 0.0 });
        minus_dm.push(if down > up && down > 0.0 { down } else { 0.0 });

        let high = candles[i].high;
        let low = candles[i].low;
        let prev_close = candles[i - 1].close;
        tr.push(
            (high - low)
                .max((high - prev_close).abs())
                .max((low - prev_close).abs()),
        );
    }

    // Wilder-smoothed running sums, seeded with plain sums over the first
    // `period` bars.
    let mut sm_plus: f64 = plus_dm[..period].iter().sum();
    let mut sm_minus: f64 = minus_dm[..period].iter().sum();
    let mut sm_tr: f64 = tr[..period].iter().sum();

    let mut dx_values = Vec::new();
    for i in period..tr.len() {
        sm_plus = sm_plus - sm_plus / period as f64 + plus_dm[i];
        sm_minus = sm_minus - sm_minus / period as f64 + minus_dm[i];
        sm_tr = sm_tr - sm_tr / period as f64 + tr[i];

        if sm_tr <= 0.0 {
            dx_values.push(0.0);
            continue;
        }
        let plus_di = sm_plus / sm_tr * 100.0;
        let minus_di = sm_minus / sm_tr * 100.0;
        let di_sum = plus_di + minus_di;
        dx_values.push(if di_sum > 0.0 {
            (plus_di - minus_di).abs() / di_sum * 100.0
        } else {
            0.0
        });
    }

    if dx_values.len() < period {
        return None;
    }

    let mut adx_val: f64 = dx_values[..period].iter().sum::<f64>() / period as f64;
    for &dx in &dx_values[period..] {
        adx_val = (adx_val * (period - 1) as f64 + dx) / period as f64;
    }

    if adx_val.is_finite() {
        Some(adx_val)
    } else {
        None
    }
}

/// Directional bias: +1 when +DI dominates, -1 when -DI dominates, 0 when
/// they are indistinguishable. Used by the regime scorer to turn trend
/// strength into trend_up / trend_down.
pub fn directional_bias(candles: &[Candle], period: usize) -> Option<i8> {
    if period == 0 || candles.len() < period + 1 {
        return None;
    }

    let mut sm_plus = 0.0;
    let mut sm_minus = 0.0;
    let start = candles.len() - period;
    for i in start..candles.len() {
        let up = candles[i].high - candles[i - 1].high;
        let down = candles[i - 1].low - candles[i].low;
        if up > down && up > 0.0 {
            sm_plus += up;
        }
        if down > up && down > 0.0 {
            sm_minus += down;
        }
    }

    let diff = sm_plus - sm_minus;
    let scale = (sm_plus + sm_minus).max(f64::EPSILON);
    if diff / scale > 0.1 {
        Some(1)
    } else if diff / scale < -0.1 {
        Some(-1)
    } else {
        Some(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::Candle;

    fn candle(high: f64, low: f64, close: f64) -> Candle {
        Candle {
            open_time: 0,
            close_time: 0,
            interval: "5m".into(),
            open: close,
            high,
            low,
            close,
            volume: 100.0,
            is_closed: true,
        }
    }

    fn rising(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let base = 100.0 + i as f64 * 2.0;
                candle(base + 1.0, base - 1.0, base)
            })
            .collect()
    }

    fn flat(n: usize) -> Vec<Candle> {
        (0..n).map(|_| candle(101.0, 99.0, 100.0)).collect()
    }

    #[test]
    fn adx_strong_in_persistent_trend() {
        let v = adx(&rising(60), 14).unwrap();
        assert!(v > 25.0, "expected trending ADX, got {v}");
    }

    #[test]
    fn adx_weak_in_flat_market() {
        let v = adx(&flat(60), 14).unwrap();
        assert!(v < 20.0, "expected ranging ADX, got {v}");
    }

    #[test]
    fn adx_insufficient_data() {
        assert!(adx(&rising(20), 14).is_none());
    }

    #[test]
    fn bias_points_up_in_uptrend() {
        assert_eq!(directional_bias(&rising(30), 14), Some(1));
    }

    #[test]
    fn bias_neutral_when_flat() {
        assert_eq!(directional_bias(&flat(30), 14), Some(0));
    }
}
