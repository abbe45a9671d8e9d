// =============================================================================
// Average True Range (ATR) — Wilder's smoothing
// =============================================================================
//
// True Range per bar:
//   TR = max(H - L, |H - prevClose|, |L - prevClose|)
//
// ATR:
//   ATR_0 = SMA of the first `period` TR values
//   ATR_t = (ATR_{t-1} * (period - 1) + TR_t) / period
// =============================================================================

use crate::market_data::Candle;

/// Compute the full ATR series (oldest first). Output element `i`
/// corresponds to candle index `period + i`.
///
/// Returns an empty `Vec` when `period` is zero or there are fewer than
/// `period + 1` candles.
pub fn atr_series(candles: &[Candle], period: usize) -> Vec<f64> {
    if period == 0 || candles.len() < period + 1 {
        return Vec::new();
    }

    let mut tr_values: Vec<f64> = Vec::with_capacity(candles.len() - 1);
    for i in 1..candles.len() {
        let high = candles[i].high;
        let low = candles[i].low;
        let prev_close = candles[i - 1].close;
        let tr = (high - low)
            .max((high - prev_close).abs())
            .max((low - prev_close).abs());
        tr_values.push(tr);
    }

    let seed: f64 = tr_values[..period].iter().sum::<f64>() / period as f64;
    if !seed.is_finite() {
        return Vec::new();
    }

    let mut series = Vec::with_capacity(tr_values.len() - period + 1);
    series.push(seed);

    let mut prev = seed;
    for &tr in &tr_values[period..] {
        let next = (prev * (period - 1) as f64 + tr) / period as f64;
        if !next.is_finite() {
            break;
        }
        series.push(next);
        prev = next;
    }

    series
}

/// Most recent ATR value, if computable.
pub fn atr(candles: &[Candle], period: usize) -> Option<f64> {
    atr_series(candles, period).last().copied()
}

/// ATR as a percentage of the latest close.
pub fn atr_pct(candles: &[Candle], period: usize) -> Option<f64> {
    let a = atr(candles, period)?;
    let close = candles.last()?.close;
    if close > 0.0 {
        Some(a / close * 100.0)
    } else {
        None
    }
}

/// Slope of the ATR over the last `lookback` series points, as a fraction of
/// the current ATR. Positive = volatility expanding.
pub fn atr_slope(candles: &[Candle], period: usize, lookback: usize) -> Option<f64> {
    let series = atr_series(candles, period);
    if series.len() < lookback + 1 || lookback == 0 {
        return None;
    }
    let last = *series.last()?;
    let prior = series[series.len() - 1 - lookback];
    if last > 0.0 {
        Some((last - prior) / last)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::Candle;

    fn candle(open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle {
            open_time: 0,
            close_time: 0,
            interval: "5m".into(),
            open,
            high,
            low,
            close,
            volume: 100.0,
            is_closed: true,
        }
    }

    #[test]
    fn atr_of_fixed_range_bars() {
        // Every bar spans exactly 10 with no gap: TR = 10 always.
        let candles: Vec<Candle> = (0..30)
            .map(|_| candle(100.0, 105.0, 95.0, 100.0))
            .collect();
        let v = atr(&candles, 14).unwrap();
        assert!((v - 10.0).abs() < 1e-9);
    }

    #[test]
    fn atr_requires_period_plus_one() {
        let candles: Vec<Candle> = (0..14)
            .map(|_| candle(100.0, 105.0, 95.0, 100.0))
            .collect();
        assert!(atr(&candles, 14).is_none());
    }

    #[test]
    fn atr_pct_of_price() {
        let candles: Vec<Candle> = (0..30)
            .map(|_| candle(100.0, 101.0, 99.0, 100.0))
            .collect();
        let pct = atr_pct(&candles, 14).unwrap();
        assert!((pct - 2.0).abs() < 1e-9);
    }

    #[test]
    fn atr_slope_flat_is_zero() {
        let candles: Vec<Candle> = (0..40)
            .map(|_| candle(100.0, 102.0, 98.0, 100.0))
            .collect();
        let slope = atr_slope(&candles, 14, 5).unwrap();
        assert!(slope.abs() < 1e-9);
    }
}
