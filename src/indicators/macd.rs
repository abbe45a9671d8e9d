// =============================================================================
// Moving Average Convergence Divergence (MACD)
// =============================================================================
//
//   macd      = EMA_fast - EMA_slow
//   signal    = EMA of the macd line over `signal_period`
//   histogram = macd - signal
// =============================================================================

use crate::indicators::ema::ema_series;

#[derive(Debug, Clone, Copy)]
pub struct Macd {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// Compute the latest MACD triple (12/26/9 by convention).
///
/// Returns `None` when there is not enough data to seed the slow EMA plus
/// `signal_period` MACD points.
pub fn macd(
    values: &[f64],
    fast_period: usize,
    slow_period: usize,
    signal_period: usize,
) -> Option<Macd> {
    if fast_period == 0 || slow_period <= fast_period || signal_period == 0 {
        return None;
    }

    let fast = ema_series(values, fast_period);
    let slow = ema_series(values, slow_period);
    if slow.is_empty() {
        return None;
    }

    // Align the two series on their tails: both end at the last input value.
    let n = fast.len().min(slow.len());
    if n == 0 {
        return None;
    }
    let macd_line: Vec<f64> = (0..n)
        .map(|i| fast[fast.len() - n + i] - slow[slow.len() - n + i])
        .collect();

    let signal_series = ema_series(&macd_line, signal_period);
    let signal = *signal_series.last()?;
    let macd_val = *macd_line.last()?;

    Some(Macd {
        macd: macd_val,
        signal,
        histogram: macd_val - signal,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macd_positive_in_uptrend() {
        let values: Vec<f64> = (0..120).map(|i| 100.0 + i as f64).collect();
        let m = macd(&values, 12, 26, 9).unwrap();
        assert!(m.macd > 0.0);
    }

    #[test]
    fn macd_near_zero_when_flat() {
        let values = vec![100.0; 120];
        let m = macd(&values, 12, 26, 9).unwrap();
        assert!(m.macd.abs() < 1e-9);
        assert!(m.histogram.abs() < 1e-9);
    }

    #[test]
    fn macd_insufficient_data() {
        let values = vec![100.0; 20];
        assert!(macd(&values, 12, 26, 9).is_none());
    }

    #[test]
    fn macd_rejects_bad_periods() {
        let values = vec![100.0; 120];
        assert!(macd(&values, 26, 12, 9).is_none());
        assert!(macd(&values, 0, 26, 9).is_none());
    }
}
