// =============================================================================
// Exponential Moving Average (EMA)
// =============================================================================
//
// Formula:
//   multiplier = 2 / (period + 1)
//   EMA_t      = close_t * multiplier + EMA_{t-1} * (1 - multiplier)
//
// The first value is seeded with the SMA of the first `period` closes.
// =============================================================================

/// Compute the EMA series for `values` with the given look-back `period`.
///
/// Returns an empty `Vec` when the input is too short or the period is zero.
/// Output element `i` corresponds to input index `period - 1 + i`.
pub fn ema_series(values: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || values.len() < period {
        return Vec::new();
    }

    let multiplier = 2.0 / (period + 1) as f64;

    let sma: f64 = values[..period].iter().sum::<f64>() / period as f64;
    if !sma.is_finite() {
        return Vec::new();
    }

    let mut result = Vec::with_capacity(values.len() - period + 1);
    result.push(sma);

    let mut prev = sma;
    for &v in &values[period..] {
        let next = v * multiplier + prev * (1.0 - multiplier);
        if !next.is_finite() {
            // A broken series must not leak partial garbage downstream.
            break;
        }
        result.push(next);
        prev = next;
    }

    result
}

/// Most recent EMA value, if computable.
pub fn ema(values: &[f64], period: usize) -> Option<f64> {
    ema_series(values, period).last().copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ema_of_constant_series_is_constant() {
        let values = vec![10.0; 30];
        let series = ema_series(&values, 9);
        assert_eq!(series.len(), 30 - 9 + 1);
        for v in series {
            assert!((v - 10.0).abs() < 1e-9);
        }
    }

    #[test]
    fn ema_tracks_rising_prices_below_last() {
        let values: Vec<f64> = (1..=50).map(|x| x as f64).collect();
        let last = ema(&values, 10).unwrap();
        // EMA lags a rising series.
        assert!(last < 50.0);
        assert!(last > 40.0);
    }

    #[test]
    fn ema_insufficient_data() {
        assert!(ema(&[1.0, 2.0], 10).is_none());
        assert!(ema_series(&[1.0, 2.0, 3.0], 0).is_empty());
    }
}
