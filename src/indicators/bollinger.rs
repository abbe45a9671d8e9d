// =============================================================================
// Bollinger Bands
// =============================================================================
//
// Middle band = SMA, upper/lower = SMA ± k·σ. The Band Width
// (upper - lower) / middle * 100 feeds the volatility score of the regime
// scorer; its percent change over a short window feeds squeeze-expansion
// detection.
// =============================================================================

#[derive(Debug, Clone, Copy)]
pub struct Bands {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
    pub width: f64,
}

/// Compute Bollinger Bands over the trailing `period` values.
pub fn bollinger(values: &[f64], period: usize, num_std: f64) -> Option<Bands> {
    bollinger_at(values, values.len(), period, num_std)
}

/// Bands computed as of index `end` (exclusive). Lets callers build a width
/// history without re-slicing.
pub fn bollinger_at(values: &[f64], end: usize, period: usize, num_std: f64) -> Option<Bands> {
    if period == 0 || end < period || end > values.len() {
        return None;
    }

    let window = &values[end - period..end];
    let middle = window.iter().sum::<f64>() / period as f64;
    if middle == 0.0 {
        return None;
    }

    let variance = window.iter().map(|x| (x - middle).powi(2)).sum::<f64>() / period as f64;
    let std_dev = variance.sqrt();

    let upper = middle + num_std * std_dev;
    let lower = middle - num_std * std_dev;
    let width = (upper - lower) / middle * 100.0;

    if width.is_finite() {
        Some(Bands {
            upper,
            middle,
            lower,
            width,
        })
    } else {
        None
    }
}

/// Percent change of the band width versus `lookback` bars ago.
pub fn width_change_pct(
    values: &[f64],
    period: usize,
    num_std: f64,
    lookback: usize,
) -> Option<f64> {
    if values.len() < period + lookback || lookback == 0 {
        return None;
    }
    let now = bollinger_at(values, values.len(), period, num_std)?;
    let then = bollinger_at(values, values.len() - lookback, period, num_std)?;
    if then.width > 0.0 {
        Some((now.width - then.width) / then.width * 100.0)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bands_ordering() {
        let values: Vec<f64> = (1..=30).map(|x| x as f64).collect();
        let b = bollinger(&values, 20, 2.0).unwrap();
        assert!(b.upper > b.middle);
        assert!(b.middle > b.lower);
        assert!(b.width > 0.0);
    }

    #[test]
    fn flat_series_has_zero_width() {
        let values = vec![50.0; 25];
        let b = bollinger(&values, 20, 2.0).unwrap();
        assert!(b.width.abs() < 1e-9);
    }

    #[test]
    fn width_expands_after_volatility_arrives() {
        let mut values = vec![100.0; 30];
        // Volatility enters in the last 10 bars.
        for (i, v) in values.iter_mut().enumerate().skip(20) {
            *v = if i % 2 == 0 { 104.0 } else { 96.0 };
        }
        let change = width_change_pct(&values, 20, 2.0, 5).unwrap();
        assert!(change > 0.0);
    }

    #[test]
    fn insufficient_data_is_none() {
        assert!(bollinger(&[1.0, 2.0], 20, 2.0).is_none());
        assert!(width_change_pct(&[1.0; 21], 20, 2.0, 5).is_none());
    }
}
