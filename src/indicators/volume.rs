// =============================================================================
// Volume statistics — z-score and percentile rank
// =============================================================================

/// Z-score of the last value against the trailing `window` (excluding the
/// last value itself).
pub fn zscore(values: &[f64], window: usize) -> Option<f64> {
    if window < 2 || values.len() < window + 1 {
        return None;
    }
    let last = *values.last()?;
    let base = &values[values.len() - 1 - window..values.len() - 1];
    let mean = base.iter().sum::<f64>() / window as f64;
    let variance = base.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / window as f64;
    let std_dev = variance.sqrt();
    if std_dev > 0.0 {
        Some((last - mean) / std_dev)
    } else if (last - mean).abs() < f64::EPSILON.max(mean.abs() * 1e-12) {
        // Flat history, flat value: everything is "average".
        Some(0.0)
    } else {
        // Any deviation from a zero-variance base is off the scale; a large
        // finite value keeps downstream comparisons well-behaved.
        Some((last - mean).signum() * 100.0)
    }
}

/// Percentile rank in [0, 1] of the last value within the trailing `window`.
pub fn percentile_rank(values: &[f64], window: usize) -> Option<f64> {
    if window == 0 || values.len() < window + 1 {
        return None;
    }
    let last = *values.last()?;
    let base = &values[values.len() - 1 - window..values.len() - 1];
    let below = base.iter().filter(|&&v| v <= last).count();
    Some(below as f64 / window as f64)
}
