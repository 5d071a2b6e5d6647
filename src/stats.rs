//! Robust averaging of calibration metrics.

/// Percentile with linear interpolation between the two closest ranks.
///
/// # Arguments
///
/// * `values` - Samples in any order.
/// * `p` - Percentile in `[0, 100]`.
///
/// # Returns
///
/// * `f64` - Interpolated percentile, `NaN` for an empty sample.
pub fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let rank = p.clamp(0.0, 100.0) / 100.0 * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64)
}

/// Mean of the samples lying within the interquartile range (bounds included).
/// `NaN` for an empty sample.
pub fn iqr_mean(values: &[f64]) -> f64 {
    let lo = percentile(values, 25.0);
    let hi = percentile(values, 75.0);
    let kept: Vec<f64> = values
        .iter()
        .copied()
        .filter(|v| *v >= lo && *v <= hi)
        .collect();
    if kept.is_empty() {
        return f64::NAN;
    }
    kept.iter().sum::<f64>() / kept.len() as f64
}
