//! Robust statistics shared by the background estimator and the extractor.

const MAD_TO_SIGMA: f64 = 1.4826;

/// Median by selection; reorders `data`.
pub fn exact_median_mut(data: &mut [f32]) -> f64 {
    let n = data.len();
    if n == 0 {
        return 0.0;
    }
    let mid = n / 2;
    data.select_nth_unstable_by(mid, |a, b| {
        a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal)
    });
    if n % 2 == 0 {
        let right = data[mid] as f64;
        let left = data[..mid].iter().copied().fold(f32::MIN, f32::max) as f64;
        (left + right) / 2.0
    } else {
        data[mid] as f64
    }
}

/// Median absolute deviation scaled to sigma, around the given center.
pub fn mad_sigma(data: &[f32], center: f64) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    let mut devs: Vec<f32> = data.iter().map(|&v| (v as f64 - center).abs() as f32).collect();
    let mid = devs.len() / 2;
    devs.select_nth_unstable_by(mid, |a, b| {
        a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal)
    });
    (devs[mid] as f64 * MAD_TO_SIGMA).max(1e-30)
}

/// Sigma-clipped (median, sigma). Clipping runs `iterations` times at
/// `kappa` sigma; `values` is consumed as scratch space.
pub fn sigma_clipped_stats(values: &mut Vec<f32>, kappa: f32, iterations: usize) -> (f64, f64) {
    for _ in 0..iterations {
        if values.len() < 3 {
            break;
        }
        let median = exact_median_mut(values);
        let sig = mad_sigma(values, median);
        let lo = (median - kappa as f64 * sig) as f32;
        let hi = (median + kappa as f64 * sig) as f32;
        values.retain(|&v| v >= lo && v <= hi);
    }

    if values.is_empty() {
        return (0.0, 1.0);
    }
    let median = exact_median_mut(values);
    let sigma = mad_sigma(values, median);
    (median, sigma)
}
