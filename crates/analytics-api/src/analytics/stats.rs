//! Self-contained statistics used across the analyses.
//!
//! Everything here is plain `f64` math with no platform dependencies: the
//! normal CDF uses the Abramowitz & Stegun erf approximation (7.1.26), the
//! chi-square survival function has closed forms for df ≤ 2 and the
//! Wilson-Hilferty normal approximation above that.

use std::f64::consts::SQRT_2;

/// Abramowitz & Stegun 7.1.26 rational approximation, max error ~1.5e-7.
pub fn erf(x: f64) -> f64 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();

    const A1: f64 = 0.254829592;
    const A2: f64 = -0.284496736;
    const A3: f64 = 1.421413741;
    const A4: f64 = -1.453152027;
    const A5: f64 = 1.061405429;
    const P: f64 = 0.3275911;

    let t = 1.0 / (1.0 + P * x);
    let poly = ((((A5 * t + A4) * t + A3) * t + A2) * t + A1) * t;
    sign * (1.0 - poly * (-x * x).exp())
}

pub fn normal_cdf(z: f64) -> f64 {
    0.5 * (1.0 + erf(z / SQRT_2))
}

#[derive(Debug, Clone, Copy)]
pub struct TwoProportionTest {
    pub z: f64,
    pub p_value: f64,
    pub pooled: f64,
    pub standard_error: f64,
}

/// Pooled two-proportion z-test of `x1/n1` against `x2/n2`, two-tailed.
/// Returns `None` when either sample is empty or the pooled variance is
/// degenerate (all successes or all failures).
pub fn two_proportion_test(x1: i64, n1: i64, x2: i64, n2: i64) -> Option<TwoProportionTest> {
    if n1 <= 0 || n2 <= 0 {
        return None;
    }

    let p1 = x1 as f64 / n1 as f64;
    let p2 = x2 as f64 / n2 as f64;
    let pooled = (x1 + x2) as f64 / (n1 + n2) as f64;

    let variance = pooled * (1.0 - pooled) * (1.0 / n1 as f64 + 1.0 / n2 as f64);
    if variance <= 0.0 {
        return None;
    }

    let standard_error = variance.sqrt();
    let z = (p1 - p2) / standard_error;
    let p_value = (2.0 * (1.0 - normal_cdf(z.abs()))).clamp(0.0, 1.0);

    Some(TwoProportionTest { z, p_value, pooled, standard_error })
}

/// 95% CI half-width on the difference of two proportions, unpooled SE.
pub fn difference_ci_95(p1: f64, n1: i64, p2: f64, n2: i64) -> f64 {
    if n1 <= 0 || n2 <= 0 {
        return 0.0;
    }
    1.96 * (p1 * (1.0 - p1) / n1 as f64 + p2 * (1.0 - p2) / n2 as f64).sqrt()
}

/// Confidence-level bucket for a p-value: 99 below 0.01, 95 below 0.05,
/// else 90.
pub fn confidence_level(p_value: f64) -> u8 {
    if p_value < 0.01 {
        99
    } else if p_value < 0.05 {
        95
    } else {
        90
    }
}

/// Cohen's h effect size for two proportions.
pub fn cohens_h(p1: f64, p2: f64) -> f64 {
    2.0 * (p1.clamp(0.0, 1.0).sqrt().asin() - p2.clamp(0.0, 1.0).sqrt().asin())
}

/// Benjamini-Hochberg adjusted p-values, preserving input order.
pub fn benjamini_hochberg(p_values: &[f64]) -> Vec<f64> {
    let m = p_values.len();
    if m == 0 {
        return Vec::new();
    }

    let mut order: Vec<usize> = (0..m).collect();
    order.sort_by(|&a, &b| p_values[a].total_cmp(&p_values[b]));

    let mut adjusted = vec![0.0_f64; m];
    let mut running_min = 1.0_f64;
    for rank in (0..m).rev() {
        let idx = order[rank];
        let candidate = p_values[idx] * m as f64 / (rank + 1) as f64;
        running_min = running_min.min(candidate).min(1.0);
        adjusted[idx] = running_min;
    }
    adjusted
}

/// Chi-square survival function P(X > x) with df degrees of freedom.
/// Closed forms for df 1 and 2; Wilson-Hilferty above.
pub fn chi_square_survival(x: f64, df: usize) -> f64 {
    if x <= 0.0 || df == 0 {
        return 1.0;
    }
    match df {
        1 => (2.0 * (1.0 - normal_cdf(x.sqrt()))).clamp(0.0, 1.0),
        2 => (-x / 2.0).exp().clamp(0.0, 1.0),
        _ => {
            let k = df as f64;
            let term = 2.0 / (9.0 * k);
            let z = ((x / k).powf(1.0 / 3.0) - (1.0 - term)) / term.sqrt();
            (1.0 - normal_cdf(z)).clamp(0.0, 1.0)
        }
    }
}

/// Pearson correlation coefficient; 0.0 for degenerate inputs.
pub fn pearson_r(xs: &[f64], ys: &[f64]) -> f64 {
    let n = xs.len().min(ys.len());
    if n < 2 {
        return 0.0;
    }
    let xs = &xs[..n];
    let ys = &ys[..n];

    let mx = mean(xs);
    let my = mean(ys);

    let mut cov = 0.0;
    let mut vx = 0.0;
    let mut vy = 0.0;
    for i in 0..n {
        let dx = xs[i] - mx;
        let dy = ys[i] - my;
        cov += dx * dy;
        vx += dx * dx;
        vy += dy * dy;
    }

    if vx <= 0.0 || vy <= 0.0 {
        return 0.0;
    }
    cov / (vx.sqrt() * vy.sqrt())
}

/// Ordinary least-squares slope of ys against their indices.
pub fn linear_slope(ys: &[f64]) -> f64 {
    let n = ys.len();
    if n < 2 {
        return 0.0;
    }
    let xs: Vec<f64> = (0..n).map(|i| i as f64).collect();
    let mx = mean(&xs);
    let my = mean(ys);

    let mut num = 0.0;
    let mut den = 0.0;
    for i in 0..n {
        num += (xs[i] - mx) * (ys[i] - my);
        den += (xs[i] - mx) * (xs[i] - mx);
    }
    if den == 0.0 { 0.0 } else { num / den }
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation.
pub fn stddev(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / (n - 1) as f64;
    var.sqrt()
}

/// Coefficient of variation (stddev / mean); 0.0 when the mean is 0.
pub fn coefficient_of_variation(values: &[f64]) -> f64 {
    let m = mean(values);
    if m == 0.0 { 0.0 } else { stddev(values) / m }
}

/// Percentile with linear interpolation over a sorted copy. `q` in [0, 100].
pub fn percentile(values: &[f64], q: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let rank = (q.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        let frac = rank - lo as f64;
        sorted[lo] + (sorted[hi] - sorted[lo]) * frac
    }
}

pub fn median(values: &[f64]) -> f64 {
    percentile(values, 50.0)
}

/// Rounds to two decimal places, the precision used across responses.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn erf_matches_reference_values() {
        assert!((erf(0.0)).abs() < 1e-9);
        assert!((erf(1.0) - 0.8427007929).abs() < 1e-6);
        assert!((erf(-1.0) + 0.8427007929).abs() < 1e-6);
        assert!((erf(2.0) - 0.9953222650).abs() < 1e-6);
    }

    #[test]
    fn normal_cdf_reference_points() {
        assert!((normal_cdf(0.0) - 0.5).abs() < 1e-9);
        assert!((normal_cdf(1.96) - 0.975).abs() < 1e-4);
        assert!((normal_cdf(-1.96) - 0.025).abs() < 1e-4);
    }

    // Comparison scenario: 2000/100 vs 2000/140 entries/conversions.
    #[test]
    fn two_proportion_ab_case() {
        let test = two_proportion_test(140, 2000, 100, 2000).unwrap();
        assert!((test.pooled - 0.06).abs() < 1e-9);
        assert!((test.standard_error - 0.00751).abs() < 2e-4);
        assert!((test.z - 2.66).abs() < 0.05);
        assert!((test.p_value - 0.008).abs() < 0.002);
    }

    // Conversion significance scenario: 1000/50 vs previous 1000/25 doubles
    // the rate and lands in the 99-confidence bucket.
    #[test]
    fn two_proportion_doubling_is_highly_significant() {
        let test = two_proportion_test(50, 1000, 25, 1000).unwrap();
        assert!(test.z > 2.5);
        assert!(test.p_value < 0.01);
        assert_eq!(confidence_level(test.p_value), 99);
    }

    #[test]
    fn two_proportion_degenerate_inputs() {
        assert!(two_proportion_test(0, 0, 5, 10).is_none());
        assert!(two_proportion_test(0, 100, 0, 100).is_none());
        assert!(two_proportion_test(100, 100, 100, 100).is_none());
    }

    #[test]
    fn confidence_buckets() {
        assert_eq!(confidence_level(0.001), 99);
        assert_eq!(confidence_level(0.03), 95);
        assert_eq!(confidence_level(0.2), 90);
    }

    #[test]
    fn cohens_h_directional() {
        assert!(cohens_h(0.07, 0.05) > 0.0);
        assert!(cohens_h(0.05, 0.07) < 0.0);
        assert!(cohens_h(0.5, 0.5).abs() < 1e-12);
    }

    #[test]
    fn benjamini_hochberg_monotone_and_bounded() {
        let adjusted = benjamini_hochberg(&[0.01, 0.04, 0.03, 0.005]);
        assert_eq!(adjusted.len(), 4);
        for (raw, adj) in [0.01, 0.04, 0.03, 0.005].iter().zip(&adjusted) {
            assert!(adj >= raw);
            assert!(*adj <= 1.0);
        }
        // Smallest raw p keeps the smallest adjusted p.
        assert!(adjusted[3] <= adjusted[0]);
    }

    #[test]
    fn chi_square_closed_forms() {
        // df=2: survival is exp(-x/2).
        assert!((chi_square_survival(2.0, 2) - (-1.0_f64).exp()).abs() < 1e-9);
        // df=1 at 3.841 is ~0.05.
        assert!((chi_square_survival(3.841, 1) - 0.05).abs() < 2e-3);
        // df=4 via Wilson-Hilferty: chi2 of 9.488 is ~0.05.
        assert!((chi_square_survival(9.488, 4) - 0.05).abs() < 5e-3);
    }

    #[test]
    fn pearson_r_perfect_correlation() {
        let xs = [1.0, 2.0, 3.0, 4.0];
        let ys = [2.0, 4.0, 6.0, 8.0];
        assert!((pearson_r(&xs, &ys) - 1.0).abs() < 1e-9);
        let inv = [8.0, 6.0, 4.0, 2.0];
        assert!((pearson_r(&xs, &inv) + 1.0).abs() < 1e-9);
    }

    #[test]
    fn linear_slope_of_declining_series() {
        assert!(linear_slope(&[10.0, 8.0, 6.0, 4.0]) < 0.0);
        assert!((linear_slope(&[5.0, 5.0, 5.0]) - 0.0).abs() < 1e-12);
    }

    #[test]
    fn percentile_interpolates() {
        let values = [1.0, 2.0, 3.0, 4.0];
        assert!((percentile(&values, 0.0) - 1.0).abs() < 1e-9);
        assert!((percentile(&values, 100.0) - 4.0).abs() < 1e-9);
        assert!((percentile(&values, 50.0) - 2.5).abs() < 1e-9);
        assert!((median(&values) - 2.5).abs() < 1e-9);
    }

    #[test]
    fn cv_and_stddev() {
        let values = [9.0, 10.0, 11.0];
        assert!((mean(&values) - 10.0).abs() < 1e-9);
        assert!((stddev(&values) - 1.0).abs() < 1e-9);
        assert!((coefficient_of_variation(&values) - 0.1).abs() < 1e-9);
    }
}
