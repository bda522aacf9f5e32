//! Significance of least-squares trends.
//!
//! The slope test follows Santer et al. (2008): the residuals' lag-1
//! autocorrelation reduces the effective sample size, the slope's standard
//! error is inflated to match, and a two-sided Student t test against a zero
//! slope gives the p-value. Missing timesteps break residual pairs but keep
//! their place on the time axis.

use crate::accumulate::CompensatedSum;

/// Two-sided p-value of a fitted slope.
///
/// `x` and `y` cover every selected timestep in time order, missing values
/// as NaN. `slope` and `intercept` are the fit over the finite points.
/// Returns 1 where the test is undefined: fewer than three points, no
/// residual pairs, or an effective sample size of two or less.
pub fn slope_p_value(x: &[f64], y: &[f64], slope: f64, intercept: f64) -> f64 {
    let residuals: Vec<f64> = x
        .iter()
        .zip(y)
        .map(|(&xi, &yi)| {
            if yi.is_finite() {
                yi - (intercept + slope * xi)
            } else {
                f64::NAN
            }
        })
        .collect();

    let valid: Vec<usize> = (0..residuals.len())
        .filter(|&i| residuals[i].is_finite())
        .collect();
    let n = valid.len();
    if n < 3 {
        return 1.0;
    }

    let mean_x = valid.iter().map(|&i| x[i]).collect::<CompensatedSum>().value() / n as f64;
    let sxx = valid
        .iter()
        .map(|&i| (x[i] - mean_x).powi(2))
        .collect::<CompensatedSum>()
        .value();
    let sse = valid
        .iter()
        .map(|&i| residuals[i].powi(2))
        .collect::<CompensatedSum>()
        .value();
    if sxx <= 0.0 {
        return 1.0;
    }
    let standard_error = (sse / (n - 2) as f64 / sxx).sqrt();

    let pairs: Vec<(f64, f64)> = residuals
        .windows(2)
        .filter(|w| w[0].is_finite() && w[1].is_finite())
        .map(|w| (w[0], w[1]))
        .collect();
    let Some(rho) = correlation(&pairs) else {
        return 1.0;
    };

    let rho = rho.max(0.0);
    let effective = n as f64 * (1.0 - rho) / (1.0 + rho);
    if effective <= 2.0 {
        return 1.0;
    }
    let sigma = standard_error * ((n - 2) as f64 / (effective - 2.0)).sqrt();
    if sigma == 0.0 {
        return if slope == 0.0 { 1.0 } else { 0.0 };
    }
    student_t_two_sided(slope.abs() / sigma, effective - 2.0)
}

/// Pearson correlation of the pairs; `None` for fewer than two pairs or a
/// constant column.
fn correlation(pairs: &[(f64, f64)]) -> Option<f64> {
    if pairs.len() < 2 {
        return None;
    }
    let n = pairs.len() as f64;
    let mean_a = pairs.iter().map(|p| p.0).collect::<CompensatedSum>().value() / n;
    let mean_b = pairs.iter().map(|p| p.1).collect::<CompensatedSum>().value() / n;
    let mut saa = CompensatedSum::new();
    let mut sbb = CompensatedSum::new();
    let mut sab = CompensatedSum::new();
    for &(a, b) in pairs {
        let (da, db) = (a - mean_a, b - mean_b);
        saa.add(da * da);
        sbb.add(db * db);
        sab.add(da * db);
    }
    let denominator = (saa.value() * sbb.value()).sqrt();
    let rho = sab.value() / denominator;
    rho.is_finite().then_some(rho.clamp(-1.0, 1.0))
}

/// `P(|T| >= t)` for Student's t with `dof` degrees of freedom.
pub fn student_t_two_sided(t: f64, dof: f64) -> f64 {
    if t.is_nan() || dof.is_nan() || dof <= 0.0 {
        return f64::NAN;
    }
    if t.is_infinite() {
        return 0.0;
    }
    let x = dof / (dof + t * t);
    regularized_incomplete_beta(dof / 2.0, 0.5, x).clamp(0.0, 1.0)
}

/// Regularized incomplete beta function `I_x(a, b)`.
pub fn regularized_incomplete_beta(a: f64, b: f64, x: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    if x >= 1.0 {
        return 1.0;
    }
    let front = (ln_gamma(a + b) - ln_gamma(a) - ln_gamma(b) + a * x.ln() + b * (1.0 - x).ln()).exp();
    // The continued fraction converges fast below the mean of the distribution.
    if x < (a + 1.0) / (a + b + 2.0) {
        front * beta_continued_fraction(a, b, x) / a
    } else {
        1.0 - front * beta_continued_fraction(b, a, 1.0 - x) / b
    }
}

/// Modified Lentz evaluation of the incomplete beta continued fraction.
fn beta_continued_fraction(a: f64, b: f64, x: f64) -> f64 {
    const MAX_ITERATIONS: usize = 500;
    const EPSILON: f64 = 1e-15;
    const TINY: f64 = 1e-300;

    let guard = |v: f64| if v.abs() < TINY { TINY } else { v };
    let (qab, qap, qam) = (a + b, a + 1.0, a - 1.0);
    let mut c = 1.0;
    let mut d = 1.0 / guard(1.0 - qab * x / qap);
    let mut h = d;
    for m in 1..=MAX_ITERATIONS {
        let m = m as f64;
        let m2 = 2.0 * m;

        let aa = m * (b - m) * x / ((qam + m2) * (a + m2));
        d = 1.0 / guard(1.0 + aa * d);
        c = guard(1.0 + aa / c);
        h *= d * c;

        let aa = -(a + m) * (qab + m) * x / ((a + m2) * (qap + m2));
        d = 1.0 / guard(1.0 + aa * d);
        c = guard(1.0 + aa / c);
        let delta = d * c;
        h *= delta;
        if (delta - 1.0).abs() < EPSILON {
            break;
        }
    }
    h
}

/// Natural log of the gamma function (Lanczos, g = 7).
pub fn ln_gamma(x: f64) -> f64 {
    const COEFFICIENTS: [f64; 9] = [
        0.999_999_999_999_809_9,
        676.520_368_121_885_1,
        -1_259.139_216_722_402_8,
        771.323_428_777_653_1,
        -176.615_029_162_140_6,
        12.507_343_278_686_905,
        -0.138_571_095_265_720_12,
        9.984_369_578_019_572e-6,
        1.505_632_735_149_311_6e-7,
    ];
    if x < 0.5 {
        let pi = std::f64::consts::PI;
        return (pi / (pi * x).sin().abs()).ln() - ln_gamma(1.0 - x);
    }
    let x = x - 1.0;
    let mut series = COEFFICIENTS[0];
    for (i, c) in COEFFICIENTS.iter().enumerate().skip(1) {
        series += c / (x + i as f64);
    }
    let t = x + 7.5;
    0.5 * (2.0 * std::f64::consts::PI).ln() + (x + 0.5) * t.ln() - t + series.ln()
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_utils::assert_approx_eq;

    #[test]
    fn test_ln_gamma() {
        assert_approx_eq!(ln_gamma(5.0), 24f64.ln(), 1e-12);
        assert_approx_eq!(ln_gamma(0.5), std::f64::consts::PI.sqrt().ln(), 1e-12);
        assert_approx_eq!(ln_gamma(10.5), 13.940_625_219, 1e-8);
    }

    #[test]
    fn test_incomplete_beta_edges() {
        assert_eq!(regularized_incomplete_beta(2.0, 3.0, 0.0), 0.0);
        assert_eq!(regularized_incomplete_beta(2.0, 3.0, 1.0), 1.0);
        // I_x(1, 1) is the uniform CDF.
        assert_approx_eq!(regularized_incomplete_beta(1.0, 1.0, 0.3), 0.3, 1e-12);
        // Symmetry: I_x(a, b) = 1 - I_{1-x}(b, a).
        let lhs = regularized_incomplete_beta(2.5, 4.0, 0.35);
        let rhs = 1.0 - regularized_incomplete_beta(4.0, 2.5, 0.65);
        assert_approx_eq!(lhs, rhs, 1e-12);
    }

    #[test]
    fn test_student_t_critical_values() {
        // Two-sided 5% critical values from the t table.
        assert_approx_eq!(student_t_two_sided(12.706_205, 1.0), 0.05, 1e-5);
        assert_approx_eq!(student_t_two_sided(2.228_139, 10.0), 0.05, 1e-5);
        assert_approx_eq!(student_t_two_sided(2.085_963, 20.0), 0.05, 1e-5);
        // Cauchy: P(|T| >= 1) = 1/2.
        assert_approx_eq!(student_t_two_sided(1.0, 1.0), 0.5, 1e-12);
        assert_eq!(student_t_two_sided(0.0, 7.0), 1.0);
        assert_eq!(student_t_two_sided(f64::INFINITY, 7.0), 0.0);
    }

    #[test]
    fn test_independent_residuals_use_plain_t_test() {
        // Residuals alternate in sign, so the autocorrelation is negative and
        // the full sample counts. Slope 0.5, residuals +-1 about the line.
        let x: Vec<f64> = (0..20).map(|i| i as f64).collect();
        let y: Vec<f64> = x
            .iter()
            .enumerate()
            .map(|(i, xi)| 0.5 * xi + if i % 2 == 0 { 1.0 } else { -1.0 })
            .collect();
        // Fit the alternating line by hand: the sign pattern is slightly
        // correlated with x, which the closed form below accounts for.
        let n = x.len() as f64;
        let mean_x = x.iter().sum::<f64>() / n;
        let mean_y = y.iter().sum::<f64>() / n;
        let sxx: f64 = x.iter().map(|xi| (xi - mean_x).powi(2)).sum();
        let sxy: f64 = x.iter().zip(&y).map(|(xi, yi)| (xi - mean_x) * (yi - mean_y)).sum();
        let slope = sxy / sxx;
        let intercept = mean_y - slope * mean_x;
        let sse: f64 = x
            .iter()
            .zip(&y)
            .map(|(xi, yi)| (yi - intercept - slope * xi).powi(2))
            .sum();
        let t = slope / (sse / (n - 2.0) / sxx).sqrt();

        let p = slope_p_value(&x, &y, slope, intercept);
        assert_approx_eq!(p, student_t_two_sided(t, n - 2.0), 1e-12);
        assert!(p < 1e-6);
    }

    #[test]
    fn test_autocorrelation_weakens_significance() {
        // Same slope; residuals in runs of five instead of alternating.
        let x: Vec<f64> = (0..40).map(|i| i as f64).collect();
        let alternating: Vec<f64> = (0..40)
            .map(|i| 0.05 * i as f64 + if i % 2 == 0 { 1.0 } else { -1.0 })
            .collect();
        let runs: Vec<f64> = (0..40)
            .map(|i| 0.05 * i as f64 + if (i / 5) % 2 == 0 { 1.0 } else { -1.0 })
            .collect();
        let p_alternating = slope_p_value(&x, &alternating, 0.05, 0.0);
        let p_runs = slope_p_value(&x, &runs, 0.05, 0.0);
        assert!(p_runs > p_alternating, "{} <= {}", p_runs, p_alternating);
    }

    #[test]
    fn test_undefined_cases_are_not_significant() {
        assert_eq!(slope_p_value(&[0.0, 1.0], &[1.0, 2.0], 1.0, 1.0), 1.0);
        let x = [0.0, 1.0, 2.0, 3.0, 4.0];
        let y = [1.0, f64::NAN, 3.0, f64::NAN, 5.0];
        // No two consecutive values, so no residual pairs.
        assert_eq!(slope_p_value(&x, &y, 1.0, 1.0), 1.0);
    }
}
