//! Compensated summation.

/// Neumaier-compensated running sum.
///
/// Keeps the rounding error of every addition in a separate term, so long
/// monthly or daily series of large values (Kelvin, Pa) sum without losing
/// the small differences trends are made of.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CompensatedSum {
    sum: f64,
    compensation: f64,
}

impl CompensatedSum {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn add(&mut self, value: f64) {
        let t = self.sum + value;
        if self.sum.abs() >= value.abs() {
            self.compensation += (self.sum - t) + value;
        } else {
            self.compensation += (value - t) + self.sum;
        }
        self.sum = t;
    }

    pub fn value(&self) -> f64 {
        self.sum + self.compensation
    }
}

impl Extend<f64> for CompensatedSum {
    fn extend<I: IntoIterator<Item = f64>>(&mut self, iter: I) {
        for v in iter {
            self.add(v);
        }
    }
}

impl FromIterator<f64> for CompensatedSum {
    fn from_iter<I: IntoIterator<Item = f64>>(iter: I) -> Self {
        let mut sum = Self::new();
        sum.extend(iter);
        sum
    }
}

/// Mean and count of the finite values, `None` when there are none.
pub fn finite_mean<I: IntoIterator<Item = f64>>(values: I) -> Option<(f64, u32)> {
    let mut sum = CompensatedSum::new();
    let mut n = 0u32;
    for v in values.into_iter().filter(|v| v.is_finite()) {
        sum.add(v);
        n += 1;
    }
    (n > 0).then(|| (sum.value() / n as f64, n))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recovers_small_terms() {
        // Naive summation loses every 1.0 against 1e16.
        let values = [1e16, 1.0, 1.0, 1.0, 1.0, -1e16];
        let naive: f64 = values.iter().sum();
        let compensated: CompensatedSum = values.iter().copied().collect();
        assert_eq!(compensated.value(), 4.0);
        assert_ne!(naive, 4.0);
    }

    #[test]
    fn test_finite_mean_skips_nan() {
        let (mean, n) = finite_mean([1.0, f64::NAN, 3.0]).unwrap();
        assert_eq!(mean, 2.0);
        assert_eq!(n, 2);
        assert!(finite_mean([f64::NAN]).is_none());
    }
}
