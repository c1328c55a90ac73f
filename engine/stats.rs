//! Descriptive statistics and significance tests shared by the effect
//! injectors and the validator.
//!
//! Everything here is a pure function over in-memory arrays. Degenerate
//! inputs (empty samples, zero variance, undefined tables) surface as
//! `NaN` moments or `None` test results rather than errors, so batch
//! pipelines keep running past a single malformed synthetic sample.

use itertools::Itertools;
use ndarray::Array1;
use statrs::distribution::{ContinuousCDF, Normal, StudentsT};

/// Arithmetic mean. `NaN` for an empty sample.
pub fn mean(data: &Array1<f64>) -> f64 {
    data.sum() / data.len() as f64
}

/// Variance with the given delta degrees of freedom (0 = population,
/// 1 = sample). `NaN` when `n <= ddof`.
pub fn variance(data: &Array1<f64>, ddof: usize) -> f64 {
    let n = data.len();
    if n <= ddof {
        return f64::NAN;
    }
    let m = mean(data);
    let sum_sq: f64 = data.iter().map(|&x| (x - m) * (x - m)).sum();
    sum_sq / (n - ddof) as f64
}

/// Standard deviation with the given delta degrees of freedom.
pub fn std_dev(data: &Array1<f64>, ddof: usize) -> f64 {
    variance(data, ddof).sqrt()
}

/// Mean over the non-NaN entries. `NaN` when every entry is missing.
pub fn nan_mean(data: &Array1<f64>) -> f64 {
    let mut sum = 0.0;
    let mut count = 0usize;
    for &x in data.iter() {
        if !x.is_nan() {
            sum += x;
            count += 1;
        }
    }
    sum / count as f64
}

/// Population standard deviation over the non-NaN entries.
pub fn nan_std(data: &Array1<f64>) -> f64 {
    let m = nan_mean(data);
    let mut sum_sq = 0.0;
    let mut count = 0usize;
    for &x in data.iter() {
        if !x.is_nan() {
            sum_sq += (x - m) * (x - m);
            count += 1;
        }
    }
    (sum_sq / count as f64).sqrt()
}

/// Percentile with linear interpolation between order statistics, the
/// convention spreadsheet and array libraries share. `q` is in [0, 100].
/// `NaN` for an empty sample.
pub fn percentile(data: &Array1<f64>, q: f64) -> f64 {
    percentile_of_sorted(
        &data
            .iter()
            .copied()
            .sorted_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
            .collect::<Vec<_>>(),
        q,
    )
}

/// Percentile over the non-NaN entries.
pub fn nan_percentile(data: &Array1<f64>, q: f64) -> f64 {
    percentile_of_sorted(
        &data
            .iter()
            .copied()
            .filter(|x| !x.is_nan())
            .sorted_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
            .collect::<Vec<_>>(),
        q,
    )
}

fn percentile_of_sorted(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = q.clamp(0.0, 100.0) / 100.0 * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let weight = rank - lo as f64;
    sorted[lo] * (1.0 - weight) + sorted[hi] * weight
}

/// Median (50th percentile). `NaN` for an empty sample.
pub fn median(data: &Array1<f64>) -> f64 {
    percentile(data, 50.0)
}

/// Cohen's d between the two arms of a 0/1 group assignment, using the
/// pooled sample standard deviation. `NaN` when either arm has fewer
/// than two observations or the pooled spread is zero.
pub fn cohens_d(data: &Array1<f64>, group: &Array1<u8>) -> f64 {
    let group0: Array1<f64> = data
        .iter()
        .zip(group.iter())
        .filter(|(_, &g)| g == 0)
        .map(|(&x, _)| x)
        .collect();
    let group1: Array1<f64> = data
        .iter()
        .zip(group.iter())
        .filter(|(_, &g)| g == 1)
        .map(|(&x, _)| x)
        .collect();
    let (n0, n1) = (group0.len(), group1.len());
    if n0 < 2 || n1 < 2 {
        return f64::NAN;
    }
    let pooled_var = ((n0 - 1) as f64 * variance(&group0, 1)
        + (n1 - 1) as f64 * variance(&group1, 1))
        / (n0 + n1 - 2) as f64;
    let pooled_std = pooled_var.sqrt();
    if pooled_std == 0.0 {
        return f64::NAN;
    }
    (mean(&group1) - mean(&group0)) / pooled_std
}

/// A 2x2 exposure-by-outcome contingency table:
///
/// ```text
///              Outcome 1   Outcome 0
/// Exposed          a           b
/// Unexposed        c           d
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TwoByTwo {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
}

impl TwoByTwo {
    /// Tally the table from paired 0/1 arrays. Entries other than 0/1
    /// are ignored; the caller is responsible for length agreement.
    pub fn from_arrays(outcome: &Array1<u8>, exposure: &Array1<u8>) -> Self {
        let mut table = TwoByTwo {
            a: 0.0,
            b: 0.0,
            c: 0.0,
            d: 0.0,
        };
        for (&y, &e) in outcome.iter().zip(exposure.iter()) {
            match (e, y) {
                (1, 1) => table.a += 1.0,
                (1, 0) => table.b += 1.0,
                (0, 1) => table.c += 1.0,
                (0, 0) => table.d += 1.0,
                _ => {}
            }
        }
        table
    }

    /// `(a*d)/(b*c)`. `None` when a denominator cell is empty, which
    /// leaves the odds ratio undefined.
    pub fn odds_ratio(&self) -> Option<f64> {
        if self.b == 0.0 || self.c == 0.0 {
            return None;
        }
        Some((self.a * self.d) / (self.b * self.c))
    }

    pub fn has_empty_cell(&self) -> bool {
        self.a == 0.0 || self.b == 0.0 || self.c == 0.0 || self.d == 0.0
    }

    /// Standard error of ln(OR): `sqrt(1/a + 1/b + 1/c + 1/d)`.
    /// `None` when any cell is empty.
    pub fn log_odds_standard_error(&self) -> Option<f64> {
        if self.has_empty_cell() {
            return None;
        }
        Some((1.0 / self.a + 1.0 / self.b + 1.0 / self.c + 1.0 / self.d).sqrt())
    }
}

/// Two-sample pooled-variance t-test. Returns `(t, two_sided_p)`, or
/// `None` when the test is undefined (fewer than three observations in
/// total, or zero pooled spread).
pub fn pooled_t_test(group0: &Array1<f64>, group1: &Array1<f64>) -> Option<(f64, f64)> {
    let (n0, n1) = (group0.len(), group1.len());
    if n0 == 0 || n1 == 0 || n0 + n1 < 3 {
        return None;
    }
    let df = (n0 + n1 - 2) as f64;
    let ss0 = if n0 > 1 {
        (n0 - 1) as f64 * variance(group0, 1)
    } else {
        0.0
    };
    let ss1 = if n1 > 1 {
        (n1 - 1) as f64 * variance(group1, 1)
    } else {
        0.0
    };
    let pooled_var = (ss0 + ss1) / df;
    let se = (pooled_var * (1.0 / n0 as f64 + 1.0 / n1 as f64)).sqrt();
    if se == 0.0 || !se.is_finite() {
        return None;
    }
    let t = (mean(group1) - mean(group0)) / se;
    let dist = StudentsT::new(0.0, 1.0, df).ok()?;
    let p = 2.0 * (1.0 - dist.cdf(t.abs()));
    Some((t, p))
}

/// Mann-Whitney U test with the tie-corrected normal approximation.
/// Returns `(z, two_sided_p)`, or `None` when either sample is empty or
/// every value is tied.
pub fn mann_whitney(x: &Array1<f64>, y: &Array1<f64>) -> Option<(f64, f64)> {
    let (n1, n2) = (x.len(), y.len());
    if n1 == 0 || n2 == 0 {
        return None;
    }
    let combined: Vec<f64> = x.iter().chain(y.iter()).copied().collect();
    let ranks = ranks_with_ties(&combined);

    // Rank sum of the second sample.
    let r2: f64 = ranks[n1..].iter().sum();
    let u2 = r2 - (n2 * (n2 + 1)) as f64 / 2.0;
    let u1 = (n1 * n2) as f64 - u2;
    let u = u1.min(u2);

    let total = (n1 + n2) as f64;
    let mu = (n1 * n2) as f64 / 2.0;
    let tie_term: f64 = tie_counts(&combined)
        .into_iter()
        .map(|t| {
            let t = t as f64;
            t * t * t - t
        })
        .sum();
    let variance = (n1 * n2) as f64 / 12.0 * ((total + 1.0) - tie_term / (total * (total - 1.0)));
    if variance <= 0.0 {
        return None;
    }
    let z = (u - mu) / variance.sqrt();
    Some((z, two_sided_normal_p(z)))
}

/// Pearson product-moment correlation. `NaN` when either marginal has
/// zero spread.
pub fn pearson(x: &Array1<f64>, y: &Array1<f64>) -> f64 {
    let n = x.len().min(y.len());
    if n == 0 {
        return f64::NAN;
    }
    let mx = mean(x);
    let my = mean(y);
    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for (&xi, &yi) in x.iter().zip(y.iter()) {
        cov += (xi - mx) * (yi - my);
        var_x += (xi - mx) * (xi - mx);
        var_y += (yi - my) * (yi - my);
    }
    cov / (var_x.sqrt() * var_y.sqrt())
}

/// Spearman rank correlation: Pearson over average ranks.
pub fn spearman(x: &Array1<f64>, y: &Array1<f64>) -> f64 {
    let xv = x.to_vec();
    let yv = y.to_vec();
    let rx = Array1::from_vec(ranks_with_ties(&xv));
    let ry = Array1::from_vec(ranks_with_ties(&yv));
    pearson(&rx, &ry)
}

/// Two-sided p-value for a correlation coefficient via the t transform
/// with `n - 2` degrees of freedom. `None` when undefined (`n <= 2`);
/// `Some(0.0)` at |r| = 1 where the transform diverges.
pub fn correlation_p_value(r: f64, n: usize) -> Option<f64> {
    if n <= 2 || !r.is_finite() {
        return None;
    }
    if r.abs() >= 1.0 {
        return Some(0.0);
    }
    let df = (n - 2) as f64;
    let t = r * (df / (1.0 - r * r)).sqrt();
    let dist = StudentsT::new(0.0, 1.0, df).ok()?;
    Some(2.0 * (1.0 - dist.cdf(t.abs())))
}

/// Average ranks (1-based), with ties sharing their midpoint rank.
pub fn ranks_with_ties(values: &[f64]) -> Vec<f64> {
    let order: Vec<usize> = (0..values.len())
        .sorted_by(|&i, &j| {
            values[i]
                .partial_cmp(&values[j])
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .collect();
    let mut ranks = vec![0.0; values.len()];
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j < order.len() && values[order[j]] == values[order[i]] {
            j += 1;
        }
        let avg_rank = (i + 1 + j) as f64 / 2.0;
        for &idx in &order[i..j] {
            ranks[idx] = avg_rank;
        }
        i = j;
    }
    ranks
}

fn tie_counts(values: &[f64]) -> Vec<usize> {
    let sorted: Vec<f64> = values
        .iter()
        .copied()
        .sorted_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .collect();
    let mut counts = Vec::new();
    let mut i = 0;
    while i < sorted.len() {
        let mut j = i;
        while j < sorted.len() && sorted[j] == sorted[i] {
            j += 1;
        }
        if j - i > 1 {
            counts.push(j - i);
        }
        i = j;
    }
    counts
}

/// `2 * (1 - Phi(|z|))`.
pub fn two_sided_normal_p(z: f64) -> f64 {
    2.0 * (1.0 - standard_normal().cdf(z.abs()))
}

/// Standard normal quantile function.
pub fn normal_quantile(p: f64) -> f64 {
    standard_normal().inverse_cdf(p)
}

fn standard_normal() -> Normal {
    Normal::new(0.0, 1.0).expect("unit normal parameters are valid")
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn mean_and_variance_small_sample() {
        let data = Array1::from_vec(vec![2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        assert_relative_eq!(mean(&data), 5.0, epsilon = 1e-12);
        assert_relative_eq!(variance(&data, 0), 4.0, epsilon = 1e-12);
        assert_relative_eq!(variance(&data, 1), 32.0 / 7.0, epsilon = 1e-12);
    }

    #[test]
    fn variance_degenerate_is_nan() {
        let data = Array1::from_vec(vec![3.0]);
        assert!(variance(&data, 1).is_nan());
    }

    #[test]
    fn percentile_interpolates() {
        let data = Array1::from_vec(vec![1.0, 2.0, 3.0, 4.0]);
        assert_relative_eq!(percentile(&data, 50.0), 2.5, epsilon = 1e-12);
        assert_relative_eq!(percentile(&data, 25.0), 1.75, epsilon = 1e-12);
        assert_relative_eq!(percentile(&data, 0.0), 1.0, epsilon = 1e-12);
        assert_relative_eq!(percentile(&data, 100.0), 4.0, epsilon = 1e-12);
    }

    #[test]
    fn nan_moments_skip_missing() {
        let data = Array1::from_vec(vec![1.0, f64::NAN, 3.0]);
        assert_relative_eq!(nan_mean(&data), 2.0, epsilon = 1e-12);
        assert_relative_eq!(nan_std(&data), 1.0, epsilon = 1e-12);
        assert_relative_eq!(nan_percentile(&data, 50.0), 2.0, epsilon = 1e-12);
    }

    #[test]
    fn cohens_d_known_value() {
        let data = Array1::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 3.0, 4.0, 5.0, 6.0, 7.0]);
        let group = Array1::from_vec(vec![0, 0, 0, 0, 0, 1, 1, 1, 1, 1]);
        // Equal spreads, mean shift of 2, pooled sd sqrt(2.5).
        assert_relative_eq!(cohens_d(&data, &group), 2.0 / 2.5f64.sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn cohens_d_zero_spread_is_nan() {
        let data = Array1::from_vec(vec![1.0, 1.0, 1.0, 1.0]);
        let group = Array1::from_vec(vec![0, 0, 1, 1]);
        assert!(cohens_d(&data, &group).is_nan());
    }

    #[test]
    fn odds_ratio_strong_association() {
        let table = TwoByTwo {
            a: 9.0,
            b: 1.0,
            c: 1.0,
            d: 9.0,
        };
        assert_relative_eq!(table.odds_ratio().unwrap(), 81.0, epsilon = 1e-12);
    }

    #[test]
    fn odds_ratio_undefined_with_empty_cell() {
        let table = TwoByTwo {
            a: 5.0,
            b: 0.0,
            c: 3.0,
            d: 2.0,
        };
        assert!(table.odds_ratio().is_none());
        assert!(table.log_odds_standard_error().is_none());
    }

    #[test]
    fn t_test_detects_separation() {
        let group0 = Array1::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        let group1 = Array1::from_vec(vec![11.0, 12.0, 13.0, 14.0, 15.0]);
        let (t, p) = pooled_t_test(&group0, &group1).unwrap();
        assert!(t > 5.0, "t = {t}");
        assert!(p < 1e-4, "p = {p}");
    }

    #[test]
    fn t_test_identical_groups_not_significant() {
        let group = Array1::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        let (t, p) = pooled_t_test(&group, &group.clone()).unwrap();
        assert_relative_eq!(t, 0.0, epsilon = 1e-12);
        assert_relative_eq!(p, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn t_test_zero_spread_undefined() {
        let group = Array1::from_vec(vec![2.0, 2.0, 2.0]);
        assert!(pooled_t_test(&group, &group.clone()).is_none());
    }

    #[test]
    fn ranks_average_ties() {
        let ranks = ranks_with_ties(&[10.0, 20.0, 20.0, 30.0]);
        assert_eq!(ranks, vec![1.0, 2.5, 2.5, 4.0]);
    }

    #[test]
    fn mann_whitney_shifted_samples() {
        let x = Array1::from_iter((0..50).map(|i| i as f64));
        let y = Array1::from_iter((0..50).map(|i| i as f64 + 40.0));
        let (_, p) = mann_whitney(&x, &y).unwrap();
        assert!(p < 1e-6, "p = {p}");
    }

    #[test]
    fn mann_whitney_all_tied_undefined() {
        let x = Array1::from_vec(vec![1.0, 1.0, 1.0]);
        let y = Array1::from_vec(vec![1.0, 1.0]);
        assert!(mann_whitney(&x, &y).is_none());
    }

    #[test]
    fn pearson_perfect_linear() {
        let x = Array1::from_vec(vec![1.0, 2.0, 3.0, 4.0]);
        let y = Array1::from_vec(vec![2.0, 4.0, 6.0, 8.0]);
        assert_relative_eq!(pearson(&x, &y), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn spearman_monotone_nonlinear() {
        let x = Array1::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        let y = x.mapv(|v| v * v * v);
        assert_relative_eq!(spearman(&x, &y), 1.0, epsilon = 1e-12);
        assert!(pearson(&x, &y) < 1.0);
    }

    #[test]
    fn correlation_p_extremes() {
        assert_eq!(correlation_p_value(1.0, 20), Some(0.0));
        assert!(correlation_p_value(0.5, 2).is_none());
        let p = correlation_p_value(0.0, 30).unwrap();
        assert_relative_eq!(p, 1.0, epsilon = 1e-9);
    }
}
