//! Statistical back-validation: recompute each targeted effect from the
//! final (perturbed) data and compare it with the original target.
//!
//! A check passes only when both conditions hold: the realized magnitude
//! is within the relative tolerance band, and the observed significance
//! matches the expectation. An undefined test statistic (degenerate 2x2
//! table, empty stratum) yields a `None` p-value, which never passes.

use crate::stats::{self, TwoByTwo};
use crate::types::{DEFAULT_ALPHA, DEFAULT_TOLERANCE, EffectKind, EffectSpec};
use ndarray::Array1;
use serde::Serialize;
use statrs::distribution::{ChiSquared, ContinuousCDF};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

/// Half-width multiplier for 95% Wald intervals.
const Z_95: f64 = 1.96;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("data and group arrays must have equal length, got {data} and {group}")]
    GroupLengthMismatch { data: usize, group: usize },
    #[error("paired arrays must have equal length, got {first} and {second}")]
    PairLengthMismatch { first: usize, second: usize },
    #[error("effect kind {kind:?} does not match the supplied data arrays")]
    EffectDataMismatch { kind: EffectKind },
}

/// Which correlation coefficient to validate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationMethod {
    Pearson,
    Spearman,
}

/// The arrays an [`EffectSpec`] check runs over; the variant must match
/// the spec's effect kind.
#[derive(Debug, Clone, Copy)]
pub enum EffectData<'a> {
    /// Continuous values split by a 0/1 arm (mean difference).
    Groups {
        data: &'a Array1<f64>,
        group: &'a Array1<u8>,
    },
    /// 0/1 outcome against a 0/1 exposure (odds ratio).
    Exposure {
        outcome: &'a Array1<u8>,
        exposure: &'a Array1<u8>,
    },
    /// Censored follow-up against a 0/1 exposure (hazard ratio).
    Survival {
        time: &'a Array1<f64>,
        event: &'a Array1<u8>,
        exposure: &'a Array1<u8>,
    },
    /// Two paired continuous variables (correlation).
    Paired {
        x: &'a Array1<f64>,
        y: &'a Array1<f64>,
    },
}

/// Outcome of one validation call. Created once, never mutated.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationResult {
    pub passed: bool,
    pub metric: String,
    pub expected: f64,
    pub actual: f64,
    pub tolerance: f64,
    pub p_value: Option<f64>,
    pub confidence_interval: Option<(f64, f64)>,
    pub message: String,
}

impl fmt::Display for ValidationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = if self.passed { "PASS" } else { "FAIL" };
        write!(
            f,
            "{status} | {}: expected={:.3}, actual={:.3} (tolerance +/-{:.0}%)",
            self.metric,
            self.expected,
            self.actual,
            self.tolerance * 100.0
        )
    }
}

/// Aggregate view over every result a validator has recorded.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub pass_rate: f64,
    pub all_passed: bool,
}

/// Recomputes effects from final data and scores them against targets,
/// collecting results in call order for reporting.
#[derive(Debug)]
pub struct StatisticalValidator {
    tolerance: f64,
    alpha: f64,
    results: Vec<ValidationResult>,
}

impl Default for StatisticalValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl StatisticalValidator {
    pub fn new() -> Self {
        Self {
            tolerance: DEFAULT_TOLERANCE,
            alpha: DEFAULT_ALPHA,
            results: Vec::new(),
        }
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn results(&self) -> &[ValidationResult] {
        &self.results
    }

    /// Arm-1 minus arm-0 mean difference, tested with the pooled
    /// two-sample t-test and a Wald 95% interval.
    pub fn validate_mean_difference(
        &mut self,
        data: &Array1<f64>,
        group: &Array1<u8>,
        expected_diff: f64,
        expect_significant: bool,
    ) -> Result<ValidationResult, ValidationError> {
        if data.len() != group.len() {
            return Err(ValidationError::GroupLengthMismatch {
                data: data.len(),
                group: group.len(),
            });
        }
        let group0 = arm(data, group, 0);
        let group1 = arm(data, group, 1);

        if group0.is_empty() || group1.is_empty() {
            return Ok(self.record(ValidationResult {
                passed: false,
                metric: "mean difference".to_string(),
                expected: expected_diff,
                actual: f64::NAN,
                tolerance: self.tolerance,
                p_value: None,
                confidence_interval: None,
                message: "an arm is empty".to_string(),
            }));
        }

        let actual = stats::mean(&group1) - stats::mean(&group0);
        let test = stats::pooled_t_test(&group0, &group1);
        let se = (stats::variance(&group0, 0) / group0.len() as f64
            + stats::variance(&group1, 0) / group1.len() as f64)
            .sqrt();
        let ci = (actual - Z_95 * se, actual + Z_95 * se);

        let p_value = test.map(|(_, p)| p);
        let passed = self.check_value(actual, expected_diff)
            && self.check_significance(p_value, expect_significant);
        let message = match test {
            Some((t, p)) => format!("t={t:.2}, p={p:.4}"),
            None => "t-test undefined".to_string(),
        };
        Ok(self.record(ValidationResult {
            passed,
            metric: "mean difference".to_string(),
            expected: expected_diff,
            actual,
            tolerance: self.tolerance,
            p_value,
            confidence_interval: Some(ci),
            message,
        }))
    }

    /// 2x2-table odds ratio with a Wald z-test and 95% interval on the
    /// log scale. An empty denominator cell leaves the OR at 0 or
    /// infinity and the p-value undefined (a non-pass).
    pub fn validate_odds_ratio(
        &mut self,
        outcome: &Array1<u8>,
        exposure: &Array1<u8>,
        expected_or: f64,
        expect_significant: bool,
    ) -> Result<ValidationResult, ValidationError> {
        if outcome.len() != exposure.len() {
            return Err(ValidationError::PairLengthMismatch {
                first: outcome.len(),
                second: exposure.len(),
            });
        }
        let table = TwoByTwo::from_arrays(outcome, exposure);
        let actual = match table.odds_ratio() {
            Some(or) => or,
            None => {
                if table.a * table.d > 0.0 {
                    f64::INFINITY
                } else {
                    0.0
                }
            }
        };

        let (p_value, ci, message) = match table.log_odds_standard_error() {
            Some(se) => {
                let log_or = actual.ln();
                let z = log_or / se;
                let p = stats::two_sided_normal_p(z);
                let ci = ((log_or - Z_95 * se).exp(), (log_or + Z_95 * se).exp());
                let message = format!("OR={actual:.2}, 95%CI=({:.2}, {:.2})", ci.0, ci.1);
                (Some(p), Some(ci), message)
            }
            None => (None, None, "table has an empty cell".to_string()),
        };

        let passed = self.check_value(actual, expected_or)
            && self.check_significance(p_value, expect_significant);
        Ok(self.record(ValidationResult {
            passed,
            metric: "odds ratio".to_string(),
            expected: expected_or,
            actual,
            tolerance: self.tolerance,
            p_value,
            confidence_interval: ci,
            message,
        }))
    }

    /// Pearson or Spearman correlation with the t-transform p-value and
    /// a Fisher-z 95% interval.
    pub fn validate_correlation(
        &mut self,
        x: &Array1<f64>,
        y: &Array1<f64>,
        expected_r: f64,
        expect_significant: bool,
        method: CorrelationMethod,
    ) -> Result<ValidationResult, ValidationError> {
        if x.len() != y.len() {
            return Err(ValidationError::PairLengthMismatch {
                first: x.len(),
                second: y.len(),
            });
        }
        let metric = match method {
            CorrelationMethod::Pearson => "pearson correlation",
            CorrelationMethod::Spearman => "spearman correlation",
        };
        let n = x.len();
        let actual = match method {
            CorrelationMethod::Pearson => stats::pearson(x, y),
            CorrelationMethod::Spearman => stats::spearman(x, y),
        };
        let p_value = stats::correlation_p_value(actual, n);

        // Fisher z interval needs n > 3 and |r| < 1.
        let ci = if n > 3 && actual.abs() < 1.0 {
            let z = actual.atanh();
            let se = 1.0 / ((n - 3) as f64).sqrt();
            Some(((z - Z_95 * se).tanh(), (z + Z_95 * se).tanh()))
        } else {
            None
        };

        let passed = self.check_value(actual, expected_r)
            && self.check_significance(p_value, expect_significant);
        let message = match p_value {
            Some(p) => format!("r={actual:.3}, p={p:.4}"),
            None => "correlation test undefined".to_string(),
        };
        Ok(self.record(ValidationResult {
            passed,
            metric: metric.to_string(),
            expected: expected_r,
            actual,
            tolerance: self.tolerance,
            p_value,
            confidence_interval: ci,
            message,
        }))
    }

    /// Hazard ratio estimated from the event-only arm median ratio,
    /// tested with a Mann-Whitney proxy for the log-rank comparison of
    /// the observed times.
    pub fn validate_hazard_ratio(
        &mut self,
        time: &Array1<f64>,
        event: &Array1<u8>,
        exposure: &Array1<u8>,
        expected_hr: f64,
        expect_significant: bool,
    ) -> Result<ValidationResult, ValidationError> {
        if time.len() != event.len() {
            return Err(ValidationError::PairLengthMismatch {
                first: time.len(),
                second: event.len(),
            });
        }
        if time.len() != exposure.len() {
            return Err(ValidationError::GroupLengthMismatch {
                data: time.len(),
                group: exposure.len(),
            });
        }
        let events0: Array1<f64> = time
            .iter()
            .zip(event.iter())
            .zip(exposure.iter())
            .filter(|((_, &ev), &ex)| ev == 1 && ex == 0)
            .map(|((&t, _), _)| t)
            .collect();
        let events1: Array1<f64> = time
            .iter()
            .zip(event.iter())
            .zip(exposure.iter())
            .filter(|((_, &ev), &ex)| ev == 1 && ex == 1)
            .map(|((&t, _), _)| t)
            .collect();

        let actual = if !events0.is_empty() && !events1.is_empty() {
            let median1 = stats::median(&events1);
            if median1 > 0.0 {
                stats::median(&events0) / median1
            } else {
                f64::INFINITY
            }
        } else {
            1.0
        };

        let arm0 = arm(time, exposure, 0);
        let arm1 = arm(time, exposure, 1);
        let p_value = stats::mann_whitney(&arm0, &arm1).map(|(_, p)| p);

        let passed = self.check_value(actual, expected_hr)
            && self.check_significance(p_value, expect_significant);
        Ok(self.record(ValidationResult {
            passed,
            metric: "hazard ratio".to_string(),
            expected: expected_hr,
            actual,
            tolerance: self.tolerance,
            p_value,
            confidence_interval: None,
            message: format!("HR~{actual:.2} (event-median ratio estimate)"),
        }))
    }

    /// Area under the ROC curve from the Mann-Whitney U statistic, with
    /// the Hanley-McNeil variance and a z-test against 0.5.
    pub fn validate_auc(
        &mut self,
        labels: &Array1<u8>,
        scores: &Array1<f64>,
        expected_auc: f64,
        expect_significant: bool,
    ) -> Result<ValidationResult, ValidationError> {
        if labels.len() != scores.len() {
            return Err(ValidationError::PairLengthMismatch {
                first: labels.len(),
                second: scores.len(),
            });
        }
        let positives: Vec<f64> = scores
            .iter()
            .zip(labels.iter())
            .filter(|(_, &y)| y == 1)
            .map(|(&s, _)| s)
            .collect();
        let negatives: Vec<f64> = scores
            .iter()
            .zip(labels.iter())
            .filter(|(_, &y)| y == 0)
            .map(|(&s, _)| s)
            .collect();
        let (n_pos, n_neg) = (positives.len() as f64, negatives.len() as f64);

        if positives.is_empty() || negatives.is_empty() {
            return Ok(self.record(ValidationResult {
                passed: false,
                metric: "auc".to_string(),
                expected: expected_auc,
                actual: f64::NAN,
                tolerance: self.tolerance,
                p_value: None,
                confidence_interval: None,
                message: "one class is empty".to_string(),
            }));
        }

        let mut u = 0.0;
        for &pos in &positives {
            for &neg in &negatives {
                if pos > neg {
                    u += 1.0;
                } else if pos == neg {
                    u += 0.5;
                }
            }
        }
        let auc = u / (n_pos * n_neg);

        // Hanley-McNeil variance for the U-statistic AUC estimate.
        let q1 = auc / (2.0 - auc);
        let q2 = 2.0 * auc * auc / (1.0 + auc);
        let variance = (auc * (1.0 - auc)
            + (n_pos - 1.0) * (q1 - auc * auc)
            + (n_neg - 1.0) * (q2 - auc * auc))
            / (n_pos * n_neg);
        let se = variance.max(0.0).sqrt();

        let (p_value, ci) = if se > 0.0 {
            let z = (auc - 0.5) / se;
            (
                Some(stats::two_sided_normal_p(z)),
                Some((auc - Z_95 * se, auc + Z_95 * se)),
            )
        } else {
            (None, None)
        };

        let sig_ok = match p_value {
            Some(p) => {
                if expect_significant {
                    p < self.alpha && auc > 0.5
                } else {
                    p >= self.alpha || auc <= 0.5
                }
            }
            None => false,
        };
        let passed = self.check_value(auc, expected_auc) && sig_ok;
        let message = match ci {
            Some((lo, hi)) => format!("AUC={auc:.3}, 95%CI=({lo:.3}, {hi:.3})"),
            None => format!("AUC={auc:.3}"),
        };
        Ok(self.record(ValidationResult {
            passed,
            metric: "auc".to_string(),
            expected: expected_auc,
            actual: auc,
            tolerance: self.tolerance,
            p_value,
            confidence_interval: ci,
            message,
        }))
    }

    /// Check that two arms are statistically indistinguishable on a
    /// baseline covariate: a t-test for continuous data (more than ten
    /// distinct values), a chi-squared contingency test otherwise.
    /// Passes when p exceeds `threshold`.
    pub fn validate_group_balance(
        &mut self,
        data: &Array1<f64>,
        group: &Array1<u8>,
        threshold: f64,
    ) -> Result<ValidationResult, ValidationError> {
        if data.len() != group.len() {
            return Err(ValidationError::GroupLengthMismatch {
                data: data.len(),
                group: group.len(),
            });
        }
        let group0 = arm(data, group, 0);
        let group1 = arm(data, group, 1);

        let distinct: BTreeSet<u64> = data.iter().map(|x| x.to_bits()).collect();
        let (actual, p_value) = if distinct.len() > 10 {
            let p = stats::pooled_t_test(&group0, &group1).map(|(_, p)| p);
            (stats::mean(&group1) - stats::mean(&group0), p)
        } else {
            chi_squared_balance(&group0, &group1)
        };

        let passed = matches!(p_value, Some(p) if p > threshold);
        let message = match p_value {
            Some(p) => format!(
                "p={p:.4} ({})",
                if passed { "balanced" } else { "imbalanced" }
            ),
            None => "balance test undefined".to_string(),
        };
        Ok(self.record(ValidationResult {
            passed,
            metric: "group balance".to_string(),
            expected: 0.0,
            actual,
            tolerance: self.tolerance,
            p_value,
            confidence_interval: None,
            message,
        }))
    }

    /// Check one effect specification against the matching data arrays,
    /// honoring the spec's own tolerance and significance level.
    pub fn validate_effect(
        &mut self,
        spec: &EffectSpec,
        data: EffectData<'_>,
    ) -> Result<ValidationResult, ValidationError> {
        let (saved_tolerance, saved_alpha) = (self.tolerance, self.alpha);
        self.tolerance = spec.tolerance;
        self.alpha = spec.alpha;
        let result = match (spec.kind, data) {
            (EffectKind::MeanDifference, EffectData::Groups { data, group }) => {
                self.validate_mean_difference(data, group, spec.target, spec.expect_significant)
            }
            (EffectKind::OddsRatio, EffectData::Exposure { outcome, exposure }) => {
                self.validate_odds_ratio(outcome, exposure, spec.target, spec.expect_significant)
            }
            (
                EffectKind::HazardRatio,
                EffectData::Survival {
                    time,
                    event,
                    exposure,
                },
            ) => self.validate_hazard_ratio(
                time,
                event,
                exposure,
                spec.target,
                spec.expect_significant,
            ),
            (EffectKind::Correlation, EffectData::Paired { x, y }) => self.validate_correlation(
                x,
                y,
                spec.target,
                spec.expect_significant,
                CorrelationMethod::Pearson,
            ),
            _ => Err(ValidationError::EffectDataMismatch { kind: spec.kind }),
        };
        self.tolerance = saved_tolerance;
        self.alpha = saved_alpha;
        result
    }

    /// Counts and pass rate over everything recorded so far.
    pub fn summary(&self) -> ValidationSummary {
        let total = self.results.len();
        let passed = self.results.iter().filter(|r| r.passed).count();
        ValidationSummary {
            total,
            passed,
            failed: total - passed,
            pass_rate: if total > 0 {
                passed as f64 / total as f64
            } else {
                0.0
            },
            all_passed: passed == total,
        }
    }

    /// Markdown report listing the summary and every recorded result.
    pub fn report(&self) -> String {
        let summary = self.summary();
        let mut lines = vec![
            "# Validation report".to_string(),
            String::new(),
            "## Summary".to_string(),
            format!("- checks: {}", summary.total),
            format!("- passed: {}", summary.passed),
            format!("- failed: {}", summary.failed),
            format!("- pass rate: {:.1}%", summary.pass_rate * 100.0),
            String::new(),
            "## Results".to_string(),
            String::new(),
        ];
        for result in &self.results {
            lines.push(format!(
                "### {} {}",
                if result.passed { "[pass]" } else { "[FAIL]" },
                result.metric
            ));
            lines.push(format!("- expected: {:.4}", result.expected));
            lines.push(format!("- actual: {:.4}", result.actual));
            if let Some(p) = result.p_value {
                lines.push(format!("- p-value: {p:.4}"));
            }
            if let Some((lo, hi)) = result.confidence_interval {
                lines.push(format!("- 95% CI: ({lo:.4}, {hi:.4})"));
            }
            if !result.message.is_empty() {
                lines.push(format!("- note: {}", result.message));
            }
            lines.push(String::new());
        }
        lines.join("\n")
    }

    fn record(&mut self, result: ValidationResult) -> ValidationResult {
        self.results.push(result.clone());
        result
    }

    /// Relative-error band around the target; an expected value of zero
    /// falls back to an absolute band. Non-finite actuals never pass.
    fn check_value(&self, actual: f64, expected: f64) -> bool {
        if !actual.is_finite() {
            return false;
        }
        if expected == 0.0 {
            return actual.abs() < self.tolerance;
        }
        (actual - expected).abs() / expected.abs() <= self.tolerance
    }

    fn check_significance(&self, p_value: Option<f64>, expect_significant: bool) -> bool {
        match p_value {
            Some(p) => {
                if expect_significant {
                    p < self.alpha
                } else {
                    p >= self.alpha
                }
            }
            None => false,
        }
    }
}

fn arm(data: &Array1<f64>, group: &Array1<u8>, which: u8) -> Array1<f64> {
    data.iter()
        .zip(group.iter())
        .filter(|(_, &g)| g == which)
        .map(|(&x, _)| x)
        .collect()
}

/// Chi-squared test over the 2 x k contingency table of two arms'
/// categorical values. Returns (statistic, p).
fn chi_squared_balance(group0: &Array1<f64>, group1: &Array1<f64>) -> (f64, Option<f64>) {
    let categories: BTreeSet<u64> = group0
        .iter()
        .chain(group1.iter())
        .map(|x| x.to_bits())
        .collect();
    let k = categories.len();
    if k < 2 || group0.is_empty() || group1.is_empty() {
        return (f64::NAN, None);
    }
    let count = |arm: &Array1<f64>, bits: u64| {
        arm.iter().filter(|x| x.to_bits() == bits).count() as f64
    };
    let n0 = group0.len() as f64;
    let n1 = group1.len() as f64;
    let total = n0 + n1;

    let mut statistic = 0.0;
    for &bits in &categories {
        let observed0 = count(group0, bits);
        let observed1 = count(group1, bits);
        let column_total = observed0 + observed1;
        let expected0 = n0 * column_total / total;
        let expected1 = n1 * column_total / total;
        if expected0 > 0.0 {
            statistic += (observed0 - expected0).powi(2) / expected0;
        }
        if expected1 > 0.0 {
            statistic += (observed1 - expected1).powi(2) / expected1;
        }
    }
    let dof = (k - 1) as f64;
    let p = ChiSquared::new(dof).ok().map(|dist| 1.0 - dist.cdf(statistic));
    (statistic, p)
}
