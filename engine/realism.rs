//! Field-data perturbations applied to already-generated variables:
//! missingness, measurement error, outliers, misclassification,
//! precision loss, range enforcement, dropout, and cross-variable
//! consistency repair.
//!
//! Missing values use the `NaN` sentinel; downstream consumers treat an
//! empty cell and `NaN` interchangeably.

use crate::dataset::{Column, Dataset, DatasetError};
use crate::stats;
use ndarray::Array1;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RealismError {
    #[error("rate must lie in [0, 1], got {0}")]
    InvalidRate(f64),
    #[error("error spread must be non-negative and finite, got {0}")]
    InvalidErrorSpread(f64),
    #[error("missing-at-random requires a related variable to stratify on")]
    MissingRelatedVariable,
    #[error("related variable has {related} rows but the data has {data}")]
    RelatedLengthMismatch { data: usize, related: usize },
    #[error("precision must be positive and finite, got {0}")]
    InvalidPrecision(f64),
    #[error(transparent)]
    Dataset(#[from] DatasetError),
}

/// Why a value goes missing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingMechanism {
    /// Missing completely at random: one uniform rate everywhere.
    #[default]
    Mcar,
    /// Missing at random: the rate rises with a related, observed
    /// variable (0.5x / 1x / 1.5x / 2x by quartile).
    Mar,
    /// Missing not at random: the rate rises with the unobserved value
    /// itself (0.5x / 1x / 1.5x / 2.5x by quartile).
    Mnar,
}

/// How measurement error enters a reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementErrorKind {
    /// Add N(0, spread * sd(data)).
    #[default]
    Additive,
    /// Multiply by N(1, spread).
    Multiplicative,
}

/// What kind of outlier replaces a value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutlierKind {
    /// `multiplier` to `multiplier + 1` standard deviations out.
    Extreme,
    /// Two to `multiplier` standard deviations out.
    Mild,
    /// Uniform over the 1st-99th percentile range widened by half its
    /// own width: rare but physiologically plausible readings.
    #[default]
    Clinical,
}

/// Quantization direction for precision loss.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundingMethod {
    #[default]
    Round,
    Floor,
    Ceil,
}

/// How subjects leave the study early.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropoutMechanism {
    #[default]
    Random,
    /// Currently identical to `Random`: an outcome-driven dropout policy
    /// has not been specified yet and is not silently invented here.
    Related,
}

/// An ordering constraint between two named dataset columns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderingRule {
    /// Column that must stay strictly below `upper`.
    pub lower: String,
    pub upper: String,
    #[serde(default)]
    pub repair: RepairSide,
}

/// Which side of a violated ordering rule gets moved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairSide {
    /// Push the upper variable above the lower one.
    #[default]
    RaiseUpper,
    /// Pull the lower variable below the upper one.
    LowerLower,
}

/// Applies field-data perturbations from a privately-owned seeded stream.
#[derive(Debug)]
pub struct RealismEnhancer {
    rng: StdRng,
}

impl RealismEnhancer {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Blank out a `rate`-fraction of values with the `NaN` sentinel.
    /// MAR stratifies the rate by quartile of `related`; MNAR by
    /// quartile of the data itself, so high values vanish more often.
    pub fn add_missing_values(
        &mut self,
        data: &Array1<f64>,
        rate: f64,
        mechanism: MissingMechanism,
        related: Option<&Array1<f64>>,
    ) -> Result<Array1<f64>, RealismError> {
        check_rate(rate)?;
        let mut result = data.clone();
        match mechanism {
            MissingMechanism::Mcar => {
                for value in result.iter_mut() {
                    if self.rng.gen_range(0.0..1.0) < rate {
                        *value = f64::NAN;
                    }
                }
            }
            MissingMechanism::Mar => {
                let related = related.ok_or(RealismError::MissingRelatedVariable)?;
                if related.len() != data.len() {
                    return Err(RealismError::RelatedLengthMismatch {
                        data: data.len(),
                        related: related.len(),
                    });
                }
                let multipliers = [0.5, 1.0, 1.5, 2.0];
                self.blank_by_quartile(&mut result, related, rate, &multipliers);
            }
            MissingMechanism::Mnar => {
                let driver = data.clone();
                let multipliers = [0.5, 1.0, 1.5, 2.5];
                self.blank_by_quartile(&mut result, &driver, rate, &multipliers);
            }
        }
        Ok(result)
    }

    fn blank_by_quartile(
        &mut self,
        result: &mut Array1<f64>,
        driver: &Array1<f64>,
        rate: f64,
        multipliers: &[f64; 4],
    ) {
        let q1 = stats::percentile(driver, 25.0);
        let q2 = stats::percentile(driver, 50.0);
        let q3 = stats::percentile(driver, 75.0);
        for (value, &d) in result.iter_mut().zip(driver.iter()) {
            let multiplier = if d <= q1 {
                multipliers[0]
            } else if d <= q2 {
                multipliers[1]
            } else if d <= q3 {
                multipliers[2]
            } else {
                multipliers[3]
            };
            if self.rng.gen_range(0.0..1.0) < rate * multiplier {
                *value = f64::NAN;
            }
        }
    }

    /// Overlay measurement error. The additive spread is relative to
    /// the data's own (NaN-aware) standard deviation; existing missing
    /// values stay missing.
    pub fn add_measurement_error(
        &mut self,
        data: &Array1<f64>,
        error_sd: f64,
        kind: MeasurementErrorKind,
    ) -> Result<Array1<f64>, RealismError> {
        if !(error_sd >= 0.0) || !error_sd.is_finite() {
            return Err(RealismError::InvalidErrorSpread(error_sd));
        }
        let noise = match kind {
            MeasurementErrorKind::Additive => {
                let spread = stats::nan_std(data);
                if !spread.is_finite() {
                    // Every value already missing; nothing to perturb.
                    return Ok(data.clone());
                }
                Normal::new(0.0, error_sd * spread)
                    .map_err(|_| RealismError::InvalidErrorSpread(error_sd))?
            }
            MeasurementErrorKind::Multiplicative => Normal::new(1.0, error_sd)
                .map_err(|_| RealismError::InvalidErrorSpread(error_sd))?,
        };
        let mut result = data.clone();
        for value in result.iter_mut() {
            let draw = noise.sample(&mut self.rng);
            match kind {
                MeasurementErrorKind::Additive => *value += draw,
                MeasurementErrorKind::Multiplicative => *value *= draw,
            }
        }
        Ok(result)
    }

    /// Replace a `rate`-fraction of values with outliers of the given
    /// kind. A zero rate returns the input unchanged; a rate of one
    /// replaces every value.
    pub fn add_outliers(
        &mut self,
        data: &Array1<f64>,
        rate: f64,
        kind: OutlierKind,
        multiplier: f64,
    ) -> Result<Array1<f64>, RealismError> {
        check_rate(rate)?;
        let mut result = data.clone();
        let mask: Vec<bool> = (0..data.len())
            .map(|_| self.rng.gen_range(0.0..1.0) < rate)
            .collect();
        if !mask.iter().any(|&m| m) {
            return Ok(result);
        }

        let center = stats::nan_mean(data);
        let spread = stats::nan_std(data);
        let (q01, q99) = (
            stats::nan_percentile(data, 1.0),
            stats::nan_percentile(data, 99.0),
        );
        let clinical_extension = (q99 - q01) * 0.5;

        for (value, selected) in result.iter_mut().zip(mask.into_iter()) {
            if !selected {
                continue;
            }
            *value = match kind {
                OutlierKind::Extreme => {
                    let direction = if self.rng.gen_bool(0.5) { 1.0 } else { -1.0 };
                    let offset = uniform_between(&mut self.rng, multiplier, multiplier + 1.0);
                    center + direction * offset * spread
                }
                OutlierKind::Mild => {
                    let direction = if self.rng.gen_bool(0.5) { 1.0 } else { -1.0 };
                    let offset = uniform_between(&mut self.rng, 2.0, multiplier);
                    center + direction * offset * spread
                }
                OutlierKind::Clinical => uniform_between(
                    &mut self.rng,
                    q01 - clinical_extension,
                    q99 + clinical_extension,
                ),
            };
        }
        Ok(result)
    }

    /// Flip a `rate`-fraction of categorical values to a uniformly
    /// random *different* category. The category set defaults to the
    /// distinct observed values.
    pub fn add_misclassification(
        &mut self,
        data: &Array1<i64>,
        rate: f64,
        categories: Option<&[i64]>,
    ) -> Result<Array1<i64>, RealismError> {
        check_rate(rate)?;
        let observed: Vec<i64> = match categories {
            Some(set) => set.to_vec(),
            None => {
                let mut set: Vec<i64> = data.iter().copied().collect();
                set.sort_unstable();
                set.dedup();
                set
            }
        };
        let mut result = data.clone();
        for value in result.iter_mut() {
            if self.rng.gen_range(0.0..1.0) >= rate {
                continue;
            }
            let current = *value;
            let others: Vec<i64> = observed.iter().copied().filter(|&c| c != current).collect();
            if !others.is_empty() {
                *value = others[self.rng.gen_range(0..others.len())];
            }
        }
        Ok(result)
    }

    /// Remove a `rate`-fraction of subjects jointly across every column.
    /// Returns the filtered dataset and the dropout mask (true = the
    /// subject left the study).
    pub fn add_dropout(
        &mut self,
        dataset: &Dataset,
        rate: f64,
        mechanism: DropoutMechanism,
    ) -> Result<(Dataset, Array1<bool>), RealismError> {
        check_rate(rate)?;
        let n = dataset.n_rows();
        let dropped: Array1<bool> = match mechanism {
            // `Related` intentionally shares the `Random` draw; see the
            // enum documentation.
            DropoutMechanism::Random | DropoutMechanism::Related => {
                Array1::from_iter((0..n).map(|_| self.rng.gen_range(0.0..1.0) < rate))
            }
        };
        let keep = dropped.mapv(|d| !d);
        let filtered = dataset.filter_rows(&keep)?;
        Ok((filtered, dropped))
    }

    /// Repair rows that violate cross-variable ordering rules by moving
    /// one side past the other by a random positive offset |N(1, 0.5)|.
    /// Rules naming columns the dataset does not have (or that are not
    /// numeric) are skipped.
    pub fn ensure_logical_consistency(
        &mut self,
        dataset: &Dataset,
        rules: &[OrderingRule],
    ) -> Result<Dataset, RealismError> {
        let offset_dist = Normal::new(1.0, 0.5).expect("fixed offset parameters are valid");
        let mut result = dataset.clone();
        for rule in rules {
            let (Some(lower), Some(upper)) = (
                result.column(&rule.lower).and_then(Column::to_numeric),
                result.column(&rule.upper).and_then(Column::to_numeric),
            ) else {
                continue;
            };
            let mut lower = lower;
            let mut upper = upper;
            for i in 0..lower.len() {
                if lower[i] >= upper[i] {
                    let offset: f64 = offset_dist.sample(&mut self.rng);
                    match rule.repair {
                        RepairSide::RaiseUpper => upper[i] = lower[i] + offset.abs(),
                        RepairSide::LowerLower => lower[i] = upper[i] - offset.abs(),
                    }
                }
            }
            result.replace(&rule.lower, Column::Numeric(lower))?;
            result.replace(&rule.upper, Column::Numeric(upper))?;
        }
        Ok(result)
    }
}

/// Quantize to a precision grid: 0.1 keeps one decimal, 5.0 snaps to
/// multiples of five.
pub fn round_to_precision(
    data: &Array1<f64>,
    precision: f64,
    method: RoundingMethod,
) -> Result<Array1<f64>, RealismError> {
    if !(precision > 0.0) || !precision.is_finite() {
        return Err(RealismError::InvalidPrecision(precision));
    }
    Ok(data.mapv(|x| {
        let scaled = x / precision;
        let snapped = match method {
            RoundingMethod::Round => scaled.round(),
            RoundingMethod::Floor => scaled.floor(),
            RoundingMethod::Ceil => scaled.ceil(),
        };
        snapped * precision
    }))
}

/// Elementwise clipping into `[min, max]`. Idempotent; `NaN` passes
/// through untouched.
pub fn enforce_range(data: &Array1<f64>, min: Option<f64>, max: Option<f64>) -> Array1<f64> {
    data.mapv(|x| {
        let mut value = x;
        if let Some(lo) = min
            && value < lo
        {
            value = lo;
        }
        if let Some(hi) = max
            && value > hi
        {
            value = hi;
        }
        value
    })
}

fn check_rate(rate: f64) -> Result<(), RealismError> {
    if !(0.0..=1.0).contains(&rate) {
        return Err(RealismError::InvalidRate(rate));
    }
    Ok(())
}

/// Uniform draw that tolerates a degenerate or reversed interval.
fn uniform_between(rng: &mut StdRng, a: f64, b: f64) -> f64 {
    a + (b - a) * rng.gen_range(0.0..1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn linear_data(n: usize) -> Array1<f64> {
        Array1::from_iter((0..n).map(|i| i as f64))
    }

    #[test]
    fn mcar_rate_is_approximate() {
        let mut enhancer = RealismEnhancer::new(42);
        let data = linear_data(100_000);
        let result = enhancer
            .add_missing_values(&data, 0.05, MissingMechanism::Mcar, None)
            .unwrap();
        let missing = result.iter().filter(|x| x.is_nan()).count() as f64 / 100_000.0;
        assert_relative_eq!(missing, 0.05, epsilon = 0.005);
    }

    #[test]
    fn mar_without_related_is_an_error() {
        let mut enhancer = RealismEnhancer::new(1);
        let data = linear_data(100);
        assert!(matches!(
            enhancer.add_missing_values(&data, 0.1, MissingMechanism::Mar, None),
            Err(RealismError::MissingRelatedVariable)
        ));
    }

    #[test]
    fn mnar_blanks_high_values_more_often() {
        let mut enhancer = RealismEnhancer::new(42);
        let data = linear_data(100_000);
        let result = enhancer
            .add_missing_values(&data, 0.08, MissingMechanism::Mnar, None)
            .unwrap();
        let top_missing = result
            .iter()
            .skip(75_000)
            .filter(|x| x.is_nan())
            .count() as f64
            / 25_000.0;
        let bottom_missing = result
            .iter()
            .take(25_000)
            .filter(|x| x.is_nan())
            .count() as f64
            / 25_000.0;
        assert!(
            top_missing > bottom_missing * 3.0,
            "top {top_missing} vs bottom {bottom_missing}"
        );
    }

    #[test]
    fn additive_error_preserves_center() {
        let mut enhancer = RealismEnhancer::new(42);
        let data = linear_data(50_000);
        let result = enhancer
            .add_measurement_error(&data, 0.1, MeasurementErrorKind::Additive)
            .unwrap();
        assert_relative_eq!(
            stats::mean(&result),
            stats::mean(&data),
            epsilon = stats::std_dev(&data, 0) * 0.01
        );
        assert!(result != data);
    }

    #[test]
    fn outlier_rate_zero_is_identity() {
        let mut enhancer = RealismEnhancer::new(3);
        let data = linear_data(1_000);
        let result = enhancer
            .add_outliers(&data, 0.0, OutlierKind::Extreme, 3.0)
            .unwrap();
        assert_eq!(result, data);
    }

    #[test]
    fn outlier_rate_one_replaces_everything() {
        let mut enhancer = RealismEnhancer::new(4);
        let data = Array1::from_iter((0..1_000).map(|i| 100.0 + (i % 7) as f64));
        let result = enhancer
            .add_outliers(&data, 1.0, OutlierKind::Extreme, 3.0)
            .unwrap();
        let changed = result
            .iter()
            .zip(data.iter())
            .filter(|(a, b)| a != b)
            .count();
        assert_eq!(changed, 1_000);
        // Extreme outliers sit at least `multiplier` spreads from the mean.
        let center = stats::mean(&data);
        let spread = stats::std_dev(&data, 0);
        assert!(
            result
                .iter()
                .all(|&x| (x - center).abs() >= 3.0 * spread - 1e-9)
        );
    }

    #[test]
    fn misclassification_only_moves_to_other_categories() {
        let mut enhancer = RealismEnhancer::new(5);
        let data = Array1::from_iter((0..10_000).map(|i| (i % 3) as i64));
        let result = enhancer.add_misclassification(&data, 0.1, None).unwrap();
        let flipped = result
            .iter()
            .zip(data.iter())
            .filter(|(a, b)| a != b)
            .count() as f64
            / 10_000.0;
        assert!((flipped - 0.1).abs() < 0.02, "flipped = {flipped}");
        assert!(result.iter().all(|&v| (0..3).contains(&v)));
    }

    #[test]
    fn misclassification_single_category_is_stuck() {
        let mut enhancer = RealismEnhancer::new(6);
        let data = Array1::from_vec(vec![2i64; 100]);
        let result = enhancer.add_misclassification(&data, 1.0, None).unwrap();
        assert_eq!(result, data);
    }

    #[test]
    fn rounding_grid_examples() {
        let data = Array1::from_vec(vec![1.24, 1.26]);
        let rounded = round_to_precision(&data, 0.1, RoundingMethod::Round).unwrap();
        assert_relative_eq!(rounded[0], 1.2, epsilon = 1e-9);
        assert_relative_eq!(rounded[1], 1.3, epsilon = 1e-9);
        let floored = round_to_precision(&data, 0.1, RoundingMethod::Floor).unwrap();
        assert_relative_eq!(floored[0], 1.2, epsilon = 1e-9);
        assert_relative_eq!(floored[1], 1.2, epsilon = 1e-9);
        let ceiled = round_to_precision(&data, 0.1, RoundingMethod::Ceil).unwrap();
        assert_relative_eq!(ceiled[1], 1.3, epsilon = 1e-9);
    }

    #[test]
    fn enforce_range_is_idempotent() {
        let data = Array1::from_vec(vec![-3.0, 5.0, 14.0, f64::NAN]);
        let once = enforce_range(&data, Some(0.0), Some(10.0));
        let twice = enforce_range(&once, Some(0.0), Some(10.0));
        assert_eq!(once[0], 0.0);
        assert_eq!(once[2], 10.0);
        for (a, b) in once.iter().zip(twice.iter()) {
            assert!(a == b || (a.is_nan() && b.is_nan()));
        }
    }

    #[test]
    fn dropout_applies_one_mask_jointly() {
        let mut enhancer = RealismEnhancer::new(42);
        let mut dataset = Dataset::new();
        dataset
            .push("x", Column::Numeric(linear_data(10_000)))
            .unwrap();
        dataset
            .push(
                "y",
                Column::Integer(Array1::from_iter((0..10_000).map(|i| i as i64))),
            )
            .unwrap();
        let (filtered, dropped) = enhancer
            .add_dropout(&dataset, 0.1, DropoutMechanism::Random)
            .unwrap();
        let kept = dropped.iter().filter(|&&d| !d).count();
        assert_eq!(filtered.n_rows(), kept);
        // Row pairing must survive the filter.
        let x = filtered.column("x").unwrap().as_numeric().unwrap();
        let y = filtered.column("y").unwrap().as_integer().unwrap();
        for (&xv, &yv) in x.iter().zip(y.iter()) {
            assert_eq!(xv as i64, yv);
        }
    }

    #[test]
    fn consistency_repair_restores_ordering() {
        let mut enhancer = RealismEnhancer::new(7);
        let mut dataset = Dataset::new();
        dataset
            .push(
                "diastolic",
                Column::Numeric(Array1::from_vec(vec![80.0, 95.0, 70.0])),
            )
            .unwrap();
        dataset
            .push(
                "systolic",
                Column::Numeric(Array1::from_vec(vec![120.0, 90.0, 65.0])),
            )
            .unwrap();
        let rules = vec![OrderingRule {
            lower: "diastolic".into(),
            upper: "systolic".into(),
            repair: RepairSide::RaiseUpper,
        }];
        let repaired = enhancer.ensure_logical_consistency(&dataset, &rules).unwrap();
        let lower = repaired.column("diastolic").unwrap().as_numeric().unwrap();
        let upper = repaired.column("systolic").unwrap().as_numeric().unwrap();
        for (l, u) in lower.iter().zip(upper.iter()) {
            assert!(l < u, "{l} !< {u}");
        }
        // The already-consistent row is untouched.
        assert_eq!(upper[0], 120.0);
    }

    #[test]
    fn consistency_skips_unknown_columns() {
        let mut enhancer = RealismEnhancer::new(8);
        let mut dataset = Dataset::new();
        dataset
            .push("x", Column::Numeric(Array1::from_vec(vec![1.0])))
            .unwrap();
        let rules = vec![OrderingRule {
            lower: "missing".into(),
            upper: "x".into(),
            repair: RepairSide::RaiseUpper,
        }];
        let repaired = enhancer.ensure_logical_consistency(&dataset, &rules).unwrap();
        assert_eq!(repaired.n_rows(), 1);
    }
}
