//! Time-to-event sampling, right-censoring, and hazard-ratio injection.
//!
//! Baseline distributions are parameterized by their median survival
//! time, the quantity study protocols actually report: for the
//! exponential family `lambda = ln(2) / median`, for the Weibull family
//! `scale = median / (ln 2)^(1/shape)`.

use crate::stats;
use crate::types::SurvivalSample;
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Bernoulli, Distribution, Exp, Weibull};
use serde::{Deserialize, Serialize};
use std::f64::consts::LN_2;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SurvivalError {
    #[error("median survival must be positive and finite, got {0}")]
    NonPositiveMedian(f64),
    #[error("weibull shape must be positive and finite, got {0}")]
    NonPositiveShape(f64),
    #[error("censoring rate must lie in [0, 1], got {0}")]
    InvalidCensoringRate(f64),
    #[error("hazard ratio must be positive and finite, got {0}")]
    InvalidHazardRatio(f64),
    #[error("time and exposure arrays must have equal length, got {time} and {exposure}")]
    ExposureLengthMismatch { time: usize, exposure: usize },
    #[error("covariate matrix has {cols} columns but {len} coefficients were given")]
    CoefficientMismatch { cols: usize, len: usize },
    #[error("at least one cause-specific median is required")]
    NoCauses,
}

/// Baseline time-to-event family, dispatched exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum SurvivalFamily {
    /// Constant hazard.
    Exponential,
    /// Shape > 1 gives rising hazard, < 1 falling, = 1 exponential.
    Weibull { shape: f64 },
}

impl Default for SurvivalFamily {
    fn default() -> Self {
        SurvivalFamily::Exponential
    }
}

/// How censoring times are produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CensoringScheme {
    /// Uniform censoring times over twice the follow-up window. The
    /// realized censoring fraction is driven by the window, not by the
    /// requested rate.
    Random,
    /// A single administrative cutoff; without an explicit follow-up the
    /// cutoff is placed at the (1 - rate) quantile of the true times, so
    /// the requested rate is hit directly.
    Administrative,
    /// Per-subject coin flip between the two schemes above.
    #[default]
    Mixed,
}

/// Observed times paired with the latent cause index; `None` marks a
/// record censored at the follow-up limit.
#[derive(Debug, Clone)]
pub struct CompetingRisksSample {
    pub observed_time: Array1<f64>,
    pub cause: Vec<Option<usize>>,
}

/// Samples survival data from a privately-owned seeded stream.
#[derive(Debug)]
pub struct SurvivalGenerator {
    rng: StdRng,
}

impl SurvivalGenerator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Exponential survival times with the given median, optionally
    /// capped at `max_time`.
    pub fn exponential(
        &mut self,
        n: usize,
        median_survival: f64,
        max_time: Option<f64>,
    ) -> Result<Array1<f64>, SurvivalError> {
        let dist = exponential_from_median(median_survival)?;
        let mut times = Array1::from_iter((0..n).map(|_| dist.sample(&mut self.rng)));
        cap_times(&mut times, max_time);
        Ok(times)
    }

    /// Weibull survival times with the given median and shape,
    /// optionally capped at `max_time`.
    pub fn weibull(
        &mut self,
        n: usize,
        median_survival: f64,
        shape: f64,
        max_time: Option<f64>,
    ) -> Result<Array1<f64>, SurvivalError> {
        let dist = weibull_from_median(median_survival, shape)?;
        let mut times = Array1::from_iter((0..n).map(|_| dist.sample(&mut self.rng)));
        cap_times(&mut times, max_time);
        Ok(times)
    }

    /// Draw `n` survival times from `family` at the given median.
    pub fn sample(
        &mut self,
        n: usize,
        median_survival: f64,
        family: SurvivalFamily,
        max_time: Option<f64>,
    ) -> Result<Array1<f64>, SurvivalError> {
        match family {
            SurvivalFamily::Exponential => self.exponential(n, median_survival, max_time),
            SurvivalFamily::Weibull { shape } => self.weibull(n, median_survival, shape, max_time),
        }
    }

    /// Survival times with a target hazard ratio against a 0/1 exposure.
    /// The exposed-arm median is `baseline_median / hazard_ratio` (for
    /// the exponential family the hazard scales inversely with the
    /// median; for Weibull this holds at the median).
    pub fn with_hazard_ratio(
        &mut self,
        exposure: &Array1<u8>,
        baseline_median: f64,
        hazard_ratio: f64,
        family: SurvivalFamily,
        max_time: Option<f64>,
    ) -> Result<Array1<f64>, SurvivalError> {
        if !(hazard_ratio > 0.0) || !hazard_ratio.is_finite() {
            return Err(SurvivalError::InvalidHazardRatio(hazard_ratio));
        }
        let exposed_median = baseline_median / hazard_ratio;

        let n = exposure.len();
        let unexposed_count = exposure.iter().filter(|&&e| e != 1).count();
        let unexposed_times = self.sample(unexposed_count, baseline_median, family, max_time)?;
        let exposed_times = self.sample(n - unexposed_count, exposed_median, family, max_time)?;

        let mut times = Array1::<f64>::zeros(n);
        let mut next_unexposed = 0;
        let mut next_exposed = 0;
        for (slot, &e) in times.iter_mut().zip(exposure.iter()) {
            if e == 1 {
                *slot = exposed_times[next_exposed];
                next_exposed += 1;
            } else {
                *slot = unexposed_times[next_unexposed];
                next_unexposed += 1;
            }
        }
        Ok(times)
    }

    /// Proportional-hazards survival times over a covariate matrix:
    /// each subject's median is `baseline_median / exp(x . beta)`.
    pub fn cox(
        &mut self,
        covariates: &Array2<f64>,
        coefficients: &Array1<f64>,
        baseline_median: f64,
        family: SurvivalFamily,
        max_time: Option<f64>,
    ) -> Result<Array1<f64>, SurvivalError> {
        if covariates.ncols() != coefficients.len() {
            return Err(SurvivalError::CoefficientMismatch {
                cols: covariates.ncols(),
                len: coefficients.len(),
            });
        }
        if !(baseline_median > 0.0) || !baseline_median.is_finite() {
            return Err(SurvivalError::NonPositiveMedian(baseline_median));
        }
        let linear = covariates.dot(coefficients);
        let mut times = Array1::<f64>::zeros(covariates.nrows());
        for (slot, &eta) in times.iter_mut().zip(linear.iter()) {
            let median = baseline_median / eta.exp();
            *slot = match family {
                SurvivalFamily::Exponential => {
                    exponential_from_median(median)?.sample(&mut self.rng)
                }
                SurvivalFamily::Weibull { shape } => {
                    weibull_from_median(median, shape)?.sample(&mut self.rng)
                }
            };
        }
        cap_times(&mut times, max_time);
        Ok(times)
    }

    /// Overlay censoring on true survival times, producing observed
    /// times and event flags.
    pub fn censor(
        &mut self,
        survival_time: &Array1<f64>,
        censoring_rate: f64,
        scheme: CensoringScheme,
        max_followup: Option<f64>,
    ) -> Result<SurvivalSample, SurvivalError> {
        if !(0.0..=1.0).contains(&censoring_rate) {
            return Err(SurvivalError::InvalidCensoringRate(censoring_rate));
        }
        let n = survival_time.len();
        if n == 0 {
            return Ok(SurvivalSample {
                observed_time: Array1::zeros(0),
                event: Array1::zeros(0),
            });
        }
        let longest = survival_time.iter().copied().fold(f64::MIN, f64::max);

        let censoring_time: Array1<f64> = match scheme {
            CensoringScheme::Random => {
                let followup = max_followup.unwrap_or(longest * 1.5);
                Array1::from_iter(
                    (0..n).map(|_| self.rng.gen_range(0.0..followup.max(f64::MIN_POSITIVE) * 2.0)),
                )
            }
            CensoringScheme::Administrative => {
                let cutoff = max_followup
                    .unwrap_or_else(|| {
                        stats::percentile(survival_time, 100.0 * (1.0 - censoring_rate))
                    });
                Array1::from_elem(n, cutoff)
            }
            CensoringScheme::Mixed => {
                let followup = max_followup.unwrap_or(longest * 1.2);
                let coin = Bernoulli::new(0.5).expect("0.5 is a valid probability");
                Array1::from_iter((0..n).map(|_| {
                    if coin.sample(&mut self.rng) {
                        self.rng.gen_range(0.0..followup.max(f64::MIN_POSITIVE) * 2.0)
                    } else {
                        followup
                    }
                }))
            }
        };

        let observed_time = ndarray::Zip::from(survival_time)
            .and(&censoring_time)
            .map_collect(|&t, &c| t.min(c));
        let event = ndarray::Zip::from(survival_time)
            .and(&censoring_time)
            .map_collect(|&t, &c| (t <= c) as u8);
        Ok(SurvivalSample {
            observed_time,
            event,
        })
    }

    /// Competing-risks data: one latent exponential time per cause, the
    /// earliest wins. Records past `max_time` are censored there.
    pub fn competing_risks(
        &mut self,
        n: usize,
        cause_medians: &[f64],
        max_time: Option<f64>,
    ) -> Result<CompetingRisksSample, SurvivalError> {
        if cause_medians.is_empty() {
            return Err(SurvivalError::NoCauses);
        }
        let latent: Vec<Array1<f64>> = cause_medians
            .iter()
            .map(|&median| self.exponential(n, median, max_time))
            .collect::<Result<_, _>>()?;

        let mut observed_time = Array1::<f64>::zeros(n);
        let mut cause = Vec::with_capacity(n);
        for i in 0..n {
            let (winner, &time) = latent
                .iter()
                .map(|times| &times[i])
                .enumerate()
                .min_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
                .expect("at least one cause was checked above");
            observed_time[i] = time;
            cause.push(Some(winner));
        }
        if let Some(cutoff) = max_time {
            for i in 0..n {
                if observed_time[i] >= cutoff {
                    observed_time[i] = cutoff;
                    cause[i] = None;
                }
            }
        }
        Ok(CompetingRisksSample {
            observed_time,
            cause,
        })
    }
}

/// Rescale exposed-arm times so the hazard ratio against the unexposed
/// arm moves from its current value to `target_hr`.
///
/// The current ratio is estimated as the unexposed/exposed median ratio,
/// which equals the hazard ratio only under constant hazard; for
/// Weibull-shaped input the result is an approximation, kept as such. A
/// degenerate estimate (an empty arm or a zero exposed-arm median)
/// returns the input unchanged.
pub fn adjust_hazard_ratio(
    survival_time: &Array1<f64>,
    exposure: &Array1<u8>,
    target_hr: f64,
    current_hr: Option<f64>,
) -> Result<Array1<f64>, SurvivalError> {
    if survival_time.len() != exposure.len() {
        return Err(SurvivalError::ExposureLengthMismatch {
            time: survival_time.len(),
            exposure: exposure.len(),
        });
    }
    if !(target_hr > 0.0) || !target_hr.is_finite() {
        return Err(SurvivalError::InvalidHazardRatio(target_hr));
    }
    let current = current_hr.or_else(|| estimate_hazard_ratio(survival_time, exposure));
    let Some(current) = current else {
        return Ok(survival_time.clone());
    };
    if current == 0.0 || !current.is_finite() {
        return Ok(survival_time.clone());
    }

    // Medians scale inversely with hazard, so the exposed arm shrinks or
    // stretches by current / target.
    let factor = current / target_hr;
    let mut adjusted = survival_time.clone();
    for (value, &e) in adjusted.iter_mut().zip(exposure.iter()) {
        if e == 1 {
            *value *= factor;
        }
    }
    Ok(adjusted)
}

/// Median-ratio estimate of the hazard ratio: `median0 / median1`.
/// `None` when an arm is empty or the exposed-arm median is zero.
pub fn estimate_hazard_ratio(survival_time: &Array1<f64>, exposure: &Array1<u8>) -> Option<f64> {
    let arm0: Array1<f64> = survival_time
        .iter()
        .zip(exposure.iter())
        .filter(|(_, &e)| e == 0)
        .map(|(&t, _)| t)
        .collect();
    let arm1: Array1<f64> = survival_time
        .iter()
        .zip(exposure.iter())
        .filter(|(_, &e)| e == 1)
        .map(|(&t, _)| t)
        .collect();
    if arm0.is_empty() || arm1.is_empty() {
        return None;
    }
    let median1 = stats::median(&arm1);
    if median1 == 0.0 {
        return None;
    }
    Some(stats::median(&arm0) / median1)
}

fn exponential_from_median(median_survival: f64) -> Result<Exp<f64>, SurvivalError> {
    if !(median_survival > 0.0) || !median_survival.is_finite() {
        return Err(SurvivalError::NonPositiveMedian(median_survival));
    }
    let lambda = LN_2 / median_survival;
    Exp::new(lambda).map_err(|_| SurvivalError::NonPositiveMedian(median_survival))
}

fn weibull_from_median(median_survival: f64, shape: f64) -> Result<Weibull<f64>, SurvivalError> {
    if !(median_survival > 0.0) || !median_survival.is_finite() {
        return Err(SurvivalError::NonPositiveMedian(median_survival));
    }
    if !(shape > 0.0) || !shape.is_finite() {
        return Err(SurvivalError::NonPositiveShape(shape));
    }
    let scale = median_survival / LN_2.powf(1.0 / shape);
    Weibull::new(scale, shape).map_err(|_| SurvivalError::NonPositiveShape(shape))
}

fn cap_times(times: &mut Array1<f64>, max_time: Option<f64>) {
    if let Some(cap) = max_time {
        times.mapv_inplace(|t| t.min(cap));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn same_seed_is_bit_identical() {
        let mut first = SurvivalGenerator::new(77);
        let mut second = SurvivalGenerator::new(77);
        assert_eq!(
            first.exponential(1_000, 12.0, None).unwrap(),
            second.exponential(1_000, 12.0, None).unwrap()
        );
    }

    #[test]
    fn exponential_median_converges() {
        let mut generator = SurvivalGenerator::new(42);
        let times = generator.exponential(100_000, 12.0, None).unwrap();
        assert_relative_eq!(stats::median(&times), 12.0, epsilon = 0.3);
        assert!(times.iter().all(|&t| t >= 0.0));
    }

    #[test]
    fn weibull_median_converges() {
        let mut generator = SurvivalGenerator::new(43);
        let times = generator.weibull(100_000, 12.0, 1.8, None).unwrap();
        assert_relative_eq!(stats::median(&times), 12.0, epsilon = 0.3);
    }

    #[test]
    fn rejects_non_positive_median() {
        let mut generator = SurvivalGenerator::new(0);
        assert!(matches!(
            generator.exponential(10, 0.0, None),
            Err(SurvivalError::NonPositiveMedian(_))
        ));
        assert!(matches!(
            generator.weibull(10, -1.0, 1.0, None),
            Err(SurvivalError::NonPositiveMedian(_))
        ));
    }

    #[test]
    fn hazard_ratio_scales_exposed_median() {
        let mut generator = SurvivalGenerator::new(42);
        let exposure: Array1<u8> =
            Array1::from_iter((0..100_000).map(|i| (i % 2 == 0) as u8));
        let times = generator
            .with_hazard_ratio(&exposure, 12.0, 2.0, SurvivalFamily::Exponential, None)
            .unwrap();
        let estimate = estimate_hazard_ratio(&times, &exposure).unwrap();
        assert!((estimate - 2.0).abs() / 2.0 < 0.1, "estimate = {estimate}");
    }

    #[test]
    fn administrative_censoring_hits_target_rate() {
        let mut generator = SurvivalGenerator::new(42);
        let times = generator.exponential(1_000, 12.0, None).unwrap();
        let cutoff = stats::percentile(&times, 70.0);
        let sample = generator
            .censor(&times, 0.3, CensoringScheme::Administrative, None)
            .unwrap();
        assert!(
            (sample.event_rate() - 0.7).abs() < 0.05,
            "event rate = {}",
            sample.event_rate()
        );
        let longest = sample
            .observed_time
            .iter()
            .copied()
            .fold(f64::MIN, f64::max);
        assert!(longest <= cutoff + 1e-9, "{longest} > {cutoff}");
    }

    #[test]
    fn censoring_invariants_hold_for_all_schemes() {
        for scheme in [
            CensoringScheme::Random,
            CensoringScheme::Administrative,
            CensoringScheme::Mixed,
        ] {
            let mut generator = SurvivalGenerator::new(5);
            let times = generator.exponential(5_000, 10.0, None).unwrap();
            let sample = generator.censor(&times, 0.2, scheme, Some(24.0)).unwrap();
            assert_eq!(sample.len(), 5_000);
            for ((&observed, &truth), &flag) in sample
                .observed_time
                .iter()
                .zip(times.iter())
                .zip(sample.event.iter())
            {
                assert!(observed >= 0.0 && observed <= truth + 1e-12);
                if flag == 1 {
                    assert_relative_eq!(observed, truth, epsilon = 1e-12);
                }
            }
        }
    }

    #[test]
    fn censor_rejects_bad_rate() {
        let mut generator = SurvivalGenerator::new(6);
        let times = Array1::from_vec(vec![1.0, 2.0]);
        assert!(matches!(
            generator.censor(&times, 1.5, CensoringScheme::Random, None),
            Err(SurvivalError::InvalidCensoringRate(_))
        ));
    }

    #[test]
    fn cox_risk_ordering_holds() {
        let mut generator = SurvivalGenerator::new(42);
        // One binary covariate with log-HR ln(3): carriers die faster.
        let covariates =
            Array2::from_shape_fn((40_000, 1), |(i, _)| (i % 2 == 0) as u8 as f64);
        let times = generator
            .cox(
                &covariates,
                &Array1::from_vec(vec![3.0f64.ln()]),
                12.0,
                SurvivalFamily::Exponential,
                None,
            )
            .unwrap();
        let carrier: Array1<f64> = times
            .iter()
            .zip(covariates.column(0).iter())
            .filter(|(_, &x)| x == 1.0)
            .map(|(&t, _)| t)
            .collect();
        let noncarrier: Array1<f64> = times
            .iter()
            .zip(covariates.column(0).iter())
            .filter(|(_, &x)| x == 0.0)
            .map(|(&t, _)| t)
            .collect();
        let ratio = stats::median(&noncarrier) / stats::median(&carrier);
        assert!((ratio - 3.0).abs() / 3.0 < 0.15, "ratio = {ratio}");
    }

    #[test]
    fn competing_risks_faster_cause_dominates() {
        let mut generator = SurvivalGenerator::new(44);
        let sample = generator.competing_risks(20_000, &[5.0, 20.0], None).unwrap();
        let first_cause = sample
            .cause
            .iter()
            .filter(|c| **c == Some(0))
            .count() as f64
            / sample.cause.len() as f64;
        // Hazard 1/5 vs 1/20: cause 0 should win 80% of the time.
        assert!((first_cause - 0.8).abs() < 0.02, "share = {first_cause}");
    }

    #[test]
    fn competing_risks_censors_at_cutoff() {
        let mut generator = SurvivalGenerator::new(45);
        let sample = generator
            .competing_risks(5_000, &[5.0, 8.0], Some(6.0))
            .unwrap();
        for (time, cause) in sample.observed_time.iter().zip(sample.cause.iter()) {
            assert!(*time <= 6.0);
            if *time >= 6.0 {
                assert!(cause.is_none());
            }
        }
    }

    #[test]
    fn adjust_hazard_ratio_moves_median_ratio() {
        let mut generator = SurvivalGenerator::new(46);
        let exposure: Array1<u8> = Array1::from_iter((0..20_000).map(|i| (i % 2) as u8));
        let times = generator
            .with_hazard_ratio(&exposure, 10.0, 1.2, SurvivalFamily::Exponential, None)
            .unwrap();
        let adjusted = adjust_hazard_ratio(&times, &exposure, 2.5, None).unwrap();
        let estimate = estimate_hazard_ratio(&adjusted, &exposure).unwrap();
        assert_relative_eq!(estimate, 2.5, epsilon = 1e-9);
    }

    #[test]
    fn adjust_hazard_ratio_degenerate_is_identity() {
        let times = Array1::from_vec(vec![1.0, 2.0, 3.0]);
        // Exposed arm empty: the current ratio cannot be estimated.
        let exposure = Array1::from_vec(vec![0, 0, 0]);
        let adjusted = adjust_hazard_ratio(&times, &exposure, 2.0, None).unwrap();
        assert_eq!(adjusted, times);
    }
}
