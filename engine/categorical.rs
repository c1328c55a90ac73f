//! Categorical and count variable sampling, plus odds-ratio and
//! risk-ratio effect injection.

use crate::mvn;
use crate::stats::{self, TwoByTwo};
use crate::types::GroupedOutcomes;
use log::warn;
use ndarray::{Array1, Array2};
use rand::distributions::WeightedIndex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Bernoulli, Distribution, Gamma, Poisson};
use serde::{Deserialize, Serialize};
use statrs::distribution::{Continuous, Normal};
use thiserror::Error;

/// Convergence band for the odds-ratio hill-climb, on the log scale.
const OR_LOG_TOLERANCE: f64 = 0.1;
/// Cap applied to the exposed-arm probability under a risk ratio, so the
/// product of baseline risk and RR stays a valid probability.
const MAX_RISK_PROBABILITY: f64 = 0.999;

#[derive(Debug, Error)]
pub enum CategoricalError {
    #[error("probability must lie in [0, 1], got {0}")]
    InvalidProbability(f64),
    #[error("probability weights must be non-negative with a positive sum")]
    InvalidWeights,
    #[error("expected {expected} probabilities, got {found}")]
    WeightCountMismatch { expected: usize, found: usize },
    #[error("at least one category is required")]
    EmptyCategories,
    #[error("ordinal variables need at least one level")]
    NoLevels,
    #[error("count mean must be non-negative and finite, got {0}")]
    InvalidCountMean(f64),
    #[error("negative-binomial dispersion must exceed 1 (1 is Poisson), got {0}")]
    InvalidDispersion(f64),
    #[error("odds ratio must be positive and finite, got {0}")]
    InvalidOddsRatio(f64),
    #[error("risk ratio must be non-negative and finite, got {0}")]
    InvalidRiskRatio(f64),
    #[error("covariate matrix has {cols} columns but {len} coefficients were given")]
    CoefficientMismatch { cols: usize, len: usize },
    #[error("outcome and exposure arrays must have equal length, got {outcome} and {exposure}")]
    ExposureLengthMismatch { outcome: usize, exposure: usize },
    #[error(transparent)]
    Latent(#[from] mvn::MvnError),
}

/// Shape of the probability vector synthesized for an ordinal variable
/// when explicit probabilities are not supplied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrdinalShape {
    /// Every level equally likely.
    #[default]
    Uniform,
    /// Middle levels most likely (normal density over the level grid).
    Normal,
    /// Low levels most likely (linearly decreasing weight).
    SkewedLow,
    /// High levels most likely (linearly increasing weight).
    SkewedHigh,
}

/// Distribution of a count variable, dispatched exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum CountModel {
    Poisson,
    /// Overdispersed counts with `variance = mean * dispersion`, drawn
    /// as a gamma-Poisson mixture.
    NegativeBinomial { dispersion: f64 },
}

impl Default for CountModel {
    fn default() -> Self {
        CountModel::Poisson
    }
}

/// Samples categorical variables from a privately-owned seeded stream.
#[derive(Debug)]
pub struct CategoricalGenerator {
    rng: StdRng,
}

impl CategoricalGenerator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// `n` independent Bernoulli(probability) draws.
    pub fn binary(&mut self, n: usize, probability: f64) -> Result<Array1<u8>, CategoricalError> {
        let dist = Bernoulli::new(probability)
            .map_err(|_| CategoricalError::InvalidProbability(probability))?;
        Ok(Array1::from_iter(
            (0..n).map(|_| dist.sample(&mut self.rng) as u8),
        ))
    }

    /// `n` draws over `k` categories, returned as category indices.
    /// Weights are normalized internally; omitted weights mean uniform.
    pub fn multinomial(
        &mut self,
        n: usize,
        k: usize,
        probabilities: Option<&[f64]>,
    ) -> Result<Array1<usize>, CategoricalError> {
        if k == 0 {
            return Err(CategoricalError::EmptyCategories);
        }
        let weights: Vec<f64> = match probabilities {
            Some(weights) => {
                if weights.len() != k {
                    return Err(CategoricalError::WeightCountMismatch {
                        expected: k,
                        found: weights.len(),
                    });
                }
                weights.to_vec()
            }
            None => vec![1.0; k],
        };
        let dist = WeightedIndex::new(&weights).map_err(|_| CategoricalError::InvalidWeights)?;
        Ok(Array1::from_iter((0..n).map(|_| dist.sample(&mut self.rng))))
    }

    /// Ordered categories 1..=levels. When `probabilities` is omitted,
    /// the vector is synthesized from `shape`.
    pub fn ordinal(
        &mut self,
        n: usize,
        levels: u32,
        probabilities: Option<&[f64]>,
        shape: OrdinalShape,
    ) -> Result<Array1<u32>, CategoricalError> {
        if levels == 0 {
            return Err(CategoricalError::NoLevels);
        }
        let k = levels as usize;
        let weights: Vec<f64> = match probabilities {
            Some(weights) => {
                if weights.len() != k {
                    return Err(CategoricalError::WeightCountMismatch {
                        expected: k,
                        found: weights.len(),
                    });
                }
                weights.to_vec()
            }
            None => ordinal_weights(k, shape),
        };
        let dist = WeightedIndex::new(&weights).map_err(|_| CategoricalError::InvalidWeights)?;
        Ok(Array1::from_iter(
            (0..n).map(|_| dist.sample(&mut self.rng) as u32 + 1),
        ))
    }

    /// Count draws from `model`, clipped above by `max_count` if given.
    pub fn count(
        &mut self,
        n: usize,
        mean: f64,
        model: CountModel,
        max_count: Option<u32>,
    ) -> Result<Array1<u32>, CategoricalError> {
        if !(mean >= 0.0) || !mean.is_finite() {
            return Err(CategoricalError::InvalidCountMean(mean));
        }
        let mut data: Array1<u32> = match model {
            CountModel::Poisson => {
                if mean == 0.0 {
                    Array1::zeros(n)
                } else {
                    let dist = Poisson::new(mean)
                        .map_err(|_| CategoricalError::InvalidCountMean(mean))?;
                    Array1::from_iter((0..n).map(|_| dist.sample(&mut self.rng) as u32))
                }
            }
            CountModel::NegativeBinomial { dispersion } => {
                if !(dispersion > 1.0) || !dispersion.is_finite() {
                    return Err(CategoricalError::InvalidDispersion(dispersion));
                }
                if mean == 0.0 {
                    Array1::zeros(n)
                } else {
                    // mean + dispersion reparameterization: p = 1/dispersion,
                    // r = mean * p / (1 - p), lambda_i ~ Gamma(r, (1-p)/p).
                    let p = 1.0 / dispersion;
                    let r = mean * p / (1.0 - p);
                    let gamma = Gamma::new(r, (1.0 - p) / p)
                        .map_err(|_| CategoricalError::InvalidDispersion(dispersion))?;
                    Array1::from_iter((0..n).map(|_| {
                        let lambda = gamma.sample(&mut self.rng);
                        if lambda <= 0.0 {
                            return 0;
                        }
                        match Poisson::new(lambda) {
                            Ok(dist) => dist.sample(&mut self.rng) as u32,
                            Err(_) => 0,
                        }
                    }))
                }
            }
        };
        if let Some(cap) = max_count {
            data.mapv_inplace(|x| x.min(cap));
        }
        Ok(data)
    }

    /// Binary outcomes with a target odds ratio against a 0/1 exposure.
    /// The exposed-arm probability is solved from the baseline odds:
    /// `odds_1 = odds_0 * OR`, `p_1 = odds_1 / (1 + odds_1)`.
    pub fn binary_with_odds_ratio(
        &mut self,
        exposure: &Array1<u8>,
        baseline_probability: f64,
        odds_ratio: f64,
    ) -> Result<Array1<u8>, CategoricalError> {
        if !(0.0..1.0).contains(&baseline_probability) {
            return Err(CategoricalError::InvalidProbability(baseline_probability));
        }
        if !(odds_ratio > 0.0) || !odds_ratio.is_finite() {
            return Err(CategoricalError::InvalidOddsRatio(odds_ratio));
        }
        let baseline_odds = baseline_probability / (1.0 - baseline_probability);
        let exposed_odds = baseline_odds * odds_ratio;
        let exposed_probability = exposed_odds / (1.0 + exposed_odds);
        self.binary_by_stratum(exposure, baseline_probability, exposed_probability)
    }

    /// Binary outcomes with a target risk ratio against a 0/1 exposure:
    /// `p_1 = min(p_0 * RR, 0.999)`.
    pub fn binary_with_risk_ratio(
        &mut self,
        exposure: &Array1<u8>,
        baseline_probability: f64,
        risk_ratio: f64,
    ) -> Result<Array1<u8>, CategoricalError> {
        if !(0.0..=1.0).contains(&baseline_probability) {
            return Err(CategoricalError::InvalidProbability(baseline_probability));
        }
        if !(risk_ratio >= 0.0) || !risk_ratio.is_finite() {
            return Err(CategoricalError::InvalidRiskRatio(risk_ratio));
        }
        let exposed_probability = (baseline_probability * risk_ratio).min(MAX_RISK_PROBABILITY);
        self.binary_by_stratum(exposure, baseline_probability, exposed_probability)
    }

    fn binary_by_stratum(
        &mut self,
        exposure: &Array1<u8>,
        unexposed_probability: f64,
        exposed_probability: f64,
    ) -> Result<Array1<u8>, CategoricalError> {
        let unexposed = Bernoulli::new(unexposed_probability)
            .map_err(|_| CategoricalError::InvalidProbability(unexposed_probability))?;
        let exposed = Bernoulli::new(exposed_probability)
            .map_err(|_| CategoricalError::InvalidProbability(exposed_probability))?;
        Ok(Array1::from_iter(exposure.iter().map(|&e| {
            let dist = if e == 1 { &exposed } else { &unexposed };
            dist.sample(&mut self.rng) as u8
        })))
    }

    /// Binary outcomes from a logistic model over the covariate matrix:
    /// `P(y=1) = sigmoid(intercept + x . beta)`.
    pub fn binary_logistic(
        &mut self,
        covariates: &Array2<f64>,
        coefficients: &Array1<f64>,
        intercept: f64,
    ) -> Result<Array1<u8>, CategoricalError> {
        if covariates.ncols() != coefficients.len() {
            return Err(CategoricalError::CoefficientMismatch {
                cols: covariates.ncols(),
                len: coefficients.len(),
            });
        }
        let linear = covariates.dot(coefficients);
        Ok(Array1::from_iter(linear.iter().map(|&eta| {
            let p = 1.0 / (1.0 + (-eta.clamp(-700.0, 700.0)).exp());
            self.rng.gen_bool(p) as u8
        })))
    }

    /// A correlated pair of binary variables via a thresholded latent
    /// bivariate normal: each marginal hits its target probability and
    /// the latent correlation approximates the requested phi.
    pub fn correlated_binary(
        &mut self,
        n: usize,
        prob1: f64,
        prob2: f64,
        correlation: f64,
    ) -> Result<(Array1<u8>, Array1<u8>), CategoricalError> {
        for p in [prob1, prob2] {
            if !(0.0 < p && p < 1.0) {
                return Err(CategoricalError::InvalidProbability(p));
            }
        }
        let latent = ndarray::arr2(&[[1.0, correlation], [correlation, 1.0]]);
        let repaired = mvn::ensure_positive_semidefinite(&latent)?;
        let z = mvn::sample(&mut self.rng, n, &Array1::zeros(2), &repaired)?;

        let threshold1 = stats::normal_quantile(1.0 - prob1);
        let threshold2 = stats::normal_quantile(1.0 - prob2);
        let var1 = z.column(0).mapv(|v| (v > threshold1) as u8);
        let var2 = z.column(1).mapv(|v| (v > threshold2) as u8);
        Ok((var1, var2))
    }

    /// Per-group Bernoulli draws with exact group sizes, concatenated in
    /// group order.
    pub fn group_proportions(
        &mut self,
        n_per_group: &[usize],
        group_proportions: &[f64],
    ) -> Result<GroupedOutcomes, CategoricalError> {
        if n_per_group.len() != group_proportions.len() {
            return Err(CategoricalError::WeightCountMismatch {
                expected: n_per_group.len(),
                found: group_proportions.len(),
            });
        }
        let total: usize = n_per_group.iter().sum();
        let mut outcome = Vec::with_capacity(total);
        let mut group = Vec::with_capacity(total);
        for (index, (&size, &proportion)) in
            n_per_group.iter().zip(group_proportions.iter()).enumerate()
        {
            let draws = self.binary(size, proportion)?;
            outcome.extend(draws.iter().copied());
            group.extend(std::iter::repeat_n(index, size));
        }
        Ok(GroupedOutcomes {
            outcome: Array1::from_vec(outcome),
            group: Array1::from_vec(group),
        })
    }

    /// Nudge an existing outcome toward a target odds ratio by flipping
    /// one exposed-arm observation per iteration (0 to 1 while below the
    /// target, 1 to 0 while above), until the log odds ratio is within
    /// the convergence band or the iteration budget runs out.
    ///
    /// This is a bounded greedy heuristic, not an exact solver. When the
    /// 2x2 table degenerates (an empty cell leaves the odds ratio
    /// undefined) the best-effort array so far is returned.
    pub fn adjust_odds_ratio(
        &mut self,
        outcome: &Array1<u8>,
        exposure: &Array1<u8>,
        target_or: f64,
        max_iterations: usize,
    ) -> Result<Array1<u8>, CategoricalError> {
        if outcome.len() != exposure.len() {
            return Err(CategoricalError::ExposureLengthMismatch {
                outcome: outcome.len(),
                exposure: exposure.len(),
            });
        }
        if !(target_or > 0.0) || !target_or.is_finite() {
            return Err(CategoricalError::InvalidOddsRatio(target_or));
        }

        let mut adjusted = outcome.clone();
        let mut converged = false;
        for _ in 0..max_iterations {
            let table = TwoByTwo::from_arrays(&adjusted, exposure);
            let Some(current) = table.odds_ratio() else {
                break;
            };
            if (current.ln() - target_or.ln()).abs() < OR_LOG_TOLERANCE {
                converged = true;
                break;
            }
            let wanted: u8 = if current < target_or { 0 } else { 1 };
            let candidates: Vec<usize> = adjusted
                .iter()
                .zip(exposure.iter())
                .enumerate()
                .filter(|(_, (&y, &e))| e == 1 && y == wanted)
                .map(|(i, _)| i)
                .collect();
            if candidates.is_empty() {
                break;
            }
            let flip = candidates[self.rng.gen_range(0..candidates.len())];
            adjusted[flip] = 1 - wanted;
        }
        if !converged {
            warn!(
                "odds-ratio adjustment stopped before reaching {target_or} (best-effort result)"
            );
        }
        Ok(adjusted)
    }
}

fn ordinal_weights(levels: usize, shape: OrdinalShape) -> Vec<f64> {
    match shape {
        OrdinalShape::Uniform => vec![1.0; levels],
        OrdinalShape::Normal => {
            let normal = Normal::new(0.0, 1.0).expect("unit normal parameters are valid");
            if levels == 1 {
                return vec![1.0];
            }
            (0..levels)
                .map(|i| {
                    let x = -2.0 + 4.0 * i as f64 / (levels - 1) as f64;
                    normal.pdf(x)
                })
                .collect()
        }
        OrdinalShape::SkewedLow => (0..levels).map(|i| (levels - i) as f64).collect(),
        OrdinalShape::SkewedHigh => (0..levels).map(|i| (i + 1) as f64).collect(),
    }
}
