//! Continuous variable sampling and mean-difference effect injection.
//!
//! Every generator owns a private seeded stream: two generators built
//! with the same seed produce bit-identical output for the same call
//! sequence, and no two generators share state.

use crate::mvn::{self, MvnError};
use crate::stats;
use crate::types::{Bounds, GroupedDraws};
use ndarray::{Array1, Array2};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, LogNormal, Normal, SkewNormal, Uniform};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Scale applied to the caller-facing skewness before it parameterizes
/// the skew-normal shape, so that skewness near 1 reads as "strongly
/// skewed" rather than "barely asymmetric".
const SKEWNESS_SHAPE_SCALE: f64 = 5.0;

#[derive(Debug, Error)]
pub enum ContinuousError {
    #[error("standard deviation must be non-negative and finite, got {0}")]
    InvalidStd(f64),
    #[error("lognormal parameters require a positive mean on the original scale, got {0}")]
    NonPositiveMean(f64),
    #[error("skewness must be finite, got {0}")]
    InvalidSkewness(f64),
    #[error("uniform bounds must satisfy low < high, got [{low}, {high}]")]
    InvalidUniformBounds { low: f64, high: f64 },
    #[error("group sizes and group means must align, got {sizes} sizes and {means} means")]
    GroupSpecMismatch { sizes: usize, means: usize },
    #[error("data and group arrays must have equal length, got {data} and {group}")]
    GroupLengthMismatch { data: usize, group: usize },
    #[error(transparent)]
    Multivariate(#[from] MvnError),
}

/// Parametric family of a continuous variable, dispatched exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum ContinuousFamily {
    Normal { mean: f64, std: f64 },
    /// Mean and std are given on the original (not log) scale.
    LogNormal { mean: f64, std: f64 },
    /// Skew-normal re-standardized to the exact sample mean and std.
    Skewed { mean: f64, std: f64, skewness: f64 },
    Uniform { low: f64, high: f64 },
}

/// Mean and standard deviation of one marginal of a correlated draw.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Marginal {
    pub mean: f64,
    pub std: f64,
}

/// Samples continuous variables from a privately-owned seeded stream.
#[derive(Debug)]
pub struct ContinuousGenerator {
    rng: StdRng,
}

impl ContinuousGenerator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// `n` draws from N(mean, std^2), clipped elementwise into `bounds`.
    pub fn normal(
        &mut self,
        n: usize,
        mean: f64,
        std: f64,
        bounds: Bounds,
    ) -> Result<Array1<f64>, ContinuousError> {
        let dist = Normal::new(mean, std).map_err(|_| ContinuousError::InvalidStd(std))?;
        let mut data = Array1::from_iter((0..n).map(|_| dist.sample(&mut self.rng)));
        bounds.clip(&mut data);
        Ok(data)
    }

    /// Lognormal draws whose arithmetic mean and std target the given
    /// original-scale values. Solves `mu = ln(mean^2 / sqrt(std^2 + mean^2))`
    /// and `sigma = sqrt(ln(1 + std^2 / mean^2))` before exponentiating.
    pub fn lognormal(
        &mut self,
        n: usize,
        mean: f64,
        std: f64,
        bounds: Bounds,
    ) -> Result<Array1<f64>, ContinuousError> {
        if !(mean > 0.0) {
            return Err(ContinuousError::NonPositiveMean(mean));
        }
        if !(std >= 0.0) || !std.is_finite() {
            return Err(ContinuousError::InvalidStd(std));
        }
        let variance = std * std;
        let mu = (mean * mean / (variance + mean * mean).sqrt()).ln();
        let sigma = (1.0 + variance / (mean * mean)).ln().sqrt();
        let dist = LogNormal::new(mu, sigma).map_err(|_| ContinuousError::InvalidStd(std))?;
        let mut data = Array1::from_iter((0..n).map(|_| dist.sample(&mut self.rng)));
        bounds.clip(&mut data);
        Ok(data)
    }

    /// Skew-normal draws re-standardized so the *sample* mean and std
    /// equal the requested values exactly, then clipped. Positive
    /// skewness gives a right tail, negative a left tail.
    pub fn skewed(
        &mut self,
        n: usize,
        mean: f64,
        std: f64,
        skewness: f64,
        bounds: Bounds,
    ) -> Result<Array1<f64>, ContinuousError> {
        if !(std >= 0.0) || !std.is_finite() {
            return Err(ContinuousError::InvalidStd(std));
        }
        let shape = skewness * SKEWNESS_SHAPE_SCALE;
        let dist = SkewNormal::new(0.0, 1.0, shape)
            .map_err(|_| ContinuousError::InvalidSkewness(skewness))?;
        let mut data = Array1::from_iter((0..n).map(|_| dist.sample(&mut self.rng)));

        let sample_mean = stats::mean(&data);
        let sample_std = stats::std_dev(&data, 0);
        if sample_std > 0.0 && sample_std.is_finite() {
            data.mapv_inplace(|x| (x - sample_mean) / sample_std * std + mean);
        } else {
            data.fill(mean);
        }
        bounds.clip(&mut data);
        Ok(data)
    }

    /// Direct draw from U(low, high).
    pub fn uniform(
        &mut self,
        n: usize,
        low: f64,
        high: f64,
    ) -> Result<Array1<f64>, ContinuousError> {
        if !(low < high) {
            return Err(ContinuousError::InvalidUniformBounds { low, high });
        }
        let dist = Uniform::new(low, high);
        Ok(Array1::from_iter((0..n).map(|_| dist.sample(&mut self.rng))))
    }

    /// Draw `n` observations from `family`, clipped into `bounds` where
    /// the family is unbounded (uniform carries its own range).
    pub fn sample(
        &mut self,
        n: usize,
        family: ContinuousFamily,
        bounds: Bounds,
    ) -> Result<Array1<f64>, ContinuousError> {
        match family {
            ContinuousFamily::Normal { mean, std } => self.normal(n, mean, std, bounds),
            ContinuousFamily::LogNormal { mean, std } => self.lognormal(n, mean, std, bounds),
            ContinuousFamily::Skewed {
                mean,
                std,
                skewness,
            } => self.skewed(n, mean, std, skewness, bounds),
            ContinuousFamily::Uniform { low, high } => self.uniform(n, low, high),
        }
    }

    /// A correlated pair of normal marginals. The latent correlation
    /// matrix is repaired to the nearest-by-shift PSD matrix first.
    pub fn correlated_pair(
        &mut self,
        n: usize,
        first: Marginal,
        second: Marginal,
        correlation: f64,
    ) -> Result<(Array1<f64>, Array1<f64>), ContinuousError> {
        let latent = ndarray::arr2(&[[1.0, correlation], [correlation, 1.0]]);
        let repaired = mvn::ensure_positive_semidefinite(&latent)?;
        let z = mvn::sample(
            &mut self.rng,
            n,
            &Array1::zeros(2),
            &repaired,
        )?;
        let var1 = z.column(0).mapv(|v| v * first.std + first.mean);
        let var2 = z.column(1).mapv(|v| v * second.std + second.mean);
        Ok((var1, var2))
    }

    /// Draw an `n x p` matrix from a multivariate normal with the given
    /// per-variable means/stds and correlation structure.
    pub fn multivariate(
        &mut self,
        n: usize,
        means: &Array1<f64>,
        stds: &Array1<f64>,
        correlation: &Array2<f64>,
    ) -> Result<Array2<f64>, ContinuousError> {
        let covariance = mvn::covariance_from_correlation(stds, correlation)?;
        let repaired = mvn::ensure_positive_semidefinite(&covariance)?;
        Ok(mvn::sample(&mut self.rng, n, means, &repaired)?)
    }

    /// Per-group normal draws with exact group sizes (not probabilistic
    /// allocation), concatenated in group order.
    pub fn group_means(
        &mut self,
        n_per_group: &[usize],
        group_means: &[f64],
        common_std: f64,
        bounds: Bounds,
    ) -> Result<GroupedDraws, ContinuousError> {
        if n_per_group.len() != group_means.len() {
            return Err(ContinuousError::GroupSpecMismatch {
                sizes: n_per_group.len(),
                means: group_means.len(),
            });
        }
        let total: usize = n_per_group.iter().sum();
        let mut values = Vec::with_capacity(total);
        let mut group = Vec::with_capacity(total);
        for (index, (&size, &mean)) in n_per_group.iter().zip(group_means.iter()).enumerate() {
            let draws = self.normal(size, mean, common_std, Bounds::UNBOUNDED)?;
            values.extend(draws.iter().copied());
            group.extend(std::iter::repeat_n(index, size));
        }
        let mut values = Array1::from_vec(values);
        bounds.clip(&mut values);
        Ok(GroupedDraws {
            values,
            group: Array1::from_vec(group),
        })
    }
}

/// Rescale the arm-1 mean shift so the standardized effect size moves
/// from its current value to `target_d`, leaving arm 0 untouched.
///
/// The current effect is computed when not supplied. A degenerate
/// current effect (zero, or undefined because an arm is too small or has
/// no spread) returns the input unchanged rather than erroring, so batch
/// pipelines keep running.
pub fn adjust_effect_size(
    data: &Array1<f64>,
    group: &Array1<u8>,
    target_d: f64,
    current_d: Option<f64>,
) -> Result<Array1<f64>, ContinuousError> {
    if data.len() != group.len() {
        return Err(ContinuousError::GroupLengthMismatch {
            data: data.len(),
            group: group.len(),
        });
    }
    let current = current_d.unwrap_or_else(|| stats::cohens_d(data, group));
    if current == 0.0 || !current.is_finite() {
        return Ok(data.clone());
    }
    let factor = target_d / current;

    let mean0 = masked_mean(data, group, 0);
    let mean1 = masked_mean(data, group, 1);
    let mean_diff = mean1 - mean0;
    let shift = mean_diff * factor - mean_diff;

    let mut adjusted = data.clone();
    for (value, &g) in adjusted.iter_mut().zip(group.iter()) {
        if g == 1 {
            *value += shift;
        }
    }
    Ok(adjusted)
}

fn masked_mean(data: &Array1<f64>, group: &Array1<u8>, which: u8) -> f64 {
    let mut sum = 0.0;
    let mut count = 0usize;
    for (&x, &g) in data.iter().zip(group.iter()) {
        if g == which {
            sum += x;
            count += 1;
        }
    }
    sum / count as f64
}
