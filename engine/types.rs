//! Shared record types consumed by every stage of the generation pipeline.

use ndarray::Array1;
use serde::{Deserialize, Serialize};

/// Default relative-error band for effect validation (±20%).
pub const DEFAULT_TOLERANCE: f64 = 0.2;
/// Default significance level for effect validation.
pub const DEFAULT_ALPHA: f64 = 0.05;

/// The population-level association a dataset is shaped to exhibit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectKind {
    MeanDifference,
    OddsRatio,
    HazardRatio,
    Correlation,
}

/// A target effect, consumed by the injectors (to shape data) and by the
/// validator (to check the realized effect against the target).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EffectSpec {
    pub kind: EffectKind,
    /// Target magnitude on the effect's natural scale (d, OR, HR, r).
    pub target: f64,
    /// Whether the realized effect is expected to reach significance.
    #[serde(default = "default_expect_significant")]
    pub expect_significant: bool,
    /// Relative-error band accepted around the target.
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    /// Significance level the expectation is tested at.
    #[serde(default = "default_alpha")]
    pub alpha: f64,
}

fn default_expect_significant() -> bool {
    true
}

fn default_tolerance() -> f64 {
    DEFAULT_TOLERANCE
}

fn default_alpha() -> f64 {
    DEFAULT_ALPHA
}

impl EffectSpec {
    pub fn new(kind: EffectKind, target: f64) -> Self {
        Self {
            kind,
            target,
            expect_significant: true,
            tolerance: DEFAULT_TOLERANCE,
            alpha: DEFAULT_ALPHA,
        }
    }
}

/// Optional closed truncation interval applied after sampling.
///
/// Truncation is post-hoc clipping, not rejection sampling: probability
/// mass piles up at the cut points. That bias is accepted for simulated
/// field data, where hard physiological limits behave the same way.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

impl Bounds {
    pub const UNBOUNDED: Bounds = Bounds {
        min: None,
        max: None,
    };

    pub fn new(min: Option<f64>, max: Option<f64>) -> Self {
        Self { min, max }
    }

    pub fn is_unbounded(&self) -> bool {
        self.min.is_none() && self.max.is_none()
    }

    /// Clip every element into the interval, in place.
    pub fn clip(&self, data: &mut Array1<f64>) {
        if self.is_unbounded() {
            return;
        }
        for value in data.iter_mut() {
            if let Some(lo) = self.min
                && *value < lo
            {
                *value = lo;
            }
            if let Some(hi) = self.max
                && *value > hi
            {
                *value = hi;
            }
        }
    }
}

/// Paired observation times and event flags for a right-censored cohort.
///
/// `observed_time[i]` is `min(true_time, censoring_time)` and `event[i]`
/// is 1 when the true event was observed, 0 when the record is censored.
#[derive(Debug, Clone)]
pub struct SurvivalSample {
    pub observed_time: Array1<f64>,
    pub event: Array1<u8>,
}

impl SurvivalSample {
    pub fn len(&self) -> usize {
        self.observed_time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observed_time.is_empty()
    }

    /// Fraction of records whose event was observed rather than censored.
    pub fn event_rate(&self) -> f64 {
        if self.event.is_empty() {
            return 0.0;
        }
        let events = self.event.iter().filter(|&&flag| flag == 1).count();
        events as f64 / self.event.len() as f64
    }
}

/// Values concatenated across strata, with each observation's stratum.
#[derive(Debug, Clone)]
pub struct GroupedDraws {
    pub values: Array1<f64>,
    pub group: Array1<usize>,
}

/// Binary outcomes concatenated across strata, with each observation's
/// stratum.
#[derive(Debug, Clone)]
pub struct GroupedOutcomes {
    pub outcome: Array1<u8>,
    pub group: Array1<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds_clip_both_sides() {
        let bounds = Bounds::new(Some(0.0), Some(10.0));
        let mut data = Array1::from_vec(vec![-5.0, 3.0, 12.0]);
        bounds.clip(&mut data);
        assert_eq!(data, Array1::from_vec(vec![0.0, 3.0, 10.0]));
    }

    #[test]
    fn unbounded_clip_is_identity() {
        let mut data = Array1::from_vec(vec![-1e12, 1e12]);
        Bounds::UNBOUNDED.clip(&mut data);
        assert_eq!(data, Array1::from_vec(vec![-1e12, 1e12]));
    }

    #[test]
    fn event_rate_counts_observed_events() {
        let sample = SurvivalSample {
            observed_time: Array1::from_vec(vec![1.0, 2.0, 3.0, 4.0]),
            event: Array1::from_vec(vec![1, 0, 1, 1]),
        };
        assert_eq!(sample.len(), 4);
        assert!((sample.event_rate() - 0.75).abs() < 1e-12);
    }
}
