//! The TOML-facing study design document.
//!
//! A design names every variable of the cohort, its distributional
//! family with typed parameters, the effect targeted against the arm
//! assignment, the realism steps to overlay, and the ordering rules the
//! final table must satisfy. Parsing and structural validation fail
//! fast; everything downstream can then assume a well-formed design.

use crate::categorical::{CountModel, OrdinalShape};
use crate::continuous::ContinuousFamily;
use crate::realism::{
    DropoutMechanism, MeasurementErrorKind, MissingMechanism, OrderingRule, OutlierKind,
    RoundingMethod,
};
use crate::survival::{CensoringScheme, SurvivalFamily};
use crate::types::Bounds;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DesignError {
    #[error("failed to read design file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse design TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("sample size must be positive")]
    EmptyCohort,
    #[error("arm allocation must lie strictly between 0 and 1, got {0}")]
    InvalidAllocation(f64),
    #[error("column name '{0}' is used more than once")]
    DuplicateName(String),
    #[error("variable '{variable}' targets an effect but the design has no arm")]
    EffectWithoutArm { variable: String },
    #[error("step references unknown variable '{0}'")]
    UnknownVariable(String),
    #[error("missing-at-random on '{variable}' needs a related variable")]
    MarWithoutRelated { variable: String },
}

/// Two-arm assignment: `allocation` is the fraction assigned to arm 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArmSpec {
    pub name: String,
    #[serde(default = "default_allocation")]
    pub allocation: f64,
}

fn default_allocation() -> f64 {
    0.5
}

/// One variable of the cohort, tagged by semantic type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableSpec {
    pub name: String,
    #[serde(flatten)]
    pub model: VariableModel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VariableModel {
    Continuous {
        distribution: ContinuousFamily,
        #[serde(default)]
        bounds: Bounds,
        /// Standardized mean difference (arm 1 minus arm 0) to inject.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cohens_d: Option<f64>,
    },
    Binary {
        /// Positive rate; with `odds_ratio` set this is the arm-0 rate.
        probability: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        odds_ratio: Option<f64>,
    },
    Ordinal {
        levels: u32,
        #[serde(default)]
        shape: OrdinalShape,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        probabilities: Option<Vec<f64>>,
    },
    Count {
        mean: f64,
        #[serde(default)]
        distribution: CountModel,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_count: Option<u32>,
    },
    /// Emits two columns: the observed time under this variable's name
    /// and an event flag under `<name>_event`.
    TimeToEvent {
        median_survival: f64,
        #[serde(default)]
        distribution: SurvivalFamily,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hazard_ratio: Option<f64>,
        #[serde(default = "default_censoring_rate")]
        censoring_rate: f64,
        #[serde(default)]
        censoring: CensoringScheme,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_followup: Option<f64>,
    },
}

fn default_censoring_rate() -> f64 {
    0.2
}

/// One perturbation applied to the generated table, in listed order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RealismStep {
    MissingValues {
        variable: String,
        rate: f64,
        #[serde(default)]
        mechanism: MissingMechanism,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        related: Option<String>,
    },
    MeasurementError {
        variable: String,
        error_sd: f64,
        #[serde(default)]
        error_kind: MeasurementErrorKind,
    },
    Outliers {
        variable: String,
        rate: f64,
        #[serde(default)]
        outlier_kind: OutlierKind,
        #[serde(default = "default_outlier_multiplier")]
        multiplier: f64,
    },
    Misclassification {
        variable: String,
        rate: f64,
    },
    Round {
        variable: String,
        precision: f64,
        #[serde(default)]
        method: RoundingMethod,
    },
    Clip {
        variable: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<f64>,
    },
    Dropout {
        rate: f64,
        #[serde(default)]
        mechanism: DropoutMechanism,
    },
}

fn default_outlier_multiplier() -> f64 {
    3.0
}

/// The complete description of one synthetic study.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudyDesign {
    pub name: String,
    pub sample_size: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// p-threshold for the automatic baseline-balance checks; kept
    /// strict so a dedicated random stream rarely trips a false alarm.
    #[serde(default = "default_balance_threshold")]
    pub balance_threshold: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arm: Option<ArmSpec>,
    #[serde(default)]
    pub variables: Vec<VariableSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub consistency: Vec<OrderingRule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub realism: Vec<RealismStep>,
}

fn default_seed() -> u64 {
    42
}

fn default_balance_threshold() -> f64 {
    0.01
}

impl StudyDesign {
    /// Read and validate a design from a TOML file.
    pub fn from_path(path: &Path) -> Result<Self, DesignError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    /// Parse and validate a design from TOML text.
    pub fn from_toml(text: &str) -> Result<Self, DesignError> {
        let design: StudyDesign = toml::from_str(text)?;
        design.validate()?;
        Ok(design)
    }

    /// Structural checks that make the build stage infallible with
    /// respect to names and references.
    pub fn validate(&self) -> Result<(), DesignError> {
        if self.sample_size == 0 {
            return Err(DesignError::EmptyCohort);
        }
        if let Some(arm) = &self.arm
            && !(arm.allocation > 0.0 && arm.allocation < 1.0)
        {
            return Err(DesignError::InvalidAllocation(arm.allocation));
        }

        let mut names: HashSet<String> = HashSet::new();
        names.insert(SUBJECT_ID_COLUMN.to_string());
        if let Some(arm) = &self.arm
            && !names.insert(arm.name.clone())
        {
            return Err(DesignError::DuplicateName(arm.name.clone()));
        }
        for variable in &self.variables {
            if !names.insert(variable.name.clone()) {
                return Err(DesignError::DuplicateName(variable.name.clone()));
            }
            if variable.targets_effect() && self.arm.is_none() {
                return Err(DesignError::EffectWithoutArm {
                    variable: variable.name.clone(),
                });
            }
        }
        // Event flags claim their column names too.
        for variable in &self.variables {
            if matches!(variable.model, VariableModel::TimeToEvent { .. }) {
                let event_name = event_column(&variable.name);
                if !names.insert(event_name.clone()) {
                    return Err(DesignError::DuplicateName(event_name));
                }
            }
        }

        for step in &self.realism {
            if let Some(variable) = step.variable()
                && !names.contains(variable)
            {
                return Err(DesignError::UnknownVariable(variable.to_string()));
            }
            if let RealismStep::MissingValues {
                variable,
                mechanism: MissingMechanism::Mar,
                related,
                ..
            } = step
            {
                match related {
                    None => {
                        return Err(DesignError::MarWithoutRelated {
                            variable: variable.clone(),
                        });
                    }
                    Some(related) if !names.contains(related.as_str()) => {
                        return Err(DesignError::UnknownVariable(related.clone()));
                    }
                    Some(_) => {}
                }
            }
        }
        Ok(())
    }

    /// A representative design, used by the CLI `template` subcommand.
    pub fn example() -> Self {
        StudyDesign {
            name: "anticoagulant-pilot".to_string(),
            sample_size: 1200,
            seed: 42,
            balance_threshold: default_balance_threshold(),
            arm: Some(ArmSpec {
                name: "treatment".to_string(),
                allocation: 0.5,
            }),
            variables: vec![
                VariableSpec {
                    name: "age".to_string(),
                    model: VariableModel::Continuous {
                        distribution: ContinuousFamily::Normal {
                            mean: 64.0,
                            std: 9.0,
                        },
                        bounds: Bounds::new(Some(18.0), Some(95.0)),
                        cohens_d: None,
                    },
                },
                VariableSpec {
                    name: "crp".to_string(),
                    model: VariableModel::Continuous {
                        distribution: ContinuousFamily::LogNormal {
                            mean: 8.0,
                            std: 6.0,
                        },
                        bounds: Bounds::new(Some(0.1), None),
                        cohens_d: Some(-0.4),
                    },
                },
                VariableSpec {
                    name: "prior_bleed".to_string(),
                    model: VariableModel::Binary {
                        probability: 0.12,
                        odds_ratio: None,
                    },
                },
                VariableSpec {
                    name: "rebleed".to_string(),
                    model: VariableModel::Binary {
                        probability: 0.18,
                        odds_ratio: Some(0.55),
                    },
                },
                VariableSpec {
                    name: "pain_score".to_string(),
                    model: VariableModel::Ordinal {
                        levels: 5,
                        shape: OrdinalShape::SkewedLow,
                        probabilities: None,
                    },
                },
                VariableSpec {
                    name: "admissions".to_string(),
                    model: VariableModel::Count {
                        mean: 1.4,
                        distribution: CountModel::NegativeBinomial { dispersion: 2.5 },
                        max_count: Some(12),
                    },
                },
                VariableSpec {
                    name: "months_to_event".to_string(),
                    model: VariableModel::TimeToEvent {
                        median_survival: 18.0,
                        distribution: SurvivalFamily::Exponential,
                        hazard_ratio: Some(0.6),
                        censoring_rate: 0.3,
                        censoring: CensoringScheme::Administrative,
                        max_followup: None,
                    },
                },
            ],
            consistency: Vec::new(),
            realism: vec![
                RealismStep::MeasurementError {
                    variable: "crp".to_string(),
                    error_sd: 0.05,
                    error_kind: MeasurementErrorKind::Multiplicative,
                },
                RealismStep::Round {
                    variable: "age".to_string(),
                    precision: 1.0,
                    method: RoundingMethod::Round,
                },
                RealismStep::MissingValues {
                    variable: "crp".to_string(),
                    rate: 0.04,
                    mechanism: MissingMechanism::Mar,
                    related: Some("age".to_string()),
                },
                RealismStep::Dropout {
                    rate: 0.05,
                    mechanism: DropoutMechanism::Random,
                },
            ],
        }
    }
}

impl VariableSpec {
    /// Whether this variable declares a target effect against the arm.
    pub fn targets_effect(&self) -> bool {
        match &self.model {
            VariableModel::Continuous { cohens_d, .. } => cohens_d.is_some(),
            VariableModel::Binary { odds_ratio, .. } => odds_ratio.is_some(),
            VariableModel::TimeToEvent { hazard_ratio, .. } => hazard_ratio.is_some(),
            VariableModel::Ordinal { .. } | VariableModel::Count { .. } => false,
        }
    }
}

impl RealismStep {
    /// The dataset column this step touches, if it targets one.
    pub fn variable(&self) -> Option<&str> {
        match self {
            RealismStep::MissingValues { variable, .. }
            | RealismStep::MeasurementError { variable, .. }
            | RealismStep::Outliers { variable, .. }
            | RealismStep::Misclassification { variable, .. }
            | RealismStep::Round { variable, .. }
            | RealismStep::Clip { variable, .. } => Some(variable),
            RealismStep::Dropout { .. } => None,
        }
    }
}

pub const SUBJECT_ID_COLUMN: &str = "subject_id";

/// Name of the event-flag column emitted next to a time-to-event column.
pub fn event_column(variable: &str) -> String {
    format!("{variable}_event")
}
