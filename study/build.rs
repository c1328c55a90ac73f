//! Deterministic construction of a study dataset from its design:
//! samplers, then effect injection, then realism, then validation.

use crate::categorical::{CategoricalError, CategoricalGenerator};
use crate::continuous::{
    ContinuousError, ContinuousFamily, ContinuousGenerator, adjust_effect_size,
};
use crate::dataset::{Column, Dataset, DatasetError};
use crate::realism::{self, RealismEnhancer, RealismError};
use crate::study::design::{
    RealismStep, SUBJECT_ID_COLUMN, StudyDesign, VariableModel, VariableSpec, event_column,
};
use crate::survival::{SurvivalError, SurvivalGenerator};
use crate::validate::{StatisticalValidator, ValidationError, ValidationResult};
use log::{debug, info};
use ndarray::Array1;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::Serialize;
use thiserror::Error;

// Stage-specific offsets applied to the design seed, so each generator
// owns an independent stream and inserting a variable of one kind does
// not shift the draws of another.
const ARM_STREAM: u64 = 1;
const CONTINUOUS_STREAM: u64 = 2;
const CATEGORICAL_STREAM: u64 = 3;
const SURVIVAL_STREAM: u64 = 4;
const REALISM_STREAM: u64 = 5;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Design(#[from] crate::study::design::DesignError),
    #[error(transparent)]
    Continuous(#[from] ContinuousError),
    #[error(transparent)]
    Categorical(#[from] CategoricalError),
    #[error(transparent)]
    Survival(#[from] SurvivalError),
    #[error(transparent)]
    Realism(#[from] RealismError),
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("step '{step}' needs a categorical column, but '{variable}' is not integer-valued")]
    NotCategorical { step: String, variable: String },
}

/// One row of the exported data dictionary.
#[derive(Debug, Clone, Serialize)]
pub struct DictionaryEntry {
    pub name: String,
    pub semantic_type: String,
    pub description: String,
}

impl DictionaryEntry {
    fn new(
        name: impl Into<String>,
        semantic_type: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            semantic_type: semantic_type.into(),
            description: description.into(),
        }
    }
}

/// Everything a build produces: the final table, the ordered validation
/// results, and the data dictionary.
#[derive(Debug)]
pub struct StudyArtifacts {
    pub dataset: Dataset,
    pub validations: Vec<ValidationResult>,
    pub dictionary: Vec<DictionaryEntry>,
}

/// Run the full pipeline for one design. Deterministic in the design
/// seed: the same design always produces the same artifacts.
pub fn build_study(design: &StudyDesign) -> Result<StudyArtifacts, BuildError> {
    design.validate()?;
    let n = design.sample_size;
    info!(
        "building study '{}': n={}, seed={}",
        design.name, n, design.seed
    );

    let mut continuous = ContinuousGenerator::new(design.seed.wrapping_add(CONTINUOUS_STREAM));
    let mut categorical = CategoricalGenerator::new(design.seed.wrapping_add(CATEGORICAL_STREAM));
    let mut survival = SurvivalGenerator::new(design.seed.wrapping_add(SURVIVAL_STREAM));
    let mut realism = RealismEnhancer::new(design.seed.wrapping_add(REALISM_STREAM));

    let mut dataset = Dataset::new();
    let mut dictionary = Vec::new();
    dataset.push(SUBJECT_ID_COLUMN, Column::Text(subject_ids(n)))?;
    dictionary.push(DictionaryEntry::new(
        SUBJECT_ID_COLUMN,
        "identifier",
        "sequential subject identifier",
    ));

    let arm: Option<Array1<u8>> = match &design.arm {
        Some(spec) => {
            let assignment =
                allocate_arm(n, spec.allocation, design.seed.wrapping_add(ARM_STREAM));
            dataset.push(&spec.name, Column::Integer(assignment.mapv(i64::from)))?;
            dictionary.push(DictionaryEntry::new(
                &spec.name,
                "arm",
                format!("randomized 0/1 arm, {:.0}% in arm 1", spec.allocation * 100.0),
            ));
            Some(assignment)
        }
        None => None,
    };

    for variable in &design.variables {
        generate_variable(
            variable,
            n,
            arm.as_ref(),
            &mut continuous,
            &mut categorical,
            &mut survival,
            &mut dataset,
            &mut dictionary,
        )?;
    }

    // Ordering repairs come before field noise: the raw table should be
    // internally consistent before values start going missing.
    if !design.consistency.is_empty() {
        dataset = realism.ensure_logical_consistency(&dataset, &design.consistency)?;
    }
    for step in &design.realism {
        apply_step(&mut dataset, &mut realism, step)?;
    }

    let mut validator = StatisticalValidator::new();
    if let Some(spec) = &design.arm {
        run_checks(&mut validator, design, &dataset, &spec.name)?;
    }
    let summary = validator.summary();
    info!(
        "validation: {}/{} checks passed",
        summary.passed, summary.total
    );

    Ok(StudyArtifacts {
        dataset,
        validations: validator.results().to_vec(),
        dictionary,
    })
}

#[allow(clippy::too_many_arguments)]
fn generate_variable(
    variable: &VariableSpec,
    n: usize,
    arm: Option<&Array1<u8>>,
    continuous: &mut ContinuousGenerator,
    categorical: &mut CategoricalGenerator,
    survival: &mut SurvivalGenerator,
    dataset: &mut Dataset,
    dictionary: &mut Vec<DictionaryEntry>,
) -> Result<(), BuildError> {
    match &variable.model {
        VariableModel::Continuous {
            distribution,
            bounds,
            cohens_d,
        } => {
            let mut data = continuous.sample(n, *distribution, *bounds)?;
            if let Some(target) = cohens_d {
                let arm = arm.expect("design validation requires an arm for effects");
                data = adjust_effect_size(&data, arm, *target, None)?;
                bounds.clip(&mut data);
            }
            dataset.push(&variable.name, Column::Numeric(data))?;
            dictionary.push(DictionaryEntry::new(
                &variable.name,
                "continuous",
                describe_continuous(distribution, *cohens_d),
            ));
        }
        VariableModel::Binary {
            probability,
            odds_ratio,
        } => {
            let data = match odds_ratio {
                Some(or) => {
                    let arm = arm.expect("design validation requires an arm for effects");
                    categorical.binary_with_odds_ratio(arm, *probability, *or)?
                }
                None => categorical.binary(n, *probability)?,
            };
            dataset.push(&variable.name, Column::Integer(data.mapv(i64::from)))?;
            let description = match odds_ratio {
                Some(or) => format!("binary, arm-0 rate {probability}, target OR {or}"),
                None => format!("binary, rate {probability}"),
            };
            dictionary.push(DictionaryEntry::new(&variable.name, "binary", description));
        }
        VariableModel::Ordinal {
            levels,
            shape,
            probabilities,
        } => {
            let data = categorical.ordinal(n, *levels, probabilities.as_deref(), *shape)?;
            dataset.push(
                &variable.name,
                Column::Integer(data.mapv(i64::from)),
            )?;
            dictionary.push(DictionaryEntry::new(
                &variable.name,
                "ordinal",
                format!("levels 1..={levels}, {shape:?} weights"),
            ));
        }
        VariableModel::Count {
            mean,
            distribution,
            max_count,
        } => {
            let data = categorical.count(n, *mean, *distribution, *max_count)?;
            dataset.push(
                &variable.name,
                Column::Integer(data.mapv(i64::from)),
            )?;
            dictionary.push(DictionaryEntry::new(
                &variable.name,
                "count",
                format!("{distribution:?}, mean {mean}"),
            ));
        }
        VariableModel::TimeToEvent {
            median_survival,
            distribution,
            hazard_ratio,
            censoring_rate,
            censoring,
            max_followup,
        } => {
            let times = match hazard_ratio {
                Some(hr) => {
                    let arm = arm.expect("design validation requires an arm for effects");
                    survival.with_hazard_ratio(
                        arm,
                        *median_survival,
                        *hr,
                        *distribution,
                        *max_followup,
                    )?
                }
                None => survival.sample(n, *median_survival, *distribution, *max_followup)?,
            };
            let sample = survival.censor(&times, *censoring_rate, *censoring, *max_followup)?;
            dataset.push(&variable.name, Column::Numeric(sample.observed_time))?;
            dataset.push(
                event_column(&variable.name),
                Column::Integer(sample.event.mapv(i64::from)),
            )?;
            dictionary.push(DictionaryEntry::new(
                &variable.name,
                "time-to-event",
                format!(
                    "{distribution:?}, baseline median {median_survival}, {censoring:?} censoring at rate {censoring_rate}"
                ),
            ));
            dictionary.push(DictionaryEntry::new(
                event_column(&variable.name),
                "event-flag",
                format!("1 = event observed for {}, 0 = censored", variable.name),
            ));
        }
    }
    Ok(())
}

fn apply_step(
    dataset: &mut Dataset,
    realism: &mut RealismEnhancer,
    step: &RealismStep,
) -> Result<(), BuildError> {
    match step {
        RealismStep::MissingValues {
            variable,
            rate,
            mechanism,
            related,
        } => {
            let data = numeric_column(dataset, variable);
            let related_values = related.as_ref().map(|name| numeric_column(dataset, name));
            let result =
                realism.add_missing_values(&data, *rate, *mechanism, related_values.as_ref())?;
            dataset.replace(variable, Column::Numeric(result))?;
        }
        RealismStep::MeasurementError {
            variable,
            error_sd,
            error_kind,
        } => {
            let data = numeric_column(dataset, variable);
            let result = realism.add_measurement_error(&data, *error_sd, *error_kind)?;
            dataset.replace(variable, Column::Numeric(result))?;
        }
        RealismStep::Outliers {
            variable,
            rate,
            outlier_kind,
            multiplier,
        } => {
            let data = numeric_column(dataset, variable);
            let result = realism.add_outliers(&data, *rate, *outlier_kind, *multiplier)?;
            dataset.replace(variable, Column::Numeric(result))?;
        }
        RealismStep::Misclassification { variable, rate } => {
            let data = dataset
                .column(variable)
                .and_then(Column::as_integer)
                .ok_or_else(|| BuildError::NotCategorical {
                    step: "misclassification".to_string(),
                    variable: variable.clone(),
                })?
                .clone();
            let result = realism.add_misclassification(&data, *rate, None)?;
            dataset.replace(variable, Column::Integer(result))?;
        }
        RealismStep::Round {
            variable,
            precision,
            method,
        } => {
            let data = numeric_column(dataset, variable);
            let result = realism::round_to_precision(&data, *precision, *method)?;
            dataset.replace(variable, Column::Numeric(result))?;
        }
        RealismStep::Clip { variable, min, max } => {
            let data = numeric_column(dataset, variable);
            dataset.replace(
                variable,
                Column::Numeric(realism::enforce_range(&data, *min, *max)),
            )?;
        }
        RealismStep::Dropout { rate, mechanism } => {
            let (filtered, dropped) = realism.add_dropout(dataset, *rate, *mechanism)?;
            debug!(
                "dropout removed {} of {} subjects",
                dropped.iter().filter(|&&d| d).count(),
                dropped.len()
            );
            *dataset = filtered;
        }
    }
    Ok(())
}

/// Derive and run the validation checks implied by the design: one
/// effect check per declared target, and a baseline-balance check for
/// every covariate without a target.
fn run_checks(
    validator: &mut StatisticalValidator,
    design: &StudyDesign,
    dataset: &Dataset,
    arm_name: &str,
) -> Result<(), BuildError> {
    let arm_values = numeric_column(dataset, arm_name);
    for variable in &design.variables {
        match &variable.model {
            VariableModel::Continuous {
                distribution,
                cohens_d: Some(target),
                ..
            } => {
                let data = numeric_column(dataset, &variable.name);
                let cases = complete_cases(&[&data, &arm_values]);
                let group = as_flags(&cases[1]);
                let expected_diff = target * family_std(distribution);
                validator.validate_mean_difference(&cases[0], &group, expected_diff, true)?;
            }
            VariableModel::Binary {
                odds_ratio: Some(target),
                ..
            } => {
                let data = numeric_column(dataset, &variable.name);
                let cases = complete_cases(&[&data, &arm_values]);
                validator.validate_odds_ratio(
                    &as_flags(&cases[0]),
                    &as_flags(&cases[1]),
                    *target,
                    true,
                )?;
            }
            VariableModel::TimeToEvent {
                hazard_ratio: Some(target),
                ..
            } => {
                let time = numeric_column(dataset, &variable.name);
                let event = numeric_column(dataset, &event_column(&variable.name));
                let cases = complete_cases(&[&time, &event, &arm_values]);
                validator.validate_hazard_ratio(
                    &cases[0],
                    &as_flags(&cases[1]),
                    &as_flags(&cases[2]),
                    *target,
                    true,
                )?;
            }
            VariableModel::Continuous { cohens_d: None, .. }
            | VariableModel::Binary {
                odds_ratio: None, ..
            }
            | VariableModel::Ordinal { .. }
            | VariableModel::Count { .. } => {
                let data = numeric_column(dataset, &variable.name);
                let cases = complete_cases(&[&data, &arm_values]);
                validator.validate_group_balance(
                    &cases[0],
                    &as_flags(&cases[1]),
                    design.balance_threshold,
                )?;
            }
            VariableModel::TimeToEvent {
                hazard_ratio: None, ..
            } => {}
        }
    }
    Ok(())
}

fn subject_ids(n: usize) -> Vec<String> {
    (1..=n).map(|i| format!("ID{i:06}")).collect()
}

/// Exact-size randomized allocation: round(n * allocation) subjects in
/// arm 1, order shuffled.
fn allocate_arm(n: usize, allocation: f64, seed: u64) -> Array1<u8> {
    let n_arm1 = ((n as f64 * allocation).round() as usize).min(n);
    let mut assignment: Vec<u8> = std::iter::repeat_n(0u8, n - n_arm1)
        .chain(std::iter::repeat_n(1u8, n_arm1))
        .collect();
    let mut rng = StdRng::seed_from_u64(seed);
    assignment.shuffle(&mut rng);
    Array1::from_vec(assignment)
}

/// Fetch a column as numeric values; build inserts every name the
/// checks reference, so absence is a bug, not an input error.
fn numeric_column(dataset: &Dataset, name: &str) -> Array1<f64> {
    dataset
        .column(name)
        .and_then(Column::to_numeric)
        .expect("column was inserted by this build")
}

/// Keep only rows where every listed column is finite (complete-case
/// analysis over the perturbed table).
fn complete_cases(columns: &[&Array1<f64>]) -> Vec<Array1<f64>> {
    let n = columns.first().map_or(0, |c| c.len());
    let keep: Vec<bool> = (0..n)
        .map(|i| columns.iter().all(|c| c[i].is_finite()))
        .collect();
    columns
        .iter()
        .map(|c| {
            c.iter()
                .zip(keep.iter())
                .filter(|(_, &k)| k)
                .map(|(&v, _)| v)
                .collect()
        })
        .collect()
}

fn as_flags(values: &Array1<f64>) -> Array1<u8> {
    values.mapv(|v| (v != 0.0) as u8)
}

/// The spread implied by a continuous family, used to turn a Cohen's d
/// target into an expected raw mean difference.
fn family_std(family: &ContinuousFamily) -> f64 {
    match family {
        ContinuousFamily::Normal { std, .. }
        | ContinuousFamily::LogNormal { std, .. }
        | ContinuousFamily::Skewed { std, .. } => *std,
        ContinuousFamily::Uniform { low, high } => (high - low) / 12.0_f64.sqrt(),
    }
}

fn describe_continuous(family: &ContinuousFamily, cohens_d: Option<f64>) -> String {
    let base = match family {
        ContinuousFamily::Normal { mean, std } => format!("normal(mean={mean}, sd={std})"),
        ContinuousFamily::LogNormal { mean, std } => {
            format!("lognormal(mean={mean}, sd={std}, original scale)")
        }
        ContinuousFamily::Skewed {
            mean,
            std,
            skewness,
        } => format!("skew-normal(mean={mean}, sd={std}, skewness={skewness})"),
        ContinuousFamily::Uniform { low, high } => format!("uniform({low}, {high})"),
    };
    match cohens_d {
        Some(d) => format!("{base}, target d={d} vs arm"),
        None => base,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::study::design::ArmSpec;
    use crate::types::Bounds;

    fn effect_design(n: usize) -> StudyDesign {
        StudyDesign {
            name: "effects".to_string(),
            sample_size: n,
            seed: 42,
            balance_threshold: 0.01,
            arm: Some(ArmSpec {
                name: "treated".to_string(),
                allocation: 0.5,
            }),
            variables: vec![
                VariableSpec {
                    name: "response".to_string(),
                    model: VariableModel::Continuous {
                        distribution: ContinuousFamily::Normal {
                            mean: 50.0,
                            std: 10.0,
                        },
                        bounds: Bounds::UNBOUNDED,
                        cohens_d: Some(0.5),
                    },
                },
                VariableSpec {
                    name: "remission".to_string(),
                    model: VariableModel::Binary {
                        probability: 0.1,
                        odds_ratio: Some(2.0),
                    },
                },
            ],
            consistency: Vec::new(),
            realism: Vec::new(),
        }
    }

    #[test]
    fn builds_are_deterministic() {
        let design = StudyDesign::example();
        let first = build_study(&design).unwrap();
        let second = build_study(&design).unwrap();
        assert_eq!(first.dataset.n_rows(), second.dataset.n_rows());
        let a = first.dataset.column("age").unwrap().to_numeric().unwrap();
        let b = second.dataset.column("age").unwrap().to_numeric().unwrap();
        for (x, y) in a.iter().zip(b.iter()) {
            assert!(x == y || (x.is_nan() && y.is_nan()));
        }
    }

    #[test]
    fn example_design_produces_expected_columns() {
        let design = StudyDesign::example();
        let artifacts = build_study(&design).unwrap();
        let names = artifacts.dataset.names();
        assert_eq!(names[0], SUBJECT_ID_COLUMN);
        assert!(names.iter().any(|n| n == "treatment"));
        assert!(names.iter().any(|n| n == "months_to_event"));
        assert!(names.iter().any(|n| n == "months_to_event_event"));
        // Dropout trims the cohort below the nominal size.
        assert!(artifacts.dataset.n_rows() <= design.sample_size);
        assert!(artifacts.dataset.n_rows() > design.sample_size / 2);
        assert_eq!(artifacts.dictionary.len(), artifacts.dataset.n_columns());
        assert!(!artifacts.validations.is_empty());
    }

    #[test]
    fn injected_effects_validate_at_scale() {
        let artifacts = build_study(&effect_design(40_000)).unwrap();
        assert_eq!(artifacts.validations.len(), 2);
        for result in &artifacts.validations {
            assert!(result.passed, "{result}");
        }
    }

    #[test]
    fn arm_allocation_is_exact() {
        let assignment = allocate_arm(1_001, 0.4, 9);
        let ones = assignment.iter().filter(|&&a| a == 1).count();
        assert_eq!(ones, 400);
        assert_eq!(assignment.len(), 1_001);
    }

    #[test]
    fn subject_ids_are_zero_padded_and_unique() {
        let ids = subject_ids(3);
        assert_eq!(ids, vec!["ID000001", "ID000002", "ID000003"]);
    }

    #[test]
    fn missingness_survives_into_the_final_table() {
        let mut design = effect_design(2_000);
        design.realism.push(RealismStep::MissingValues {
            variable: "response".to_string(),
            rate: 0.1,
            mechanism: crate::realism::MissingMechanism::Mcar,
            related: None,
        });
        let artifacts = build_study(&design).unwrap();
        let response = artifacts
            .dataset
            .column("response")
            .unwrap()
            .to_numeric()
            .unwrap();
        let missing = response.iter().filter(|v| v.is_nan()).count();
        assert!(missing > 100, "missing = {missing}");
    }

    #[test]
    fn dictionary_matches_columns_in_order() {
        let artifacts = build_study(&effect_design(500)).unwrap();
        let names: Vec<&str> = artifacts
            .dictionary
            .iter()
            .map(|entry| entry.name.as_str())
            .collect();
        assert_eq!(
            names,
            artifacts.dataset.names().iter().map(String::as_str).collect::<Vec<_>>()
        );
    }
}
