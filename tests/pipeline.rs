//! End-to-end checks across the whole stack: engine stages chained by
//! hand, and the design-driven pipeline from TOML text to exported
//! files.

use insilico::stats;
use insilico::study::{StudyDesign, build_study, export};
use insilico::survival::{CensoringScheme, SurvivalGenerator};
use insilico::validate::StatisticalValidator;

#[test]
fn survival_scenario_hits_event_rate_and_cutoff() {
    let mut generator = SurvivalGenerator::new(42);
    let times = generator.exponential(1_000, 12.0, None).unwrap();
    let cutoff = stats::percentile(&times, 70.0);

    let sample = generator
        .censor(&times, 0.3, CensoringScheme::Administrative, None)
        .unwrap();

    let event_rate = sample.event_rate();
    assert!(
        (event_rate - 0.7).abs() <= 0.05,
        "event rate = {event_rate}"
    );
    let longest = sample
        .observed_time
        .iter()
        .copied()
        .fold(f64::MIN, f64::max);
    assert!(longest <= cutoff + 1e-9, "{longest} > {cutoff}");
    assert!(sample.observed_time.iter().all(|&t| t >= 0.0));
}

#[test]
fn generators_with_the_same_seed_are_independent_but_identical() {
    let mut first = SurvivalGenerator::new(314);
    let mut second = SurvivalGenerator::new(314);
    // Interleaved calls on two instances never share state.
    let a1 = first.exponential(100, 6.0, None).unwrap();
    let b1 = second.exponential(100, 6.0, None).unwrap();
    let a2 = first.weibull(100, 6.0, 1.5, None).unwrap();
    let b2 = second.weibull(100, 6.0, 1.5, None).unwrap();
    assert_eq!(a1, b1);
    assert_eq!(a2, b2);
}

const DESIGN_TOML: &str = r#"
name = "integration"
sample_size = 30000
seed = 42

[arm]
name = "treated"
allocation = 0.5

[[variables]]
name = "biomarker"
kind = "continuous"
distribution = { family = "normal", mean = 100.0, std = 15.0 }
cohens_d = 0.5

[[variables]]
name = "response"
kind = "binary"
probability = 0.1
odds_ratio = 2.0

[[variables]]
name = "followup_months"
kind = "time_to_event"
median_survival = 12.0
hazard_ratio = 2.0
censoring_rate = 0.0
censoring = "administrative"

[[realism]]
kind = "round"
variable = "biomarker"
precision = 0.1
"#;

#[test]
fn design_pipeline_validates_every_target() {
    let design = StudyDesign::from_toml(DESIGN_TOML).unwrap();
    let artifacts = build_study(&design).unwrap();

    assert_eq!(artifacts.validations.len(), 3);
    for result in &artifacts.validations {
        assert!(result.passed, "{result}");
    }
    assert_eq!(artifacts.dataset.n_rows(), 30_000);
}

#[test]
fn design_pipeline_round_trips_through_files() {
    let design = StudyDesign::from_toml(DESIGN_TOML).unwrap();
    let artifacts = build_study(&design).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let data_path = dir.path().join("data.tsv");
    let dict_path = dir.path().join("dictionary.tsv");
    export::write_dataset_tsv(&artifacts.dataset, &data_path).unwrap();
    export::write_dictionary_tsv(&artifacts.dictionary, &dict_path).unwrap();

    let data = std::fs::read_to_string(&data_path).unwrap();
    let mut lines = data.lines();
    let header = lines.next().unwrap();
    assert_eq!(
        header,
        "subject_id\ttreated\tbiomarker\tresponse\tfollowup_months\tfollowup_months_event"
    );
    assert_eq!(lines.count(), 30_000);

    let dictionary = std::fs::read_to_string(&dict_path).unwrap();
    assert!(dictionary.contains("time-to-event"));
    assert!(dictionary.contains("target OR 2"));
}

#[test]
fn validator_report_reads_like_a_document() {
    let design = StudyDesign::from_toml(DESIGN_TOML).unwrap();
    let artifacts = build_study(&design).unwrap();

    let mut validator = StatisticalValidator::new();
    let biomarker = artifacts
        .dataset
        .column("biomarker")
        .unwrap()
        .to_numeric()
        .unwrap();
    let arm = artifacts
        .dataset
        .column("treated")
        .unwrap()
        .to_numeric()
        .unwrap()
        .mapv(|v| (v != 0.0) as u8);
    validator
        .validate_mean_difference(&biomarker, &arm, 7.5, true)
        .unwrap();
    let report = validator.report();
    assert!(report.starts_with("# Validation report"));
    assert!(report.contains("mean difference"));
    assert!(validator.summary().all_passed);
}
