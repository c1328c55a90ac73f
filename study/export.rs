//! Exporters for the build artifacts: the dataset and data dictionary
//! as tab-separated tables, the validation report as JSON.
//!
//! Missing values are written as empty cells, the convention downstream
//! spreadsheet tooling reads back as null.

use crate::dataset::{Column, Dataset};
use crate::study::build::DictionaryEntry;
use crate::validate::{ValidationResult, ValidationSummary};
use serde::Serialize;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to write table: {0}")]
    Csv(#[from] csv::Error),
    #[error("failed to write report: {0}")]
    Json(#[from] serde_json::Error),
}

/// Write the dataset as a TSV file, one column per variable.
pub fn write_dataset_tsv(dataset: &Dataset, path: &Path) -> Result<(), ExportError> {
    let mut writer = csv::WriterBuilder::new().delimiter(b'\t').from_path(path)?;
    writer.write_record(dataset.names())?;

    let n = dataset.n_rows();
    let mut record = Vec::with_capacity(dataset.n_columns());
    for row in 0..n {
        record.clear();
        for (_, column) in dataset.iter() {
            record.push(cell_text(column, row));
        }
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

fn cell_text(column: &Column, row: usize) -> String {
    match column {
        Column::Numeric(values) => {
            let value = values[row];
            if value.is_nan() {
                String::new()
            } else {
                value.to_string()
            }
        }
        Column::Integer(values) => values[row].to_string(),
        Column::Text(values) => values[row].clone(),
    }
}

/// Write the data dictionary as a TSV file.
pub fn write_dictionary_tsv(entries: &[DictionaryEntry], path: &Path) -> Result<(), ExportError> {
    let mut writer = csv::WriterBuilder::new().delimiter(b'\t').from_path(path)?;
    writer.write_record(["name", "type", "description"])?;
    for entry in entries {
        writer.write_record([&entry.name, &entry.semantic_type, &entry.description])?;
    }
    writer.flush()?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct Report<'a> {
    study: &'a str,
    summary: &'a ValidationSummary,
    results: &'a [ValidationResult],
}

/// Write the validation results and their summary as pretty JSON.
pub fn write_report_json(
    study: &str,
    summary: &ValidationSummary,
    results: &[ValidationResult],
    path: &Path,
) -> Result<(), ExportError> {
    let file = File::create(path)?;
    let writer = BufWriter::new(file);
    serde_json::to_writer_pretty(
        writer,
        &Report {
            study,
            summary,
            results,
        },
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array1;

    fn sample_dataset() -> Dataset {
        let mut dataset = Dataset::new();
        dataset
            .push(
                "subject_id",
                Column::Text(vec!["ID000001".into(), "ID000002".into()]),
            )
            .unwrap();
        dataset
            .push(
                "crp",
                Column::Numeric(Array1::from_vec(vec![3.5, f64::NAN])),
            )
            .unwrap();
        dataset
            .push("arm", Column::Integer(Array1::from_vec(vec![0, 1])))
            .unwrap();
        dataset
    }

    #[test]
    fn tsv_uses_empty_cells_for_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.tsv");
        write_dataset_tsv(&sample_dataset(), &path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "subject_id\tcrp\tarm");
        assert_eq!(lines[1], "ID000001\t3.5\t0");
        assert_eq!(lines[2], "ID000002\t\t1");
    }

    #[test]
    fn report_json_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        let results = vec![ValidationResult {
            passed: true,
            metric: "odds ratio".to_string(),
            expected: 2.0,
            actual: 2.1,
            tolerance: 0.2,
            p_value: Some(0.001),
            confidence_interval: Some((1.8, 2.4)),
            message: "OR=2.10".to_string(),
        }];
        let summary = ValidationSummary {
            total: 1,
            passed: 1,
            failed: 0,
            pass_rate: 1.0,
            all_passed: true,
        };
        write_report_json("demo", &summary, &results, &path).unwrap();
        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["study"], "demo");
        assert_eq!(value["summary"]["passed"], 1);
        assert_eq!(value["results"][0]["metric"], "odds ratio");
    }
}
