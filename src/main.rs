//! Command-line orchestrator: parse a study design, run the generation
//! pipeline, export the artifacts, and exit non-zero when the realized
//! effects miss their targets so batch callers notice.

use clap::{Parser, Subcommand};
use insilico::study::export;
use insilico::study::{StudyDesign, build_study};
use insilico::validate::{ValidationResult, ValidationSummary};
use log::info;
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[clap(
    name = "insilico",
    version,
    about = "Synthesize effect-size-targeted study datasets."
)]
struct Cli {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate a dataset from a study design and export it.
    Generate {
        /// Path to the study design TOML.
        #[clap(long)]
        design: PathBuf,

        /// Output TSV path for the dataset.
        #[clap(long)]
        out: PathBuf,

        /// Optional JSON validation report path.
        #[clap(long)]
        report: Option<PathBuf>,

        /// Optional TSV data-dictionary path.
        #[clap(long)]
        dictionary: Option<PathBuf>,
    },
    /// Write a starter design to the given path.
    Template {
        /// Where to write the example design TOML.
        #[clap(long)]
        out: PathBuf,
    },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    if let Err(message) = run(cli.command) {
        eprintln!("Error: {message}");
        process::exit(1);
    }
}

fn run(command: Command) -> Result<(), String> {
    match command {
        Command::Generate {
            design,
            out,
            report,
            dictionary,
        } => {
            let design = StudyDesign::from_path(&design).map_err(|e| e.to_string())?;
            let artifacts = build_study(&design).map_err(|e| e.to_string())?;
            info!(
                "study '{}': {} subjects, {} columns",
                design.name,
                artifacts.dataset.n_rows(),
                artifacts.dataset.n_columns()
            );

            export::write_dataset_tsv(&artifacts.dataset, &out).map_err(|e| e.to_string())?;
            eprintln!("> Wrote dataset to {}", out.display());

            let summary = summarize(&artifacts.validations);
            for result in &artifacts.validations {
                eprintln!("> {result}");
            }

            if let Some(path) = report {
                export::write_report_json(&design.name, &summary, &artifacts.validations, &path)
                    .map_err(|e| e.to_string())?;
                eprintln!("> Wrote validation report to {}", path.display());
            }
            if let Some(path) = dictionary {
                export::write_dictionary_tsv(&artifacts.dictionary, &path)
                    .map_err(|e| e.to_string())?;
                eprintln!("> Wrote data dictionary to {}", path.display());
            }

            if summary.all_passed {
                eprintln!(
                    "> All {} validation checks passed.",
                    summary.total
                );
                Ok(())
            } else {
                Err(format!(
                    "{} of {} validation checks failed",
                    summary.failed, summary.total
                ))
            }
        }
        Command::Template { out } => {
            let text = toml::to_string_pretty(&StudyDesign::example())
                .map_err(|e| e.to_string())?;
            std::fs::write(&out, text).map_err(|e| e.to_string())?;
            eprintln!("> Wrote starter design to {}", out.display());
            Ok(())
        }
    }
}

fn summarize(results: &[ValidationResult]) -> ValidationSummary {
    let total = results.len();
    let passed = results.iter().filter(|r| r.passed).count();
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
