//! # Result Artifacts
//!
//! The positional result collections of a batch are persisted as TOML files of
//! `[[slot]]` tables, one per response index. A failed index keeps its slot
//! with `index`, `response` and `error`, but no payload, so positions survive a
//! round trip. Resampled metrics of every configuration go to a tab-separated
//! table.
//!
//! All files are first written to temporaries in the output directory and only
//! renamed into place once every file has been written.

use crate::batch::BatchResults;
use crate::model::FittedModel;
use crate::workflow::{FittedWorkflow, LastFit};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("Failed to read or write artifact file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML artifact file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize results to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Failed to write tuning metrics table: {0}")]
    CsvError(#[from] csv::Error),
    #[error("Slot {position} of '{path}' has index {found}; slots must be numbered 1, 2, ...")]
    SlotOutOfOrder {
        path: PathBuf,
        position: usize,
        found: usize,
    },
}

/// One response index of a persisted result collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Slot<T> {
    pub index: usize,
    pub response: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default = "Option::default", skip_serializing_if = "Option::is_none")]
    pub value: Option<T>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SlotFile<T> {
    #[serde(default = "Vec::new")]
    slot: Vec<Slot<T>>,
}

/// One row of the tuning metrics table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuningRow {
    pub index: usize,
    pub response: String,
    pub config_id: String,
    pub metric: String,
    pub mean: f64,
    pub n: usize,
    pub std_err: f64,
    pub selected: bool,
}

/// Where a run's artifacts were written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub fitted_models: PathBuf,
    pub final_workflows: PathBuf,
    pub fit_results: PathBuf,
    pub tuning_metrics: PathBuf,
}

impl ArtifactPaths {
    pub fn new(dir: &Path, prefix: &str) -> Self {
        Self {
            fitted_models: dir.join(format!("{prefix}_fitted_models.toml")),
            final_workflows: dir.join(format!("{prefix}_final_workflows.toml")),
            fit_results: dir.join(format!("{prefix}_fit_results.toml")),
            tuning_metrics: dir.join(format!("{prefix}_tuning_metrics.tsv")),
        }
    }

    fn all(&self) -> [&Path; 4] {
        [
            &self.fitted_models,
            &self.final_workflows,
            &self.fit_results,
            &self.tuning_metrics,
        ]
    }
}

fn slots<T: Clone>(results: &BatchResults, collection: &[Option<T>]) -> SlotFile<T> {
    let slot = results
        .responses
        .iter()
        .zip(collection)
        .enumerate()
        .map(|(i, (response, value))| {
            let index = i + 1;
            let error = results
                .failures
                .iter()
                .find(|f| f.index == index)
                .map(|f| f.message.clone());
            Slot {
                index,
                response: response.clone(),
                error,
                value: value.clone(),
            }
        })
        .collect();
    SlotFile { slot }
}

fn tuning_rows(results: &BatchResults) -> Vec<TuningRow> {
    let mut rows = Vec::new();
    for (i, (response, tuning)) in results.responses.iter().zip(&results.tuning).enumerate() {
        let Some(tuning) = tuning else { continue };
        for summary in &tuning.metrics {
            rows.push(TuningRow {
                index: i + 1,
                response: response.clone(),
                config_id: summary.config_id.clone(),
                metric: summary.metric.to_string(),
                mean: summary.mean,
                n: summary.n,
                std_err: summary.std_err,
                selected: summary.config_id == tuning.selected.id,
            });
        }
    }
    rows
}

fn tuning_table(rows: &[TuningRow]) -> Result<Vec<u8>, ArtifactError> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_writer(Vec::new());
    for row in rows {
        writer.serialize(row)?;
    }
    writer
        .into_inner()
        .map_err(|e| ArtifactError::IoError(e.into_error()))
}

fn temporary(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Serializes every collection of `results` into `dir`.
///
/// Nothing is renamed into place unless all four files were written; on
/// failure the temporaries are removed and earlier artifacts are untouched.
pub fn write_all(results: &BatchResults, dir: &Path, prefix: &str) -> Result<ArtifactPaths, ArtifactError> {
    let paths = ArtifactPaths::new(dir, prefix);
    let contents = [
        toml::to_string_pretty(&slots(results, &results.models))?.into_bytes(),
        toml::to_string_pretty(&slots(results, &results.workflows))?.into_bytes(),
        toml::to_string_pretty(&slots(results, &results.fits))?.into_bytes(),
        tuning_table(&tuning_rows(results))?,
    ];

    fs::create_dir_all(dir)?;
    let temporaries: Vec<PathBuf> = paths.all().iter().map(|p| temporary(p)).collect();
    let written: Result<(), std::io::Error> = temporaries
        .iter()
        .zip(&contents)
        .try_for_each(|(path, bytes)| {
            let mut file = fs::File::create(path)?;
            file.write_all(bytes)?;
            file.sync_all()
        });
    if let Err(e) = written {
        for path in &temporaries {
            let _ = fs::remove_file(path);
        }
        return Err(e.into());
    }

    for (tmp, path) in temporaries.iter().zip(paths.all()) {
        fs::rename(tmp, path)?;
    }
    log::info!(
        "Wrote {} result slots to {}",
        results.len(),
        dir.display()
    );
    Ok(paths)
}

fn load_slots<T: DeserializeOwned>(path: &Path) -> Result<Vec<Slot<T>>, ArtifactError> {
    let text = fs::read_to_string(path)?;
    let file: SlotFile<T> = toml::from_str(&text)?;
    for (position, slot) in file.slot.iter().enumerate() {
        if slot.index != position + 1 {
            return Err(ArtifactError::SlotOutOfOrder {
                path: path.to_path_buf(),
                position: position + 1,
                found: slot.index,
            });
        }
    }
    Ok(file.slot)
}

pub fn load_fitted_models(path: &Path) -> Result<Vec<Slot<FittedModel>>, ArtifactError> {
    load_slots(path)
}

pub fn load_final_workflows(path: &Path) -> Result<Vec<Slot<FittedWorkflow>>, ArtifactError> {
    load_slots(path)
}

pub fn load_fit_results(path: &Path) -> Result<Vec<Slot<LastFit>>, ArtifactError> {
    load_slots(path)
}

pub fn load_tuning_metrics(path: &Path) -> Result<Vec<TuningRow>, ArtifactError> {
    let mut reader = csv::ReaderBuilder::new().delimiter(b'\t').from_path(path)?;
    let rows = reader.deserialize().collect::<Result<Vec<TuningRow>, csv::Error>>()?;
    Ok(rows)
}
