//! Per-candidate result records, the per-model table that accumulates them, and
//! the CSV sink that persists one table per model.

use crate::types::ParamSet;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Suffix of every per-model report file.
pub const REPORT_SUFFIX: &str = "_alarm_cv_results.csv";

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("failed to create the reports directory '{path}': {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write report '{path}': {source}")]
    Csv { path: PathBuf, source: csv::Error },
    #[error("failed to flush report '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to encode a structured field: {0}")]
    Json(#[from] serde_json::Error),
    #[error("cannot write an empty table")]
    EmptyTable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateStatus {
    Evaluated,
    /// Structurally unsupported pairing; all metrics and timings are missing.
    Skipped,
}

/// Wall-clock duration of each pipeline stage of one candidate.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StageTimings {
    pub select_features: Option<Duration>,
    pub search_params: Option<Duration>,
    pub train: Option<Duration>,
    pub concordance: Option<Duration>,
    pub brier: Option<Duration>,
    pub total: Option<Duration>,
}

/// One (model, selector, repeat, fold) outcome. Never mutated once appended.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRecord {
    pub model_name: String,
    pub selector_name: String,
    pub repeat: usize,
    pub ci: Option<f64>,
    pub ctd: Option<f64>,
    pub brier: Option<f64>,
    pub timings: StageTimings,
    pub best_params: ParamSet,
    pub selected_features: Vec<String>,
    pub status: CandidateStatus,
}

impl ResultRecord {
    pub fn skipped(model_name: &str, selector_name: &str, repeat: usize) -> Self {
        Self {
            model_name: model_name.to_string(),
            selector_name: selector_name.to_string(),
            repeat,
            ci: None,
            ctd: None,
            brier: None,
            timings: StageTimings::default(),
            best_params: ParamSet::new(),
            selected_features: Vec::new(),
            status: CandidateStatus::Skipped,
        }
    }
}

/// Append-only record table for the model currently being evaluated.
#[derive(Debug, Default)]
pub struct ResultTable {
    model_name: String,
    records: Vec<ResultRecord>,
}

impl ResultTable {
    pub fn new(model_name: &str) -> Self {
        Self {
            model_name: model_name.to_string(),
            records: Vec::new(),
        }
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn push(&mut self, record: ResultRecord) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[ResultRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Destination for finished per-model tables.
pub trait ResultWriter {
    fn write_table(&mut self, table: &ResultTable) -> Result<(), RecordError>;
}

/// Writes `<model>_alarm_cv_results.csv` under a reports directory.
#[derive(Debug, Clone)]
pub struct CsvReportWriter {
    dir: PathBuf,
}

impl CsvReportWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, RecordError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| RecordError::CreateDir {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    pub fn report_path(&self, model_name: &str) -> PathBuf {
        report_path(&self.dir, model_name)
    }
}

pub fn report_path(dir: &Path, model_name: &str) -> PathBuf {
    dir.join(format!("{model_name}{REPORT_SUFFIX}"))
}

/// Serialised row; field order is the report column order.
#[derive(Serialize)]
struct ReportRow<'a> {
    #[serde(rename = "ModelName")]
    model_name: &'a str,
    #[serde(rename = "FtSelectorName")]
    selector_name: &'a str,
    #[serde(rename = "NRepeat")]
    repeat: usize,
    #[serde(rename = "CI")]
    ci: Option<f64>,
    #[serde(rename = "CTD")]
    ctd: Option<f64>,
    #[serde(rename = "BS")]
    brier: Option<f64>,
    #[serde(rename = "TBestFeatures")]
    t_best_features: Option<f64>,
    #[serde(rename = "TBestParams")]
    t_best_params: Option<f64>,
    #[serde(rename = "TModelTrain")]
    t_model_train: Option<f64>,
    #[serde(rename = "TModelCIInference")]
    t_model_ci_inference: Option<f64>,
    #[serde(rename = "TModelBSInference")]
    t_model_bs_inference: Option<f64>,
    #[serde(rename = "TTotalSplit")]
    t_total_split: Option<f64>,
    #[serde(rename = "BestParams")]
    best_params: String,
    #[serde(rename = "SelectedFts")]
    selected_features: String,
}

fn seconds(duration: Option<Duration>) -> Option<f64> {
    duration.map(|d| d.as_secs_f64())
}

impl<'a> ReportRow<'a> {
    fn from_record(record: &'a ResultRecord) -> Result<Self, RecordError> {
        let t = &record.timings;
        Ok(Self {
            model_name: &record.model_name,
            selector_name: &record.selector_name,
            repeat: record.repeat,
            ci: record.ci,
            ctd: record.ctd,
            brier: record.brier,
            t_best_features: seconds(t.select_features),
            t_best_params: seconds(t.search_params),
            t_model_train: seconds(t.train),
            t_model_ci_inference: seconds(t.concordance),
            t_model_bs_inference: seconds(t.brier),
            t_total_split: seconds(t.total),
            best_params: serde_json::to_string(&record.best_params)?,
            selected_features: serde_json::to_string(&record.selected_features)?,
        })
    }
}

impl ResultWriter for CsvReportWriter {
    fn write_table(&mut self, table: &ResultTable) -> Result<(), RecordError> {
        if table.is_empty() {
            return Err(RecordError::EmptyTable);
        }
        let path = self.report_path(table.model_name());
        let csv_error = |source| RecordError::Csv {
            path: path.clone(),
            source,
        };
        let mut writer = csv::Writer::from_path(&path).map_err(csv_error)?;
        for record in table.records() {
            writer
                .serialize(ReportRow::from_record(record)?)
                .map_err(csv_error)?;
        }
        writer.flush().map_err(|source| RecordError::Io {
            path: path.clone(),
            source,
        })?;
        log::info!(
            "Wrote {} rows for {} to '{}'",
            table.len(),
            table.model_name(),
            path.display()
        );
        Ok(())
    }
}

/// Keeps finished tables in memory.
#[derive(Debug, Default)]
pub struct MemoryWriter {
    pub tables: Vec<(String, Vec<ResultRecord>)>,
}

impl ResultWriter for MemoryWriter {
    fn write_table(&mut self, table: &ResultTable) -> Result<(), RecordError> {
        self.tables
            .push((table.model_name().to_string(), table.records().to_vec()));
        Ok(())
    }
}
