//! # Dataset Loading
//!
//! Reads the processed survival dataset (CSV) and splits it into the feature
//! table and the outcome pair. Two columns are reserved: the event indicator
//! and the time-to-event value. Every other column is treated as a numeric
//! feature, in file order.
//!
//! Failures are assumed to be input errors, so `DataError` names the offending
//! column wherever it can.

use crate::types::{FeatureFrame, FrameError, SurvivalOutcome};
use ndarray::{Array1, Array2, ShapeBuilder};
use polars::prelude::*;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

const MINIMUM_ROWS: usize = 4;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    Polars(#[from] PolarsError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("The required column '{0}' was not found in the input file.")]
    ColumnNotFound(String),
    #[error(
        "Column '{column_name}' could not be converted to the expected type '{expected_type}'. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },
    #[error("Missing or null values were found in the column '{0}'.")]
    MissingValues(String),
    #[error("Non-finite values (NaN or Infinity) were found in the column '{0}'.")]
    NonFiniteValues(String),
    #[error("Event column '{column}' must only contain 0/1 or boolean values (found {value}).")]
    InvalidEventValue { column: String, value: f64 },
    #[error("Input file contains only {found} data rows, but at least {required} are required.")]
    InsufficientRows { found: usize, required: usize },
    #[error("Invalid dataset shape: {0}")]
    Frame(#[from] FrameError),
}

/// Features and outcomes for every sample in the input file.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub features: FeatureFrame,
    pub outcome: SurvivalOutcome,
}

impl Dataset {
    pub fn n_samples(&self) -> usize {
        self.outcome.len()
    }

    /// Subset of samples at `indices`, preserving their order.
    pub fn take(&self, indices: &[usize]) -> Self {
        Self {
            features: self.features.take_rows(indices),
            outcome: self.outcome.take(indices),
        }
    }
}

/// Loads `path` and separates the `event_column`/`time_column` outcome pair from the features.
pub fn load_dataset(
    path: &Path,
    event_column: &str,
    time_column: &str,
) -> Result<Dataset, DataError> {
    log::info!("Loading dataset from '{}'", path.display());

    let df = CsvReader::new(File::open(path)?)
        .with_options(CsvReadOptions::default().with_has_header(true))
        .finish()?;

    dataset_from_frame(&df, event_column, time_column)
}

/// Converts an already-parsed frame with the same validation rules as [`load_dataset`].
pub fn dataset_from_frame(
    df: &DataFrame,
    event_column: &str,
    time_column: &str,
) -> Result<Dataset, DataError> {
    if df.height() < MINIMUM_ROWS {
        return Err(DataError::InsufficientRows {
            found: df.height(),
            required: MINIMUM_ROWS,
        });
    }

    let columns: Vec<String> = df
        .get_column_names()
        .into_iter()
        .map(|name| name.to_string())
        .collect();
    for required in [event_column, time_column] {
        if !columns.iter().any(|c| c == required) {
            return Err(DataError::ColumnNotFound(required.to_string()));
        }
    }

    let event_values = extract_numeric_column(df, event_column)?;
    let mut event = Vec::with_capacity(event_values.len());
    for value in event_values {
        if value == 1.0 {
            event.push(true);
        } else if value == 0.0 {
            event.push(false);
        } else {
            return Err(DataError::InvalidEventValue {
                column: event_column.to_string(),
                value,
            });
        }
    }
    let time = extract_numeric_column(df, time_column)?;
    let outcome = SurvivalOutcome::new(Array1::from(event), Array1::from(time))?;

    let feature_names: Vec<String> = columns
        .into_iter()
        .filter(|c| c != event_column && c != time_column)
        .collect();
    let n_rows = df.height();
    let mut buffer = Vec::with_capacity(n_rows * feature_names.len());
    for name in &feature_names {
        let mut column = extract_numeric_column(df, name)?;
        buffer.append(&mut column);
    }
    let values = Array2::from_shape_vec((n_rows, feature_names.len()).f(), buffer)
        .map_err(|_| FrameError::ShapeMismatch {
            names: feature_names.len(),
            columns: 0,
        })?;
    let features = FeatureFrame::new(feature_names, values)?;

    log::info!(
        "Loaded {} samples ({} observed events) with {} features",
        outcome.len(),
        outcome.n_events(),
        features.n_cols()
    );

    Ok(Dataset { features, outcome })
}

fn extract_numeric_column(df: &DataFrame, column_name: &str) -> Result<Vec<f64>, DataError> {
    let series = df
        .column(column_name)
        .map_err(|_| DataError::ColumnNotFound(column_name.to_string()))?;
    if series.null_count() > 0 {
        return Err(DataError::MissingValues(column_name.to_string()));
    }

    let casted = series
        .cast(&DataType::Float64)
        .map_err(|_| DataError::ColumnWrongType {
            column_name: column_name.to_string(),
            expected_type: "f64 (numeric)",
            found_type: format!("{:?}", series.dtype()),
        })?;
    if casted.null_count() > 0 {
        return Err(DataError::ColumnWrongType {
            column_name: column_name.to_string(),
            expected_type: "f64 (numeric)",
            found_type: format!("{:?}", series.dtype()),
        });
    }

    let values: Vec<f64> = casted.f64()?.into_no_null_iter().collect();
    if values.iter().any(|v| !v.is_finite()) {
        return Err(DataError::NonFiniteValues(column_name.to_string()));
    }
    Ok(values)
}
