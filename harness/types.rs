//! Shared tabular containers: named feature matrices, right-censored outcomes,
//! model targets in their various encodings, and hyperparameter values.

use ndarray::{Array1, Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use thiserror::Error;

/// Errors raised while building or reshaping a [`FeatureFrame`] or [`SurvivalOutcome`].
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FrameError {
    #[error("frame has {names} column names but {columns} value columns")]
    ShapeMismatch { names: usize, columns: usize },
    #[error("column '{0}' appears more than once")]
    DuplicateColumn(String),
    #[error("column '{0}' is not present in the frame")]
    UnknownColumn(String),
    #[error("expected {expected} rows but found {found}")]
    RowCountMismatch { expected: usize, found: usize },
    #[error("time values must be finite and non-negative (row {row} has {value})")]
    InvalidTime { row: usize, value: f64 },
}

/// A feature matrix whose columns carry names. Rows are samples.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureFrame {
    names: Vec<String>,
    values: Array2<f64>,
}

impl FeatureFrame {
    pub fn new(names: Vec<String>, values: Array2<f64>) -> Result<Self, FrameError> {
        if names.len() != values.ncols() {
            return Err(FrameError::ShapeMismatch {
                names: names.len(),
                columns: values.ncols(),
            });
        }
        let mut seen = HashSet::with_capacity(names.len());
        for name in &names {
            if !seen.insert(name.as_str()) {
                return Err(FrameError::DuplicateColumn(name.clone()));
            }
        }
        Ok(Self { names, values })
    }

    #[inline]
    pub fn names(&self) -> &[String] {
        &self.names
    }

    #[inline]
    pub fn values(&self) -> &Array2<f64> {
        &self.values
    }

    #[inline]
    pub fn n_rows(&self) -> usize {
        self.values.nrows()
    }

    #[inline]
    pub fn n_cols(&self) -> usize {
        self.values.ncols()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub fn column(&self, name: &str) -> Option<ArrayView1<'_, f64>> {
        self.column_index(name).map(|idx| self.values.column(idx))
    }

    /// Rows at `indices`, in the given order.
    pub fn take_rows(&self, indices: &[usize]) -> Self {
        Self {
            names: self.names.clone(),
            values: self.values.select(Axis(0), indices),
        }
    }

    /// Projects onto `columns`, in the order given. An empty list yields a zero-width frame.
    pub fn project(&self, columns: &[String]) -> Result<Self, FrameError> {
        let mut indices = Vec::with_capacity(columns.len());
        for name in columns {
            let idx = self
                .column_index(name)
                .ok_or_else(|| FrameError::UnknownColumn(name.clone()))?;
            indices.push(idx);
        }
        Self::new(columns.to_vec(), self.values.select(Axis(1), &indices))
    }

    /// Appends a column at the right edge.
    pub fn with_column(&self, name: &str, column: ArrayView1<'_, f64>) -> Result<Self, FrameError> {
        if column.len() != self.n_rows() {
            return Err(FrameError::RowCountMismatch {
                expected: self.n_rows(),
                found: column.len(),
            });
        }
        let mut values = Array2::zeros((self.n_rows(), self.n_cols() + 1));
        values
            .slice_mut(ndarray::s![.., ..self.n_cols()])
            .assign(&self.values);
        values.column_mut(self.n_cols()).assign(&column);
        let mut names = self.names.clone();
        names.push(name.to_string());
        Self::new(names, values)
    }

    pub fn without_column(&self, name: &str) -> Result<Self, FrameError> {
        let drop = self
            .column_index(name)
            .ok_or_else(|| FrameError::UnknownColumn(name.to_string()))?;
        let keep: Vec<String> = self
            .names
            .iter()
            .enumerate()
            .filter(|(idx, _)| *idx != drop)
            .map(|(_, n)| n.clone())
            .collect();
        self.project(&keep)
    }
}

/// Right-censored outcome pair: event indicator and time-to-event per sample.
#[derive(Debug, Clone, PartialEq)]
pub struct SurvivalOutcome {
    event: Array1<bool>,
    time: Array1<f64>,
}

impl SurvivalOutcome {
    pub fn new(event: Array1<bool>, time: Array1<f64>) -> Result<Self, FrameError> {
        if event.len() != time.len() {
            return Err(FrameError::RowCountMismatch {
                expected: event.len(),
                found: time.len(),
            });
        }
        if let Some((row, &value)) = time
            .iter()
            .enumerate()
            .find(|(_, t)| !t.is_finite() || **t < 0.0)
        {
            return Err(FrameError::InvalidTime { row, value });
        }
        Ok(Self { event, time })
    }

    /// Decodes the signed-time label (`+t` observed, `-t` censored).
    pub fn from_signed_time(labels: ArrayView1<'_, f64>) -> Result<Self, FrameError> {
        let event = labels.mapv(|v| v > 0.0);
        let time = labels.mapv(f64::abs);
        Self::new(event, time)
    }

    #[inline]
    pub fn event(&self) -> &Array1<bool> {
        &self.event
    }

    #[inline]
    pub fn time(&self) -> &Array1<f64> {
        &self.time
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.time.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    pub fn n_events(&self) -> usize {
        self.event.iter().filter(|&&e| e).count()
    }

    pub fn take(&self, indices: &[usize]) -> Self {
        Self {
            event: self.event.select(Axis(0), indices),
            time: self.time.select(Axis(0), indices),
        }
    }

    /// Event indicator as 1.0 (observed) / 0.0 (censored).
    pub fn event_indicator(&self) -> Array1<f64> {
        self.event.mapv(|e| if e { 1.0 } else { 0.0 })
    }

    pub fn signed_time(&self) -> Array1<f64> {
        ndarray::Zip::from(&self.event)
            .and(&self.time)
            .map_collect(|&e, &t| encode_signed_time(e, t))
    }
}

/// `+time` when observed, `-time` when censored.
#[inline]
pub fn encode_signed_time(event: bool, time: f64) -> f64 {
    if event { time } else { -time }
}

/// The label handed to an estimator or selector, shaped by the consumer's convention.
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    /// Structured (event, time) pair.
    Outcome(SurvivalOutcome),
    /// Single signed scalar per sample.
    SignedTime(Array1<f64>),
    /// Continuous time only; the censoring flag is dropped or carried elsewhere.
    Time(Array1<f64>),
}

impl Target {
    pub fn len(&self) -> usize {
        match self {
            Self::Outcome(outcome) => outcome.len(),
            Self::SignedTime(values) | Self::Time(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn take(&self, indices: &[usize]) -> Self {
        match self {
            Self::Outcome(outcome) => Self::Outcome(outcome.take(indices)),
            Self::SignedTime(values) => Self::SignedTime(values.select(Axis(0), indices)),
            Self::Time(values) => Self::Time(values.select(Axis(0), indices)),
        }
    }

    /// Recovers the structured pair when the encoding still carries the censoring flag.
    pub fn to_outcome(&self) -> Option<SurvivalOutcome> {
        match self {
            Self::Outcome(outcome) => Some(outcome.clone()),
            Self::SignedTime(values) => SurvivalOutcome::from_signed_time(values.view()).ok(),
            Self::Time(_) => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Outcome(_) => "structured outcome",
            Self::SignedTime(_) => "signed time",
            Self::Time(_) => "continuous time",
        }
    }
}

/// A single hyperparameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl ParamValue {
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Self::Int(v) => Some(v as f64),
            Self::Float(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_usize(&self) -> Option<usize> {
        match *self {
            Self::Int(v) if v >= 0 => Some(v as usize),
            Self::Float(v) if v >= 0.0 && v.fract() == 0.0 => Some(v as usize),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(v) => f.write_str(v),
        }
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

/// Hyperparameter assignment, keyed by name. Ordered so serialisation is stable.
pub type ParamSet = BTreeMap<String, ParamValue>;

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn frame() -> FeatureFrame {
        FeatureFrame::new(
            vec!["a".into(), "b".into(), "c".into()],
            array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]],
        )
        .unwrap()
    }

    #[test]
    fn signed_time_encodes_censoring_in_the_sign() {
        assert_eq!(encode_signed_time(true, 12.0), 12.0);
        assert_eq!(encode_signed_time(false, 12.0), -12.0);

        let outcome = SurvivalOutcome::new(array![true, false], array![12.0, 12.0]).unwrap();
        assert_eq!(outcome.signed_time(), array![12.0, -12.0]);

        let decoded = SurvivalOutcome::from_signed_time(array![12.0, -12.0].view()).unwrap();
        assert_eq!(decoded, outcome);
    }

    #[test]
    fn projection_follows_requested_order() {
        let projected = frame().project(&["c".to_string(), "a".to_string()]).unwrap();
        assert_eq!(projected.names(), &["c".to_string(), "a".to_string()]);
        assert_eq!(projected.values(), &array![[3.0, 1.0], [6.0, 4.0]]);
    }

    #[test]
    fn empty_projection_keeps_rows() {
        let projected = frame().project(&[]).unwrap();
        assert_eq!(projected.n_rows(), 2);
        assert_eq!(projected.n_cols(), 0);
    }

    #[test]
    fn unknown_column_is_rejected() {
        let err = frame().project(&["z".to_string()]).unwrap_err();
        assert_eq!(err, FrameError::UnknownColumn("z".to_string()));
    }

    #[test]
    fn extra_column_round_trips() {
        let with = frame().with_column("Observed", array![1.0, 0.0].view()).unwrap();
        assert_eq!(with.n_cols(), 4);
        assert_eq!(with.column("Observed").unwrap(), array![1.0, 0.0]);
        assert_eq!(with.without_column("Observed").unwrap(), frame());
    }

    #[test]
    fn negative_times_are_rejected() {
        let err = SurvivalOutcome::new(array![true, false], array![1.0, -2.0]).unwrap_err();
        assert!(matches!(err, FrameError::InvalidTime { row: 1, .. }));
    }

    #[test]
    fn time_target_cannot_recover_outcome() {
        let target = Target::Time(array![1.0, 2.0]);
        assert!(target.to_outcome().is_none());
        assert_eq!(target.take(&[1]).len(), 1);
    }
}
