//! # Model and Selector Catalog
//!
//! The harness consumes survival models and feature-selection strategies only
//! through the traits in this module. Each model family declares its quirks as
//! [`ModelCapabilities`] (how labels are shaped, which concordance routine fits
//! its predictions, where survival curves come from, and which selector
//! families it cannot be paired with), so the orchestrator dispatches on those
//! declarations rather than on names.

pub mod boost;
pub mod cox;
pub mod forest;
pub mod selectors;
pub mod weibull;
pub mod xgb;

use crate::metrics::{self, MetricError};
use crate::search::SearchSpace;
use crate::types::{FeatureFrame, FrameError, ParamSet, ParamValue, SurvivalOutcome, Target};
use ndarray::{Array1, Array2};
use thiserror::Error;

/// Name of the extra input column carrying the event indicator for
/// [`LabelConvention::EventColumn`] models.
pub const EVENT_COLUMN: &str = "Observed";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum FitError {
    #[error("estimator has not been fitted")]
    NotFitted,
    #[error("estimator was fitted on {expected} features but received {found}")]
    FeatureMismatch { expected: usize, found: usize },
    #[error("{estimator} cannot be trained on a {target} target")]
    UnsupportedTarget {
        estimator: &'static str,
        target: &'static str,
    },
    #[error("unknown or invalid hyperparameter {name} = {value}")]
    InvalidParameter { name: String, value: String },
    #[error("durations must be strictly positive")]
    NonPositiveDuration,
    #[error("{0} diverged to a non-finite value")]
    Diverged(&'static str),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Metric(#[from] MetricError),
}

impl FitError {
    pub fn invalid_parameter(name: impl Into<String>, value: &ParamValue) -> Self {
        Self::InvalidParameter {
            name: name.into(),
            value: value.to_string(),
        }
    }
}

/// Failures while building per-sample survival curves. Brier scoring degrades
/// to a missing value on exactly these, and on nothing else.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SurvivalCurveError {
    #[error("the model does not produce survival curves")]
    Unsupported,
    #[error("survival curve for sample {sample} is non-finite at time {time}")]
    NonFinite { sample: usize, time: f64 },
    #[error("failed to produce a survival curve: {0}")]
    Fit(#[from] FitError),
}

/// A trainable survival model instance.
pub trait Estimator: Send + Sync {
    fn set_params(&mut self, params: &ParamSet) -> Result<(), FitError>;

    fn fit(&mut self, x: &FeatureFrame, y: &Target) -> Result<(), FitError>;

    fn predict(&self, x: &FeatureFrame) -> Result<Array1<f64>, FitError>;

    /// Higher is better. Used to rank hyperparameter trials.
    fn score(&self, x: &FeatureFrame, y: &Target) -> Result<f64, FitError>;

    /// `[n_samples, times.len()]` survival probabilities.
    fn predict_survival_function(
        &self,
        x: &FeatureFrame,
        times: &[f64],
    ) -> Result<Array2<f64>, SurvivalCurveError> {
        let _ = (x, times);
        Err(SurvivalCurveError::Unsupported)
    }

    /// Per-feature importance of the fitted model, in input column order.
    fn feature_importances(&self) -> Option<Array1<f64>> {
        None
    }

    /// The wrapped estimator, for wrappers that adapt another model's contract.
    fn inner(&self) -> Option<&dyn Estimator> {
        None
    }

    fn boxed_clone(&self) -> Box<dyn Estimator>;
}

/// How a model family expects the outcome pair to be supplied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelConvention {
    /// fit/predict take the structured (event, time) pair.
    Structured,
    /// A single scalar: `+time` when observed, `-time` when censored.
    SignedTime,
    /// The event indicator is an extra input column; the target is the time alone.
    EventColumn,
}

impl LabelConvention {
    pub fn encode_target(self, y: &SurvivalOutcome) -> Target {
        match self {
            Self::Structured => Target::Outcome(y.clone()),
            Self::SignedTime => Target::SignedTime(y.signed_time()),
            Self::EventColumn => Target::Time(y.time().clone()),
        }
    }

    pub fn encode_inputs(
        self,
        x: &FeatureFrame,
        y: &SurvivalOutcome,
    ) -> Result<FeatureFrame, FrameError> {
        match self {
            Self::Structured | Self::SignedTime => Ok(x.clone()),
            Self::EventColumn => x.with_column(EVENT_COLUMN, y.event_indicator().view()),
        }
    }

    /// Target for an estimator-driven selector. Event-column models hand their
    /// selectors the inner estimator, which takes the structured pair.
    pub fn selection_target(self, y: &SurvivalOutcome) -> Target {
        match self {
            Self::SignedTime => Target::SignedTime(y.signed_time()),
            Self::Structured | Self::EventColumn => Target::Outcome(y.clone()),
        }
    }
}

/// Which concordance routine matches the model's prediction semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcordanceRoutine {
    /// Predictions are risk scores.
    RiskScore,
    /// Predictions are survival times.
    PredictedTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurveSource {
    Direct,
    Inner,
    Unsupported,
}

/// Which estimator a selector is handed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectorEstimator {
    Outer,
    Inner,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SelectorFamily {
    Passthrough,
    Variance,
    Univariate,
    Recursive,
    RegressionMrmr,
}

/// What outcome a selector family must be given.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionTarget {
    Outcome,
    /// The continuous time only; the censoring flag is dropped.
    TimeOnly,
    /// Whatever the paired model trains on.
    ModelLabel,
}

impl SelectorFamily {
    pub fn target(self) -> SelectionTarget {
        match self {
            Self::Passthrough | Self::Variance | Self::Univariate => SelectionTarget::Outcome,
            Self::Recursive => SelectionTarget::ModelLabel,
            Self::RegressionMrmr => SelectionTarget::TimeOnly,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelCapabilities {
    pub label: LabelConvention,
    pub concordance: ConcordanceRoutine,
    pub curves: CurveSource,
    pub selector_estimator: SelectorEstimator,
    pub unsupported: &'static [SelectorFamily],
}

impl ModelCapabilities {
    /// Structured labels, risk-score predictions, direct survival curves.
    pub const fn standard() -> Self {
        Self {
            label: LabelConvention::Structured,
            concordance: ConcordanceRoutine::RiskScore,
            curves: CurveSource::Direct,
            selector_estimator: SelectorEstimator::Outer,
            unsupported: &[],
        }
    }

    pub fn supports(&self, family: SelectorFamily) -> bool {
        !self.unsupported.contains(&family)
    }
}

/// Factory for one model family.
pub trait ModelBuilder: Send + Sync {
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> ModelCapabilities;

    fn fresh_estimator(&self) -> Box<dyn Estimator>;

    fn search_space(&self) -> SearchSpace;
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SelectionError {
    #[error("{selector} requires a {expected} target but received {found}")]
    UnsupportedTarget {
        selector: &'static str,
        expected: &'static str,
        found: &'static str,
    },
    #[error("{0} needs an estimator exposing feature importances")]
    NoImportances(&'static str),
    #[error("estimator failed during feature selection: {0}")]
    Fit(#[from] FitError),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// A feature-selection strategy: fit on training data, return chosen column names.
pub trait FeatureSelector: Send + Sync {
    fn name(&self) -> &'static str;

    /// Label used in result tables.
    fn display_name(&self) -> &'static str {
        self.name()
    }

    fn family(&self) -> SelectorFamily;

    fn select(
        &self,
        x: &FeatureFrame,
        y: &Target,
        estimator: &dyn Estimator,
    ) -> Result<Vec<String>, SelectionError>;
}

/// Fails unless `x` has exactly `expected` columns.
pub(crate) fn check_width(x: &FeatureFrame, expected: usize) -> Result<(), FitError> {
    if x.n_cols() != expected {
        return Err(FitError::FeatureMismatch {
            expected,
            found: x.n_cols(),
        });
    }
    Ok(())
}

/// Harrell's concordance of risk-score predictions, recovering the outcome from `y`.
pub(crate) fn risk_concordance(
    estimator: &'static str,
    predictions: &Array1<f64>,
    y: &Target,
) -> Result<f64, FitError> {
    let outcome = y.to_outcome().ok_or(FitError::UnsupportedTarget {
        estimator,
        target: y.kind(),
    })?;
    Ok(metrics::concordance_index_censored(&outcome, predictions.view())?)
}

/// Every model family shipped with the harness, in reporting order.
pub fn default_models() -> Vec<Box<dyn ModelBuilder>> {
    vec![
        Box::new(cox::Cph),
        Box::new(cox::CphRidge),
        Box::new(cox::CphLasso),
        Box::new(cox::CphElastic),
        Box::new(forest::Rsf),
        Box::new(boost::CoxBoost),
        Box::new(xgb::XgbLinear),
        Box::new(xgb::XgbTree),
        Box::new(xgb::XgbDart),
        Box::new(weibull::WeibullAft),
    ]
}

/// Every selector shipped with the harness, in reporting order.
pub fn default_selectors() -> Vec<Box<dyn FeatureSelector>> {
    use selectors::*;
    vec![
        Box::new(NoneSelector),
        Box::new(LowVar::default()),
        Box::new(SelectKBest::new("SelectKBest10", 10)),
        Box::new(SelectKBest::new("SelectKBest20", 20)),
        Box::new(Rfe::new("RFE10", 10)),
        Box::new(Rfe::new("RFE20", 20)),
        Box::new(RegMrmr::new("RegMRMR10", 10)),
        Box::new(RegMrmr::new("RegMRMR20", 20)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn label_conventions_reshape_the_outcome() {
        let y = SurvivalOutcome::new(array![true, false], array![12.0, 12.0]).unwrap();
        assert_eq!(
            LabelConvention::SignedTime.encode_target(&y),
            Target::SignedTime(array![12.0, -12.0])
        );
        assert_eq!(
            LabelConvention::EventColumn.encode_target(&y),
            Target::Time(array![12.0, 12.0])
        );

        let x = FeatureFrame::new(vec!["a".into()], array![[0.1], [0.2]]).unwrap();
        let augmented = LabelConvention::EventColumn.encode_inputs(&x, &y).unwrap();
        assert_eq!(augmented.column(EVENT_COLUMN).unwrap(), array![1.0, 0.0]);
        assert_eq!(LabelConvention::Structured.encode_inputs(&x, &y).unwrap(), x);
    }

    #[test]
    fn weibull_declares_its_incompatible_selectors() {
        let caps = weibull::WeibullAft.capabilities();
        for family in [
            SelectorFamily::Passthrough,
            SelectorFamily::Variance,
            SelectorFamily::Recursive,
        ] {
            assert!(!caps.supports(family));
        }
        assert!(caps.supports(SelectorFamily::Univariate));
        assert!(caps.supports(SelectorFamily::RegressionMrmr));
    }

    #[test]
    fn catalog_names_are_unique() {
        let models = default_models();
        let mut names: Vec<_> = models.iter().map(|m| m.name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), models.len());
        assert_eq!(models.len(), 10);
        assert_eq!(models[4].name(), "RSF");

        let selectors = default_selectors();
        assert_eq!(selectors.len(), 8);
        assert_eq!(selectors[0].display_name(), "None");
    }
}
