//! # Evaluation Loop
//!
//! Drives every (model, selector, repeat, fold) candidate through
//! `select -> search -> train -> concordance -> brier -> record`, in that fixed
//! order, and flushes one table per model to the configured writer.
//!
//! Per-family quirks are never keyed on names. Each model's
//! [`ModelCapabilities`] decides how labels are shaped, which estimator the
//! selector sees, which concordance routine applies, where survival curves come
//! from, and which selector families are skipped outright.

use crate::catalog::{
    self, ConcordanceRoutine, CurveSource, Estimator, FeatureSelector, FitError, ModelBuilder,
    ModelCapabilities, SelectionError, SelectionTarget, SelectorEstimator, SurvivalCurveError,
};
use crate::config::{AppConfig, ConfigError, RunSettings};
use crate::data::{self, DataError, Dataset};
use crate::metrics::{self, MetricError};
use crate::progress::RunObserver;
use crate::record::{
    CandidateStatus, CsvReportWriter, RecordError, ResultRecord, ResultTable, ResultWriter,
    StageTimings,
};
use crate::scaler::{RobustScaler, ScaleError};
use crate::search::{RandomizedSearch, SearchError};
use crate::split::{self, Split, SplitError};
use crate::types::{FeatureFrame, FrameError, SurvivalOutcome, Target};
use ndarray::Array2;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Data(#[from] DataError),
    #[error(transparent)]
    Split(#[from] SplitError),
    #[error(transparent)]
    Scale(#[from] ScaleError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Selection(#[from] SelectionError),
    #[error(transparent)]
    Search(#[from] SearchError),
    #[error(transparent)]
    Fit(#[from] FitError),
    #[error(transparent)]
    Metric(#[from] MetricError),
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error("{model} - {selector} (repeat {repeat}) failed: {source}")]
    Candidate {
        model: String,
        selector: String,
        repeat: usize,
        #[source]
        source: Box<RunError>,
    },
}

/// Loads the configured dataset, reserves the stratified holdout, evaluates the
/// full model/selector catalog on the remaining pool and writes one report per model.
pub fn run_benchmark(
    config: &AppConfig,
    settings: RunSettings,
    observer: &mut dyn RunObserver,
) -> Result<(), RunError> {
    let dataset = data::load_dataset(
        &config.dataset_path(),
        &config.event_column,
        &config.time_column,
    )?;

    let events = dataset.outcome.event().to_vec();
    let holdout =
        split::stratified_holdout(&events, settings.holdout_fraction, settings.holdout_seed)?;
    log::info!(
        "Reserved {} samples as the held-out set; {} remain for cross-validation",
        holdout.validation.len(),
        holdout.train.len()
    );
    let pool = dataset.take(&holdout.train);

    let orchestrator =
        Orchestrator::new(catalog::default_models(), catalog::default_selectors(), settings)?;
    let mut writer = CsvReportWriter::new(&config.reports_dir)?;
    orchestrator.run(&pool, &mut writer, observer)
}

pub struct Orchestrator {
    models: Vec<Box<dyn ModelBuilder>>,
    selectors: Vec<Box<dyn FeatureSelector>>,
    settings: RunSettings,
    search: RandomizedSearch,
}

/// One fold's scaled partitions.
struct FoldData {
    x_train: FeatureFrame,
    y_train: SurvivalOutcome,
    x_val: FeatureFrame,
    y_val: SurvivalOutcome,
}

impl Orchestrator {
    pub fn new(
        models: Vec<Box<dyn ModelBuilder>>,
        selectors: Vec<Box<dyn FeatureSelector>>,
        settings: RunSettings,
    ) -> Result<Self, RunError> {
        let search = RandomizedSearch::new(
            settings.n_iter,
            settings.n_splits,
            settings.search_seed,
            settings.search_workers,
        )?;
        Ok(Self {
            models,
            selectors,
            settings,
            search,
        })
    }

    /// Evaluates every candidate on `pool`. Each model's table is handed to
    /// `writer` as soon as that model is exhausted.
    pub fn run(
        &self,
        pool: &Dataset,
        writer: &mut dyn ResultWriter,
        observer: &mut dyn RunObserver,
    ) -> Result<(), RunError> {
        observer.on_run_start(self.models.len(), self.selectors.len(), pool.n_samples());

        let events = pool.outcome.event().to_vec();
        let mut partitions: Vec<Vec<Split>> = Vec::with_capacity(self.settings.n_repeats);
        for repeat in 0..self.settings.n_repeats {
            partitions.push(split::stratified_kfold(
                &events,
                self.settings.n_splits,
                repeat as u64,
            )?);
        }

        for (model_idx, builder) in self.models.iter().enumerate() {
            let model_label = format!("({}) {}", model_idx + 1, builder.name());
            let capabilities = builder.capabilities();
            let mut table = ResultTable::new(builder.name());

            for (selector_idx, selector) in self.selectors.iter().enumerate() {
                let selector_label =
                    format!("({}) {}", selector_idx + 1, selector.display_name());
                let supported = capabilities.supports(selector.family());

                for (repeat, folds) in partitions.iter().enumerate() {
                    for split in folds {
                        let record = if supported {
                            self.evaluate(
                                builder.as_ref(),
                                selector.as_ref(),
                                pool,
                                split,
                                Labels {
                                    model: &model_label,
                                    selector: &selector_label,
                                    repeat,
                                },
                            )
                            .map_err(|source| RunError::Candidate {
                                model: model_label.clone(),
                                selector: selector_label.clone(),
                                repeat,
                                source: Box::new(source),
                            })?
                        } else {
                            ResultRecord::skipped(&model_label, &selector_label, repeat)
                        };
                        observer.on_candidate_finished(&record);
                        table.push(record);
                    }
                }
            }

            writer.write_table(&table)?;
            observer.on_model_finished(builder.name(), table.len());
        }
        Ok(())
    }

    fn evaluate(
        &self,
        builder: &dyn ModelBuilder,
        selector: &dyn FeatureSelector,
        pool: &Dataset,
        split: &Split,
        labels: Labels<'_>,
    ) -> Result<ResultRecord, RunError> {
        let started = Instant::now();
        let capabilities = builder.capabilities();
        let fold = prepare_fold(pool, split)?;
        let prototype = builder.fresh_estimator();

        let (selection, select_time) = timed(|| {
            select_and_project(selector, &capabilities, prototype.as_ref(), &fold)
        });
        let (selected, x_train, x_val) = selection?;

        let x_fit = capabilities.label.encode_inputs(&x_train, &fold.y_train)?;
        let y_fit = capabilities.label.encode_target(&fold.y_train);
        let (search, search_time) = timed(|| {
            self.search
                .fit(prototype.as_ref(), &builder.search_space(), &x_fit, &y_fit)
        });
        let search = search?;
        log::debug!(
            "{} - {}: best search score {:.4}",
            labels.model,
            labels.selector,
            search.best_score
        );

        let mut model = search.best_estimator;
        let (trained, train_time) = timed(|| model.fit(&x_fit, &y_fit));
        trained?;

        let x_val_input = capabilities.label.encode_inputs(&x_val, &fold.y_val)?;
        let (concordance, concordance_time) = timed(|| {
            score_concordance(
                model.as_ref(),
                capabilities.concordance,
                &x_val_input,
                &fold,
            )
        });
        let (ci, ctd) = concordance?;

        let (brier, brier_time) = timed(|| {
            score_brier(model.as_ref(), capabilities.curves, &x_val_input, &x_val, &fold)
        });
        let brier = brier?;

        Ok(ResultRecord {
            model_name: labels.model.to_string(),
            selector_name: labels.selector.to_string(),
            repeat: labels.repeat,
            ci: finite(ci),
            ctd: finite(ctd),
            brier: brier.and_then(finite),
            timings: StageTimings {
                select_features: Some(select_time),
                search_params: Some(search_time),
                train: Some(train_time),
                concordance: Some(concordance_time),
                brier: Some(brier_time),
                total: Some(started.elapsed()),
            },
            best_params: search.best_params,
            selected_features: selected,
            status: CandidateStatus::Evaluated,
        })
    }
}

#[derive(Clone, Copy)]
struct Labels<'a> {
    model: &'a str,
    selector: &'a str,
    repeat: usize,
}

fn timed<T>(stage: impl FnOnce() -> T) -> (T, Duration) {
    let started = Instant::now();
    let value = stage();
    (value, started.elapsed())
}

fn finite(value: f64) -> Option<f64> {
    if value.is_nan() { None } else { Some(value) }
}

/// Splits `pool` by `split` and scales both partitions with parameters fitted on
/// the training partition alone.
fn prepare_fold(pool: &Dataset, split: &Split) -> Result<FoldData, RunError> {
    let train = pool.take(&split.train);
    let validation = pool.take(&split.validation);
    let scaler = RobustScaler::fit(&train.features)?;
    Ok(FoldData {
        x_train: scaler.transform(&train.features)?,
        y_train: train.outcome,
        x_val: scaler.transform(&validation.features)?,
        y_val: validation.outcome,
    })
}

fn select_features(
    selector: &dyn FeatureSelector,
    capabilities: &ModelCapabilities,
    prototype: &dyn Estimator,
    fold: &FoldData,
) -> Result<Vec<String>, SelectionError> {
    let target = match selector.family().target() {
        SelectionTarget::Outcome => Target::Outcome(fold.y_train.clone()),
        SelectionTarget::TimeOnly => Target::Time(fold.y_train.time().clone()),
        SelectionTarget::ModelLabel => capabilities.label.selection_target(&fold.y_train),
    };
    let estimator = match capabilities.selector_estimator {
        SelectorEstimator::Outer => prototype,
        SelectorEstimator::Inner => prototype.inner().unwrap_or(prototype),
    };
    selector.select(&fold.x_train, &target, estimator)
}

/// Runs the selector and restricts both partitions to its chosen columns.
fn select_and_project(
    selector: &dyn FeatureSelector,
    capabilities: &ModelCapabilities,
    prototype: &dyn Estimator,
    fold: &FoldData,
) -> Result<(Vec<String>, FeatureFrame, FeatureFrame), RunError> {
    let selected = select_features(selector, capabilities, prototype, fold)?;
    let x_train = fold.x_train.project(&selected)?;
    let x_val = fold.x_val.project(&selected)?;
    Ok((selected, x_train, x_val))
}

/// Harrell's (or the predicted-time) concordance on the validation fold, and
/// Uno's concordance with the censoring distribution taken from the training fold.
fn score_concordance(
    model: &dyn Estimator,
    routine: ConcordanceRoutine,
    x_val: &FeatureFrame,
    fold: &FoldData,
) -> Result<(f64, f64), RunError> {
    let predictions = model.predict(x_val)?;
    let scores = match routine {
        ConcordanceRoutine::RiskScore => {
            let ci = metrics::concordance_index_censored(&fold.y_val, predictions.view())?;
            let ctd =
                metrics::concordance_index_ipcw(&fold.y_train, &fold.y_val, predictions.view())?;
            (ci, ctd)
        }
        ConcordanceRoutine::PredictedTime => {
            let ci =
                metrics::concordance_index_predicted_time(&fold.y_val, predictions.view())?;
            let risk = predictions.mapv(|t| -t);
            let ctd = metrics::concordance_index_ipcw(&fold.y_train, &fold.y_val, risk.view())?;
            (ci, ctd)
        }
    };
    Ok(scores)
}

/// Approximate integrated Brier score, or `None` when survival curves cannot be
/// produced. Any other failure propagates.
fn score_brier(
    model: &dyn Estimator,
    source: CurveSource,
    x_val_input: &FeatureFrame,
    x_val: &FeatureFrame,
    fold: &FoldData,
) -> Result<Option<f64>, RunError> {
    let grid = metrics::brier_time_grid(fold.y_val.time().view())?;
    match survival_curves(model, source, x_val_input, x_val, &grid) {
        Ok(curves) => Ok(Some(metrics::approx_brier_score(&fold.y_val, &grid, &curves)?)),
        Err(SurvivalCurveError::Unsupported) => Ok(None),
        Err(err) => {
            log::warn!("Brier score unavailable: {err}");
            Ok(None)
        }
    }
}

fn survival_curves(
    model: &dyn Estimator,
    source: CurveSource,
    x_val_input: &FeatureFrame,
    x_val: &FeatureFrame,
    grid: &[f64],
) -> Result<Array2<f64>, SurvivalCurveError> {
    let curves = match source {
        CurveSource::Direct => model.predict_survival_function(x_val_input, grid)?,
        CurveSource::Inner => model
            .inner()
            .ok_or(SurvivalCurveError::Unsupported)?
            .predict_survival_function(x_val, grid)?,
        CurveSource::Unsupported => return Err(SurvivalCurveError::Unsupported),
    };
    if let Some(((sample, k), _)) = curves.indexed_iter().find(|(_, s)| !s.is_finite()) {
        return Err(SurvivalCurveError::NonFinite {
            sample,
            time: grid.get(k).copied().unwrap_or(f64::NAN),
        });
    }
    Ok(curves)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::selectors::{NoneSelector, SelectKBest};
    use crate::progress::NoopProgress;
    use crate::record::MemoryWriter;
    use crate::search::SearchSpace;
    use crate::types::ParamSet;
    use ndarray::Array1;

    #[derive(Clone, Copy)]
    enum CurveMode {
        NonFinite,
        FitFailure,
        WrongShape,
    }

    #[derive(Clone)]
    struct CurveModel {
        mode: CurveMode,
    }

    impl Estimator for CurveModel {
        fn set_params(&mut self, _params: &ParamSet) -> Result<(), FitError> {
            Ok(())
        }

        fn fit(&mut self, _x: &FeatureFrame, _y: &Target) -> Result<(), FitError> {
            Ok(())
        }

        fn predict(&self, x: &FeatureFrame) -> Result<Array1<f64>, FitError> {
            Ok(x.values().column(0).to_owned())
        }

        fn score(&self, _x: &FeatureFrame, _y: &Target) -> Result<f64, FitError> {
            Ok(0.5)
        }

        fn predict_survival_function(
            &self,
            x: &FeatureFrame,
            times: &[f64],
        ) -> Result<Array2<f64>, SurvivalCurveError> {
            match self.mode {
                CurveMode::NonFinite => Ok(Array2::from_elem((x.n_rows(), times.len()), f64::NAN)),
                CurveMode::FitFailure => Err(SurvivalCurveError::Fit(FitError::NotFitted)),
                CurveMode::WrongShape => Ok(Array2::zeros((x.n_rows() + 1, times.len()))),
            }
        }

        fn boxed_clone(&self) -> Box<dyn Estimator> {
            Box::new(self.clone())
        }
    }

    struct CurveBuilder(CurveMode);

    impl ModelBuilder for CurveBuilder {
        fn name(&self) -> &'static str {
            "Curves"
        }

        fn capabilities(&self) -> ModelCapabilities {
            ModelCapabilities::standard()
        }

        fn fresh_estimator(&self) -> Box<dyn Estimator> {
            Box::new(CurveModel { mode: self.0 })
        }

        fn search_space(&self) -> SearchSpace {
            SearchSpace::new()
        }
    }

    fn cohort() -> Dataset {
        let n = 40;
        let mut values: Array2<f64> = Array2::zeros((n, 3));
        let mut time = Array1::zeros(n);
        let mut event = Array1::from_elem(n, true);
        for i in 0..n {
            values[[i, 0]] = i as f64;
            values[[i, 1]] = ((i * 7) % 13) as f64;
            values[[i, 2]] = ((i * 5) % 11) as f64;
            time[i] = (n - i) as f64;
            event[i] = i % 3 != 0;
        }
        Dataset {
            features: FeatureFrame::new(vec!["a".into(), "b".into(), "c".into()], values)
                .unwrap(),
            outcome: SurvivalOutcome::new(event, time).unwrap(),
        }
    }

    fn settings() -> RunSettings {
        RunSettings {
            n_repeats: 1,
            n_splits: 2,
            n_iter: 1,
            search_workers: 1,
            ..RunSettings::default()
        }
    }

    fn run_with(mode: CurveMode) -> Result<MemoryWriter, RunError> {
        let orchestrator = Orchestrator::new(
            vec![Box::new(CurveBuilder(mode))],
            vec![Box::new(NoneSelector)],
            settings(),
        )?;
        let mut writer = MemoryWriter::default();
        orchestrator.run(&cohort(), &mut writer, &mut NoopProgress)?;
        Ok(writer)
    }

    #[test]
    fn unusable_curves_leave_the_brier_score_missing() {
        for mode in [CurveMode::NonFinite, CurveMode::FitFailure] {
            let writer = run_with(mode).unwrap();
            let rows = &writer.tables[0].1;
            assert_eq!(rows.len(), 2);
            for row in rows {
                assert_eq!(row.status, CandidateStatus::Evaluated);
                assert!(row.ci.is_some());
                assert!(row.brier.is_none());
                assert!(row.timings.brier.is_some());
            }
        }
    }

    #[test]
    fn misshapen_curves_abort_the_run_with_candidate_context() {
        match run_with(CurveMode::WrongShape).unwrap_err() {
            RunError::Candidate { model, source, .. } => {
                assert_eq!(model, "(1) Curves");
                assert!(matches!(
                    *source,
                    RunError::Metric(MetricError::SurvivalShape { .. })
                ));
            }
            other => panic!("expected a candidate error, got {other}"),
        }
    }

    #[test]
    fn projected_partitions_match_the_selection() {
        let pool = cohort();
        let events = pool.outcome.event().to_vec();
        let folds = split::stratified_kfold(&events, 2, 0).unwrap();
        let fold = prepare_fold(&pool, &folds[0]).unwrap();
        let prototype = CurveModel {
            mode: CurveMode::NonFinite,
        };
        let selector = SelectKBest::new("SelectKBest2", 2);
        let (selected, x_train, x_val) = select_and_project(
            &selector,
            &ModelCapabilities::standard(),
            &prototype,
            &fold,
        )
        .unwrap();
        assert_eq!(selected.len(), 2);
        assert_eq!(x_train.names(), selected.as_slice());
        assert_eq!(x_val.names(), selected.as_slice());
        assert_eq!(x_train.n_rows(), folds[0].train.len());
        assert_eq!(x_val.n_rows(), folds[0].validation.len());
    }
}
