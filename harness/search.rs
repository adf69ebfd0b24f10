//! Randomized hyperparameter search with unshuffled inner k-fold validation.

use crate::catalog::{Estimator, FitError};
use crate::split::{self, SplitError};
use crate::types::{FeatureFrame, ParamSet, ParamValue, Target};
use itertools::Itertools;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuildError, ThreadPoolBuilder};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("randomized search needs at least one iteration")]
    NoIterations,
    #[error("parameter '{0}' has an empty or inverted domain")]
    EmptyDomain(String),
    #[error("failed to build the search worker pool: {0}")]
    ThreadPool(#[from] ThreadPoolBuildError),
    #[error("inner cross-validation could not be arranged: {0}")]
    Split(#[from] SplitError),
    #[error("all {trials} search trials failed; last error: {last}")]
    AllTrialsFailed { trials: usize, last: FitError },
    #[error("refitting the best configuration failed: {0}")]
    Refit(#[from] FitError),
}

/// Values a single hyperparameter may take.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamDomain {
    Choice(Vec<ParamValue>),
    Uniform { low: f64, high: f64 },
    LogUniform { low: f64, high: f64 },
}

impl ParamDomain {
    pub fn choice<T: Into<ParamValue>>(values: impl IntoIterator<Item = T>) -> Self {
        Self::Choice(values.into_iter().map(Into::into).collect())
    }

    fn validate(&self, name: &str) -> Result<(), SearchError> {
        let valid = match self {
            Self::Choice(values) => !values.is_empty(),
            Self::Uniform { low, high } => low <= high,
            Self::LogUniform { low, high } => *low > 0.0 && low <= high,
        };
        if valid {
            Ok(())
        } else {
            Err(SearchError::EmptyDomain(name.to_string()))
        }
    }

    fn sample(&self, rng: &mut StdRng) -> ParamValue {
        match self {
            Self::Choice(values) => values
                .choose(rng)
                .cloned()
                .unwrap_or(ParamValue::Float(f64::NAN)),
            Self::Uniform { low, high } if low == high => ParamValue::Float(*low),
            Self::Uniform { low, high } => ParamValue::Float(rng.gen_range(*low..*high)),
            Self::LogUniform { low, high } if low == high => ParamValue::Float(*low),
            Self::LogUniform { low, high } => {
                ParamValue::Float(rng.gen_range(low.ln()..high.ln()).exp())
            }
        }
    }
}

pub type SearchSpace = BTreeMap<String, ParamDomain>;

/// One evaluated configuration. `mean_score` is NaN when any fold failed to fit.
#[derive(Debug, Clone, PartialEq)]
pub struct Trial {
    pub params: ParamSet,
    pub mean_score: f64,
}

pub struct SearchOutcome {
    pub best_params: ParamSet,
    pub best_score: f64,
    /// Already refit on the full search data.
    pub best_estimator: Box<dyn Estimator>,
    pub trials: Vec<Trial>,
}

pub struct RandomizedSearch {
    n_iter: usize,
    n_splits: usize,
    seed: u64,
    pool: ThreadPool,
}

impl RandomizedSearch {
    pub fn new(n_iter: usize, n_splits: usize, seed: u64, workers: usize) -> Result<Self, SearchError> {
        if n_iter == 0 {
            return Err(SearchError::NoIterations);
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .thread_name(|idx| format!("search-worker-{idx}"))
            .build()?;
        Ok(Self {
            n_iter,
            n_splits,
            seed,
            pool,
        })
    }

    /// Configurations to try, in evaluation order.
    pub fn candidates(&self, space: &SearchSpace) -> Result<Vec<ParamSet>, SearchError> {
        for (name, domain) in space {
            domain.validate(name)?;
        }
        if space.is_empty() {
            return Ok(vec![ParamSet::new()]);
        }

        let mut rng = StdRng::seed_from_u64(self.seed);
        let finite: Option<Vec<(&String, &Vec<ParamValue>)>> = space
            .iter()
            .map(|(name, domain)| match domain {
                ParamDomain::Choice(values) => Some((name, values)),
                _ => None,
            })
            .collect();

        match finite {
            Some(lists) => {
                let grid: Vec<ParamSet> = lists
                    .iter()
                    .map(|(_, values)| values.iter())
                    .multi_cartesian_product()
                    .map(|combo| {
                        lists
                            .iter()
                            .zip(combo)
                            .map(|((name, _), value)| ((*name).clone(), value.clone()))
                            .collect()
                    })
                    .collect();
                if grid.len() <= self.n_iter {
                    return Ok(grid);
                }
                let picks = rand::seq::index::sample(&mut rng, grid.len(), self.n_iter);
                Ok(picks.into_iter().map(|idx| grid[idx].clone()).collect())
            }
            None => Ok((0..self.n_iter)
                .map(|_| {
                    space
                        .iter()
                        .map(|(name, domain)| (name.clone(), domain.sample(&mut rng)))
                        .collect()
                })
                .collect()),
        }
    }

    /// Scores every candidate configuration by inner k-fold and refits the best one on
    /// all of `x`/`y`. Ties go to the earliest candidate.
    pub fn fit(
        &self,
        prototype: &dyn Estimator,
        space: &SearchSpace,
        x: &FeatureFrame,
        y: &Target,
    ) -> Result<SearchOutcome, SearchError> {
        let candidates = self.candidates(space)?;
        let folds = split::kfold(x.n_rows(), self.n_splits)?;

        let results: Vec<Result<f64, FitError>> = self.pool.install(|| {
            candidates
                .par_iter()
                .map(|params| cross_validate(prototype, params, &folds, x, y))
                .collect()
        });

        let mut trials = Vec::with_capacity(candidates.len());
        let mut last_error = None;
        for (params, result) in candidates.into_iter().zip(results) {
            let mean_score = match result {
                Ok(score) => score,
                Err(err) => {
                    log::warn!("Search trial {params:?} failed and is scored NaN: {err}");
                    last_error = Some(err);
                    f64::NAN
                }
            };
            trials.push(Trial { params, mean_score });
        }

        let mut best: Option<usize> = None;
        for (idx, trial) in trials.iter().enumerate() {
            if trial.mean_score.is_nan() {
                continue;
            }
            match best {
                Some(current) if trials[current].mean_score >= trial.mean_score => {}
                _ => best = Some(idx),
            }
        }
        let Some(best) = best else {
            return Err(SearchError::AllTrialsFailed {
                trials: trials.len(),
                last: last_error.unwrap_or(FitError::NotFitted),
            });
        };

        let best_params = trials[best].params.clone();
        let best_score = trials[best].mean_score;
        log::debug!("Best search trial {best_params:?} with mean score {best_score:.4}");

        let mut best_estimator = prototype.boxed_clone();
        best_estimator.set_params(&best_params)?;
        best_estimator.fit(x, y)?;

        Ok(SearchOutcome {
            best_params,
            best_score,
            best_estimator,
            trials,
        })
    }
}

fn cross_validate(
    prototype: &dyn Estimator,
    params: &ParamSet,
    folds: &[split::Split],
    x: &FeatureFrame,
    y: &Target,
) -> Result<f64, FitError> {
    let mut total = 0.0;
    for fold in folds {
        let mut estimator = prototype.boxed_clone();
        estimator.set_params(params)?;
        estimator.fit(&x.take_rows(&fold.train), &y.take(&fold.train))?;
        let score = estimator.score(&x.take_rows(&fold.validation), &y.take(&fold.validation))?;
        total += score;
    }
    Ok(total / folds.len() as f64)
}
