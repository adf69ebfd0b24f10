//! Component-wise likelihood boosting of the Cox model.
//!
//! Every round updates the single coefficient whose penalised score test is
//! largest, by a damped Newton step.

use super::cox::{BreslowBaseline, RiskSets, check_rows, outcome_from, shifted_weights};
use super::{
    Estimator, FitError, ModelBuilder, ModelCapabilities, SurvivalCurveError, check_width,
    risk_concordance,
};
use crate::search::{ParamDomain, SearchSpace};
use crate::types::{FeatureFrame, ParamSet, Target};
use ndarray::{Array1, Array2};

#[derive(Debug, Clone, PartialEq)]
struct FittedBoost {
    coef: Array1<f64>,
    baseline: BreslowBaseline,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComponentwiseCoxBoost {
    n_estimators: usize,
    learning_rate: f64,
    /// Ridge penalty on each step's information.
    step_penalty: f64,
    fitted: Option<FittedBoost>,
}

impl Default for ComponentwiseCoxBoost {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            learning_rate: 0.1,
            step_penalty: 1.0,
            fitted: None,
        }
    }
}

impl ComponentwiseCoxBoost {
    fn fitted(&self) -> Result<&FittedBoost, FitError> {
        self.fitted.as_ref().ok_or(FitError::NotFitted)
    }
}

impl Estimator for ComponentwiseCoxBoost {
    fn set_params(&mut self, params: &ParamSet) -> Result<(), FitError> {
        for (name, value) in params {
            match name.as_str() {
                "n_estimators" => {
                    self.n_estimators = value
                        .as_usize()
                        .ok_or_else(|| FitError::invalid_parameter(name, value))?
                }
                "learning_rate" => match value.as_f64() {
                    Some(rate) if rate > 0.0 && rate <= 1.0 => self.learning_rate = rate,
                    _ => return Err(FitError::invalid_parameter(name, value)),
                },
                "step_penalty" => match value.as_f64() {
                    Some(penalty) if penalty >= 0.0 => self.step_penalty = penalty,
                    _ => return Err(FitError::invalid_parameter(name, value)),
                },
                _ => return Err(FitError::invalid_parameter(name, value)),
            }
        }
        Ok(())
    }

    fn fit(&mut self, x: &FeatureFrame, y: &Target) -> Result<(), FitError> {
        let outcome = outcome_from("CoxBoost", y)?;
        check_rows(x, &outcome)?;
        let values = x.values();
        let (n, p) = values.dim();
        let mut coef = Array1::zeros(p);
        let mut eta: Array1<f64> = Array1::zeros(n);

        if p > 0 && outcome.n_events() > 0 {
            let risk_sets = RiskSets::new(&outcome);
            for _ in 0..self.n_estimators {
                let weights = shifted_weights(&eta);
                let mut best: Option<(usize, f64, f64)> = None;
                for j in 0..p {
                    let (gradient, hessian) =
                        risk_sets.coordinate_derivatives(values.column(j), &weights, outcome.event());
                    let denominator = hessian + self.step_penalty;
                    if denominator <= 0.0 {
                        continue;
                    }
                    let statistic = gradient * gradient / denominator;
                    if best.is_none_or(|(_, current, _)| statistic > current) {
                        best = Some((j, statistic, gradient / denominator));
                    }
                }
                let Some((j, _, newton_step)) = best else {
                    break;
                };
                let step = self.learning_rate * newton_step;
                if !step.is_finite() {
                    return Err(FitError::Diverged("CoxBoost step"));
                }
                coef[j] += step;
                eta.scaled_add(step, &values.column(j));
            }
        }

        let baseline = BreslowBaseline::fit(&outcome, eta.view());
        self.fitted = Some(FittedBoost { coef, baseline });
        Ok(())
    }

    fn predict(&self, x: &FeatureFrame) -> Result<Array1<f64>, FitError> {
        let fitted = self.fitted()?;
        check_width(x, fitted.coef.len())?;
        Ok(x.values().dot(&fitted.coef))
    }

    fn score(&self, x: &FeatureFrame, y: &Target) -> Result<f64, FitError> {
        risk_concordance("CoxBoost", &self.predict(x)?, y)
    }

    fn predict_survival_function(
        &self,
        x: &FeatureFrame,
        times: &[f64],
    ) -> Result<Array2<f64>, SurvivalCurveError> {
        let eta = self.predict(x)?;
        Ok(self.fitted()?.baseline.survival(eta.view(), times))
    }

    fn feature_importances(&self) -> Option<Array1<f64>> {
        self.fitted.as_ref().map(|f| f.coef.mapv(f64::abs))
    }

    fn boxed_clone(&self) -> Box<dyn Estimator> {
        Box::new(self.clone())
    }
}

pub struct CoxBoost;

impl ModelBuilder for CoxBoost {
    fn name(&self) -> &'static str {
        "CoxBoost"
    }

    fn capabilities(&self) -> ModelCapabilities {
        ModelCapabilities::standard()
    }

    fn fresh_estimator(&self) -> Box<dyn Estimator> {
        Box::new(ComponentwiseCoxBoost::default())
    }

    fn search_space(&self) -> SearchSpace {
        SearchSpace::from([
            (
                "n_estimators".to_string(),
                ParamDomain::choice([50_i64, 100, 200]),
            ),
            (
                "learning_rate".to_string(),
                ParamDomain::choice([0.05, 0.1, 0.2, 0.5]),
            ),
        ])
    }
}
