//! Weibull accelerated failure time model.
//!
//! `log T = mu + x.beta + sigma * W` with `W` standard minimum extreme value.
//! Parameters `(mu, beta, log sigma)` maximise the mean log-likelihood minus a
//! ridge penalty on `beta`, by damped Newton-Raphson.
//!
//! [`WeibullAftWrapper`] adapts the model to the event-column convention: the
//! event indicator arrives as an extra `Observed` input column and the target
//! is the time alone.

use super::{
    ConcordanceRoutine, CurveSource, EVENT_COLUMN, Estimator, FitError, LabelConvention,
    ModelBuilder, ModelCapabilities, SelectorEstimator, SelectorFamily, SurvivalCurveError,
    check_width,
};
use super::cox::{check_rows, outcome_from};
use crate::metrics;
use crate::search::{ParamDomain, SearchSpace};
use crate::types::{FeatureFrame, ParamSet, SurvivalOutcome, Target};
use ndarray::{Array1, Array2, ArrayView2, Axis};

const MAX_STANDARDISED_RESIDUAL: f64 = 50.0;
const MAX_STEP_HALVINGS: usize = 30;

/// Solves `a x = b` by Gaussian elimination with partial pivoting.
fn solve_linear_system(a: &Array2<f64>, b: &Array1<f64>) -> Option<Array1<f64>> {
    let n = a.nrows();
    let mut a = a.clone();
    let mut b = b.clone();
    for i in 0..n {
        let pivot = (i..n).max_by(|&r, &s| a[[r, i]].abs().total_cmp(&a[[s, i]].abs()))?;
        if a[[pivot, i]].abs() < 1e-12 {
            return None;
        }
        if pivot != i {
            for j in 0..n {
                a.swap([i, j], [pivot, j]);
            }
            b.swap(i, pivot);
        }
        for k in i + 1..n {
            let factor = a[[k, i]] / a[[i, i]];
            for j in i..n {
                a[[k, j]] -= factor * a[[i, j]];
            }
            b[k] -= factor * b[i];
        }
    }
    let mut x = Array1::zeros(n);
    for i in (0..n).rev() {
        let mut value = b[i];
        for j in i + 1..n {
            value -= a[[i, j]] * x[j];
        }
        x[i] = value / a[[i, i]];
    }
    Some(x)
}

#[derive(Debug, Clone, PartialEq)]
struct Coefficients {
    mu: f64,
    beta: Array1<f64>,
    log_sigma: f64,
}

impl Coefficients {
    fn from_vector(theta: &Array1<f64>) -> Self {
        let p = theta.len() - 2;
        Self {
            mu: theta[0],
            beta: theta.slice(ndarray::s![1..=p]).to_owned(),
            log_sigma: theta[p + 1],
        }
    }

    fn location(&self, x: ArrayView2<'_, f64>) -> Array1<f64> {
        x.dot(&self.beta) + self.mu
    }
}

/// Penalised mean log-likelihood with its gradient and Hessian in
/// `theta = (mu, beta, log sigma)`.
struct Objective<'a> {
    x: ArrayView2<'a, f64>,
    log_time: Array1<f64>,
    event: Array1<f64>,
    penalizer: f64,
}

impl Objective<'_> {
    fn value(&self, theta: &Array1<f64>) -> f64 {
        let c = Coefficients::from_vector(theta);
        let sigma = c.log_sigma.exp();
        let location = c.location(self.x);
        let mut total = 0.0;
        for i in 0..location.len() {
            let z = ((self.log_time[i] - location[i]) / sigma)
                .clamp(-MAX_STANDARDISED_RESIDUAL, MAX_STANDARDISED_RESIDUAL);
            total += self.event[i] * (z - c.log_sigma) - z.exp();
        }
        total / location.len() as f64 - 0.5 * self.penalizer * c.beta.dot(&c.beta)
    }

    fn derivatives(&self, theta: &Array1<f64>) -> (Array1<f64>, Array2<f64>) {
        let c = Coefficients::from_vector(theta);
        let (n, p) = self.x.dim();
        let dim = p + 2;
        let sigma = c.log_sigma.exp();
        let location = c.location(self.x);
        let mut gradient = Array1::zeros(dim);
        let mut hessian = Array2::zeros((dim, dim));
        let mut design = Array1::zeros(p + 1);
        for i in 0..n {
            let z = ((self.log_time[i] - location[i]) / sigma)
                .clamp(-MAX_STANDARDISED_RESIDUAL, MAX_STANDARDISED_RESIDUAL);
            let ez = z.exp();
            let delta = self.event[i];
            let d_location = -(delta - ez) / sigma;
            let d_log_sigma = -delta - z * (delta - ez);
            let dd_location = -ez / (sigma * sigma);
            let dd_cross = -(z * ez + ez - delta) / sigma;
            let dd_log_sigma = z * (delta - ez) - z * z * ez;

            design[0] = 1.0;
            for j in 0..p {
                design[j + 1] = self.x[[i, j]];
            }
            for a in 0..=p {
                gradient[a] += d_location * design[a];
                hessian[[a, dim - 1]] += dd_cross * design[a];
                for b in 0..=p {
                    hessian[[a, b]] += dd_location * design[a] * design[b];
                }
            }
            gradient[dim - 1] += d_log_sigma;
            hessian[[dim - 1, dim - 1]] += dd_log_sigma;
        }

        let scale = 1.0 / n as f64;
        gradient *= scale;
        hessian *= scale;
        for a in 0..=p {
            hessian[[dim - 1, a]] = hessian[[a, dim - 1]];
        }
        for j in 1..=p {
            gradient[j] -= self.penalizer * theta[j];
            hessian[[j, j]] -= self.penalizer;
        }
        (gradient, hessian)
    }
}

/// Parametric Weibull AFT model on the structured outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct WeibullAftModel {
    penalizer: f64,
    max_iter: usize,
    tolerance: f64,
    fitted: Option<Coefficients>,
}

impl Default for WeibullAftModel {
    fn default() -> Self {
        Self {
            penalizer: 0.0,
            max_iter: 100,
            tolerance: 1e-9,
            fitted: None,
        }
    }
}

impl WeibullAftModel {
    fn coefficients(&self) -> Result<&Coefficients, FitError> {
        self.fitted.as_ref().ok_or(FitError::NotFitted)
    }

    /// Weibull shape `1 / sigma`.
    pub fn shape(&self) -> Option<f64> {
        self.fitted.as_ref().map(|c| (-c.log_sigma).exp())
    }

    /// Median survival time per sample.
    pub fn predict_median(&self, x: &FeatureFrame) -> Result<Array1<f64>, FitError> {
        let c = self.coefficients()?;
        check_width(x, c.beta.len())?;
        let sigma = c.log_sigma.exp();
        let offset = sigma * std::f64::consts::LN_2.ln();
        Ok(c.location(x.values().view()).mapv(|m| (m + offset).exp()))
    }
}

impl Estimator for WeibullAftModel {
    fn set_params(&mut self, params: &ParamSet) -> Result<(), FitError> {
        for (name, value) in params {
            match name.as_str() {
                "penalizer" => match value.as_f64() {
                    Some(p) if p >= 0.0 => self.penalizer = p,
                    _ => return Err(FitError::invalid_parameter(name, value)),
                },
                "max_iter" => {
                    self.max_iter = value
                        .as_usize()
                        .filter(|&m| m > 0)
                        .ok_or_else(|| FitError::invalid_parameter(name, value))?
                }
                _ => return Err(FitError::invalid_parameter(name, value)),
            }
        }
        Ok(())
    }

    fn fit(&mut self, x: &FeatureFrame, y: &Target) -> Result<(), FitError> {
        let outcome = outcome_from("WeibullAFT", y)?;
        check_rows(x, &outcome)?;
        if outcome.time().iter().any(|&t| t <= 0.0) {
            return Err(FitError::NonPositiveDuration);
        }
        let objective = Objective {
            x: x.values().view(),
            log_time: outcome.time().mapv(f64::ln),
            event: outcome.event_indicator(),
            penalizer: self.penalizer,
        };

        let p = x.n_cols();
        let mut theta = Array1::zeros(p + 2);
        let mean_log_time = objective.log_time.mean().unwrap_or(0.0);
        let sd_log_time = objective.log_time.std(0.0);
        theta[0] = mean_log_time;
        theta[p + 1] = if sd_log_time > 0.0 { sd_log_time.ln() } else { 0.0 };

        let mut current = objective.value(&theta);
        for iteration in 0..self.max_iter {
            let (gradient, hessian) = objective.derivatives(&theta);
            // Ascent direction: solve (-H) d = g, falling back to the gradient.
            let direction = solve_linear_system(&(-&hessian), &gradient)
                .filter(|d| d.dot(&gradient) > 0.0)
                .unwrap_or_else(|| gradient.clone());

            let mut step = 1.0;
            let mut accepted = None;
            for _ in 0..MAX_STEP_HALVINGS {
                let candidate = &theta + &(step * &direction);
                let value = objective.value(&candidate);
                if value.is_finite() && value >= current {
                    accepted = Some((candidate, value));
                    break;
                }
                step *= 0.5;
            }
            let Some((next, value)) = accepted else {
                log::debug!("Weibull AFT line search stalled after {iteration} iterations");
                break;
            };
            let improvement = value - current;
            theta = next;
            current = value;
            if improvement.abs() < self.tolerance {
                break;
            }
        }

        if theta.iter().any(|v| !v.is_finite()) {
            return Err(FitError::Diverged("Weibull AFT parameters"));
        }
        self.fitted = Some(Coefficients::from_vector(&theta));
        Ok(())
    }

    fn predict(&self, x: &FeatureFrame) -> Result<Array1<f64>, FitError> {
        self.predict_median(x)
    }

    fn score(&self, x: &FeatureFrame, y: &Target) -> Result<f64, FitError> {
        let outcome = outcome_from("WeibullAFT", y)?;
        Ok(metrics::concordance_index_predicted_time(
            &outcome,
            self.predict(x)?.view(),
        )?)
    }

    fn predict_survival_function(
        &self,
        x: &FeatureFrame,
        times: &[f64],
    ) -> Result<Array2<f64>, SurvivalCurveError> {
        let c = self.coefficients()?;
        check_width(x, c.beta.len())?;
        let sigma = c.log_sigma.exp();
        let location = c.location(x.values().view());
        let mut survival = Array2::zeros((location.len(), times.len()));
        for (mut row, &m) in survival.axis_iter_mut(Axis(0)).zip(location.iter()) {
            for (s, &t) in row.iter_mut().zip(times) {
                *s = if t <= 0.0 {
                    1.0
                } else {
                    (-((t.ln() - m) / sigma).exp()).exp()
                };
            }
        }
        Ok(survival)
    }

    fn feature_importances(&self) -> Option<Array1<f64>> {
        self.fitted.as_ref().map(|c| c.beta.mapv(f64::abs))
    }

    fn boxed_clone(&self) -> Box<dyn Estimator> {
        Box::new(self.clone())
    }
}

/// Reads the event indicator from the `Observed` input column and delegates to
/// an inner [`WeibullAftModel`] on the remaining features.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WeibullAftWrapper {
    inner: WeibullAftModel,
}

impl WeibullAftWrapper {
    fn split_inputs(x: &FeatureFrame) -> Result<(FeatureFrame, Array1<bool>), FitError> {
        let event = x
            .column(EVENT_COLUMN)
            .ok_or_else(|| crate::types::FrameError::UnknownColumn(EVENT_COLUMN.to_string()))?
            .mapv(|v| v > 0.5);
        Ok((x.without_column(EVENT_COLUMN)?, event))
    }

    /// Features with the event column removed when present.
    fn features(x: &FeatureFrame) -> Result<FeatureFrame, FitError> {
        match x.column_index(EVENT_COLUMN) {
            Some(_) => Ok(x.without_column(EVENT_COLUMN)?),
            None => Ok(x.clone()),
        }
    }

    fn outcome(x: &FeatureFrame, y: &Target) -> Result<(FeatureFrame, SurvivalOutcome), FitError> {
        let Target::Time(time) = y else {
            return Err(FitError::UnsupportedTarget {
                estimator: "WeibullAFT",
                target: y.kind(),
            });
        };
        let (features, event) = Self::split_inputs(x)?;
        Ok((features, SurvivalOutcome::new(event, time.clone())?))
    }
}

impl Estimator for WeibullAftWrapper {
    fn set_params(&mut self, params: &ParamSet) -> Result<(), FitError> {
        self.inner.set_params(params)
    }

    fn fit(&mut self, x: &FeatureFrame, y: &Target) -> Result<(), FitError> {
        let (features, outcome) = Self::outcome(x, y)?;
        self.inner.fit(&features, &Target::Outcome(outcome))
    }

    fn predict(&self, x: &FeatureFrame) -> Result<Array1<f64>, FitError> {
        self.inner.predict_median(&Self::features(x)?)
    }

    fn score(&self, x: &FeatureFrame, y: &Target) -> Result<f64, FitError> {
        let (features, outcome) = Self::outcome(x, y)?;
        self.inner.score(&features, &Target::Outcome(outcome))
    }

    fn predict_survival_function(
        &self,
        x: &FeatureFrame,
        times: &[f64],
    ) -> Result<Array2<f64>, SurvivalCurveError> {
        self.inner.predict_survival_function(&Self::features(x)?, times)
    }

    fn feature_importances(&self) -> Option<Array1<f64>> {
        self.inner.feature_importances()
    }

    fn inner(&self) -> Option<&dyn Estimator> {
        Some(&self.inner)
    }

    fn boxed_clone(&self) -> Box<dyn Estimator> {
        Box::new(self.clone())
    }
}

pub struct WeibullAft;

impl ModelBuilder for WeibullAft {
    fn name(&self) -> &'static str {
        "WeibullAFT"
    }

    fn capabilities(&self) -> ModelCapabilities {
        ModelCapabilities {
            label: LabelConvention::EventColumn,
            concordance: ConcordanceRoutine::PredictedTime,
            curves: CurveSource::Inner,
            selector_estimator: SelectorEstimator::Inner,
            unsupported: &[
                SelectorFamily::Passthrough,
                SelectorFamily::Variance,
                SelectorFamily::Recursive,
            ],
        }
    }

    fn fresh_estimator(&self) -> Box<dyn Estimator> {
        Box::new(WeibullAftWrapper::default())
    }

    fn search_space(&self) -> SearchSpace {
        SearchSpace::from([(
            "penalizer".to_string(),
            ParamDomain::choice([0.0, 0.001, 0.01, 0.1, 0.5]),
        )])
    }
}
