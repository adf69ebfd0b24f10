//! Penalised Cox proportional hazards models.
//!
//! The partial likelihood uses Breslow's handling of ties. Coefficients are
//! fitted by cyclic coordinate descent: each coordinate takes a proximal Newton
//! step with soft-thresholding for the L1 part of the elastic-net penalty
//!
//! ```text
//! -(1/n) log PL(beta) + alpha * (l1_ratio * |beta|_1 + (1 - l1_ratio) / 2 * |beta|_2^2)
//! ```
//!
//! Survival curves come from the Breslow estimate of the baseline cumulative hazard.

use super::{
    Estimator, FitError, ModelBuilder, ModelCapabilities, SurvivalCurveError, check_width,
    risk_concordance,
};
use crate::search::{ParamDomain, SearchSpace};
use crate::types::{FeatureFrame, FrameError, ParamSet, SurvivalOutcome, Target};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};

/// Linear predictors are clamped to this magnitude before exponentiation.
pub(crate) const MAX_LINEAR_PREDICTOR: f64 = 50.0;

/// Samples grouped by tied time, latest time first, so that the risk set of a
/// group is every group up to and including it.
#[derive(Debug, Clone)]
pub(crate) struct RiskSets {
    groups: Vec<Vec<usize>>,
}

impl RiskSets {
    pub(crate) fn new(outcome: &SurvivalOutcome) -> Self {
        let time = outcome.time();
        let mut order: Vec<usize> = (0..outcome.len()).collect();
        order.sort_by(|&a, &b| time[b].total_cmp(&time[a]));

        let mut groups: Vec<Vec<usize>> = Vec::new();
        for idx in order {
            match groups.last_mut() {
                Some(group) if time[group[0]] == time[idx] => group.push(idx),
                _ => groups.push(vec![idx]),
            }
        }
        Self { groups }
    }

    /// Score and observed information of the log partial likelihood along one
    /// feature column. `weights` are `exp(eta)` up to a common factor.
    pub(crate) fn coordinate_derivatives(
        &self,
        column: ArrayView1<'_, f64>,
        weights: &[f64],
        event: &Array1<bool>,
    ) -> (f64, f64) {
        let (mut s0, mut s1, mut s2) = (0.0, 0.0, 0.0);
        let (mut gradient, mut hessian) = (0.0, 0.0);
        for group in &self.groups {
            for &i in group {
                let w = weights[i];
                let x = column[i];
                s0 += w;
                s1 += w * x;
                s2 += w * x * x;
            }
            if s0 <= 0.0 {
                continue;
            }
            let mean = s1 / s0;
            let variance = (s2 / s0 - mean * mean).max(0.0);
            for &i in group {
                if event[i] {
                    gradient += column[i] - mean;
                    hessian += variance;
                }
            }
        }
        (gradient, hessian)
    }

    /// Per-sample gradient and diagonal Hessian of the negative log partial
    /// likelihood with respect to the margin `eta`.
    pub(crate) fn margin_gradients(
        &self,
        eta: &Array1<f64>,
        event: &Array1<bool>,
    ) -> (Array1<f64>, Array1<f64>) {
        let weights = shifted_weights(eta);
        let mut s0_by_group = Vec::with_capacity(self.groups.len());
        let mut s0 = 0.0;
        for group in &self.groups {
            s0 += group.iter().map(|&i| weights[i]).sum::<f64>();
            s0_by_group.push(s0);
        }

        let n = eta.len();
        let mut gradient = Array1::zeros(n);
        let mut hessian = Array1::zeros(n);
        let (mut first, mut second) = (0.0, 0.0);
        for (group, &s0) in self.groups.iter().zip(&s0_by_group).rev() {
            let deaths = group.iter().filter(|&&i| event[i]).count() as f64;
            if deaths > 0.0 && s0 > 0.0 {
                first += deaths / s0;
                second += deaths / (s0 * s0);
            }
            for &i in group {
                let w = weights[i];
                gradient[i] = w * first - if event[i] { 1.0 } else { 0.0 };
                hessian[i] = (w * first - w * w * second).max(0.0);
            }
        }
        (gradient, hessian)
    }

    /// Log partial likelihood at linear predictor `eta`.
    pub(crate) fn log_likelihood(&self, eta: ArrayView1<'_, f64>, event: &Array1<bool>) -> f64 {
        let shift = eta.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if !shift.is_finite() {
            return 0.0;
        }
        let mut s0 = 0.0;
        let mut total = 0.0;
        for group in &self.groups {
            for &i in group {
                s0 += (eta[i] - shift).exp();
            }
            let log_s0 = s0.ln() + shift;
            for &i in group {
                if event[i] {
                    total += eta[i] - log_s0;
                }
            }
        }
        total
    }
}

/// `exp(eta - max(eta))`, the risk weights up to a common factor.
pub(crate) fn shifted_weights(eta: &Array1<f64>) -> Vec<f64> {
    let shift = eta.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let shift = if shift.is_finite() { shift } else { 0.0 };
    eta.iter().map(|&e| (e - shift).exp()).collect()
}

/// Breslow estimate of the baseline cumulative hazard, stored as a step function.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct BreslowBaseline {
    times: Vec<f64>,
    cumulative_hazard: Vec<f64>,
}

impl BreslowBaseline {
    pub(crate) fn fit(outcome: &SurvivalOutcome, eta: ArrayView1<'_, f64>) -> Self {
        let risk_sets = RiskSets::new(outcome);
        let event = outcome.event();
        let time = outcome.time();
        let mut s0 = 0.0;
        let mut increments: Vec<(f64, f64)> = Vec::new();
        for group in &risk_sets.groups {
            for &i in group {
                s0 += eta[i].clamp(-MAX_LINEAR_PREDICTOR, MAX_LINEAR_PREDICTOR).exp();
            }
            let deaths = group.iter().filter(|&&i| event[i]).count();
            if deaths > 0 && s0 > 0.0 {
                increments.push((time[group[0]], deaths as f64 / s0));
            }
        }
        increments.reverse();

        let mut times = Vec::with_capacity(increments.len());
        let mut cumulative_hazard = Vec::with_capacity(increments.len());
        let mut running = 0.0;
        for (t, increment) in increments {
            running += increment;
            times.push(t);
            cumulative_hazard.push(running);
        }
        Self {
            times,
            cumulative_hazard,
        }
    }

    pub(crate) fn cumulative_hazard_at(&self, t: f64) -> f64 {
        let idx = self.times.partition_point(|&u| u <= t);
        if idx == 0 {
            0.0
        } else {
            self.cumulative_hazard[idx - 1]
        }
    }

    /// `S(t | x) = exp(-H0(t) * exp(eta))` for every sample and grid time.
    pub(crate) fn survival(&self, eta: ArrayView1<'_, f64>, times: &[f64]) -> Array2<f64> {
        let hazards: Vec<f64> = times.iter().map(|&t| self.cumulative_hazard_at(t)).collect();
        let mut survival = Array2::zeros((eta.len(), times.len()));
        for (mut row, &e) in survival.axis_iter_mut(Axis(0)).zip(eta.iter()) {
            let relative = e.clamp(-MAX_LINEAR_PREDICTOR, MAX_LINEAR_PREDICTOR).exp();
            for (s, &h) in row.iter_mut().zip(&hazards) {
                *s = (-h * relative).exp();
            }
        }
        survival
    }
}

pub(crate) fn outcome_from(estimator: &'static str, y: &Target) -> Result<SurvivalOutcome, FitError> {
    y.to_outcome().ok_or(FitError::UnsupportedTarget {
        estimator,
        target: y.kind(),
    })
}

pub(crate) fn check_rows(x: &FeatureFrame, outcome: &SurvivalOutcome) -> Result<(), FitError> {
    if x.n_rows() != outcome.len() {
        return Err(FrameError::RowCountMismatch {
            expected: x.n_rows(),
            found: outcome.len(),
        }
        .into());
    }
    Ok(())
}

#[inline]
fn soft_threshold(z: f64, lambda: f64) -> f64 {
    if z > lambda {
        z - lambda
    } else if z < -lambda {
        z + lambda
    } else {
        0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Penalty {
    pub alpha: f64,
    pub l1_ratio: f64,
}

/// Cyclic coordinate descent on the penalised negative log partial likelihood.
pub(crate) fn fit_coefficients(
    x: ArrayView2<'_, f64>,
    outcome: &SurvivalOutcome,
    penalty: Penalty,
    max_iter: usize,
    tolerance: f64,
) -> Result<Array1<f64>, FitError> {
    let (n, p) = x.dim();
    let mut beta = Array1::zeros(p);
    if n == 0 || p == 0 || outcome.n_events() == 0 {
        return Ok(beta);
    }
    let risk_sets = RiskSets::new(outcome);
    let event = outcome.event();
    let scale = 1.0 / n as f64;
    let l1 = penalty.alpha * penalty.l1_ratio;
    let l2 = penalty.alpha * (1.0 - penalty.l1_ratio);
    let mut eta: Array1<f64> = Array1::zeros(n);

    for iteration in 0..max_iter {
        let mut largest_step: f64 = 0.0;
        for j in 0..p {
            let column = x.column(j);
            let weights = shifted_weights(&eta);
            let (gradient, hessian) = risk_sets.coordinate_derivatives(column, &weights, event);
            let (g, h) = (gradient * scale, hessian * scale);
            if h <= 1e-12 && l2 <= 0.0 {
                continue;
            }
            let updated = soft_threshold(h * beta[j] + g, l1) / (h + l2);
            let step = updated - beta[j];
            if step != 0.0 {
                eta.scaled_add(step, &column);
                beta[j] = updated;
                largest_step = largest_step.max(step.abs());
            }
        }
        if beta.iter().any(|b| !b.is_finite()) {
            return Err(FitError::Diverged("Cox coefficients"));
        }
        if largest_step < tolerance {
            log::trace!(
                "Coordinate descent converged after {} sweeps (log partial likelihood {:.4})",
                iteration + 1,
                risk_sets.log_likelihood(eta.view(), event)
            );
            return Ok(beta);
        }
    }
    log::debug!("Coordinate descent stopped at {max_iter} sweeps without converging");
    Ok(beta)
}

#[derive(Debug, Clone, PartialEq)]
struct FittedCox {
    coef: Array1<f64>,
    baseline: BreslowBaseline,
}

/// Elastic-net penalised Cox model.
#[derive(Debug, Clone, PartialEq)]
pub struct PenalizedCox {
    name: &'static str,
    penalty: Penalty,
    max_iter: usize,
    tolerance: f64,
    fitted: Option<FittedCox>,
}

impl PenalizedCox {
    pub fn new(name: &'static str, alpha: f64, l1_ratio: f64) -> Self {
        Self {
            name,
            penalty: Penalty { alpha, l1_ratio },
            max_iter: 100,
            tolerance: 1e-7,
            fitted: None,
        }
    }

    pub fn coefficients(&self) -> Option<&Array1<f64>> {
        self.fitted.as_ref().map(|f| &f.coef)
    }

    fn fitted(&self) -> Result<&FittedCox, FitError> {
        self.fitted.as_ref().ok_or(FitError::NotFitted)
    }
}

impl Estimator for PenalizedCox {
    fn set_params(&mut self, params: &ParamSet) -> Result<(), FitError> {
        for (name, value) in params {
            match name.as_str() {
                "alpha" => match value.as_f64() {
                    Some(alpha) if alpha >= 0.0 => self.penalty.alpha = alpha,
                    _ => return Err(FitError::invalid_parameter(name, value)),
                },
                "l1_ratio" => match value.as_f64() {
                    Some(ratio) if (0.0..=1.0).contains(&ratio) => self.penalty.l1_ratio = ratio,
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
        let outcome = outcome_from(self.name, y)?;
        check_rows(x, &outcome)?;
        let coef = fit_coefficients(
            x.values().view(),
            &outcome,
            self.penalty,
            self.max_iter,
            self.tolerance,
        )?;
        let eta = x.values().dot(&coef);
        let baseline = BreslowBaseline::fit(&outcome, eta.view());
        self.fitted = Some(FittedCox { coef, baseline });
        Ok(())
    }

    fn predict(&self, x: &FeatureFrame) -> Result<Array1<f64>, FitError> {
        let fitted = self.fitted()?;
        check_width(x, fitted.coef.len())?;
        Ok(x.values().dot(&fitted.coef))
    }

    fn score(&self, x: &FeatureFrame, y: &Target) -> Result<f64, FitError> {
        risk_concordance(self.name, &self.predict(x)?, y)
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
        self.coefficients().map(|c| c.mapv(f64::abs))
    }

    fn boxed_clone(&self) -> Box<dyn Estimator> {
        Box::new(self.clone())
    }
}

fn alpha_grid(values: &[f64]) -> ParamDomain {
    ParamDomain::choice(values.iter().copied())
}

/// Cox model with a light ridge penalty for numerical stability.
pub struct Cph;

impl ModelBuilder for Cph {
    fn name(&self) -> &'static str {
        "CPH"
    }

    fn capabilities(&self) -> ModelCapabilities {
        ModelCapabilities::standard()
    }

    fn fresh_estimator(&self) -> Box<dyn Estimator> {
        Box::new(PenalizedCox::new(self.name(), 1e-4, 0.0))
    }

    fn search_space(&self) -> SearchSpace {
        SearchSpace::from([("alpha".to_string(), alpha_grid(&[0.0, 1e-4, 1e-3, 1e-2]))])
    }
}

pub struct CphRidge;

impl ModelBuilder for CphRidge {
    fn name(&self) -> &'static str {
        "CPHRidge"
    }

    fn capabilities(&self) -> ModelCapabilities {
        ModelCapabilities::standard()
    }

    fn fresh_estimator(&self) -> Box<dyn Estimator> {
        Box::new(PenalizedCox::new(self.name(), 0.1, 0.0))
    }

    fn search_space(&self) -> SearchSpace {
        SearchSpace::from([(
            "alpha".to_string(),
            alpha_grid(&[0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]),
        )])
    }
}

pub struct CphLasso;

impl ModelBuilder for CphLasso {
    fn name(&self) -> &'static str {
        "CPHLasso"
    }

    fn capabilities(&self) -> ModelCapabilities {
        ModelCapabilities::standard()
    }

    fn fresh_estimator(&self) -> Box<dyn Estimator> {
        Box::new(PenalizedCox::new(self.name(), 0.01, 1.0))
    }

    fn search_space(&self) -> SearchSpace {
        SearchSpace::from([(
            "alpha".to_string(),
            ParamDomain::LogUniform {
                low: 1e-4,
                high: 0.1,
            },
        )])
    }
}

pub struct CphElastic;

impl ModelBuilder for CphElastic {
    fn name(&self) -> &'static str {
        "CPHElastic"
    }

    fn capabilities(&self) -> ModelCapabilities {
        ModelCapabilities::standard()
    }

    fn fresh_estimator(&self) -> Box<dyn Estimator> {
        Box::new(PenalizedCox::new(self.name(), 0.01, 0.5))
    }

    fn search_space(&self) -> SearchSpace {
        SearchSpace::from([
            (
                "alpha".to_string(),
                ParamDomain::LogUniform {
                    low: 1e-4,
                    high: 0.1,
                },
            ),
            (
                "l1_ratio".to_string(),
                ParamDomain::Uniform {
                    low: 0.1,
                    high: 0.9,
                },
            ),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ParamValue;
    use ndarray::array;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand_distr::{Distribution, Exp, Normal};

    /// Hazard rises with the first feature only.
    fn synthetic(n: usize, seed: u64) -> (FeatureFrame, SurvivalOutcome) {
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let unit = Exp::new(1.0).unwrap();
        let mut values: Array2<f64> = Array2::zeros((n, 3));
        let mut time = Array1::zeros(n);
        let mut event = Array1::from_elem(n, true);
        for i in 0..n {
            for j in 0..3 {
                values[[i, j]] = normal.sample(&mut rng);
            }
            let hazard = (1.2 * values[[i, 0]]).exp();
            let event_time: f64 = unit.sample(&mut rng) / hazard;
            let censor_time: f64 = 2.0 * unit.sample(&mut rng);
            time[i] = event_time.min(censor_time);
            event[i] = event_time <= censor_time;
        }
        let names = vec!["signal".into(), "noise_a".into(), "noise_b".into()];
        (
            FeatureFrame::new(names, values).unwrap(),
            SurvivalOutcome::new(event, time).unwrap(),
        )
    }

    #[test]
    fn soft_threshold_shrinks_towards_zero() {
        assert_eq!(soft_threshold(1.5, 0.5), 1.0);
        assert_eq!(soft_threshold(-1.5, 0.5), -1.0);
        assert_eq!(soft_threshold(0.3, 0.5), 0.0);
    }

    #[test]
    fn coordinate_descent_recovers_the_signal_feature() {
        let (x, y) = synthetic(300, 1);
        let mut model = PenalizedCox::new("CPH", 1e-4, 0.0);
        model.fit(&x, &Target::Outcome(y.clone())).unwrap();
        let coef = model.coefficients().unwrap();
        assert!((coef[0] - 1.2).abs() < 0.35, "signal coefficient {}", coef[0]);
        assert!(coef[1].abs() < 0.3 && coef[2].abs() < 0.3);

        let ci = model.score(&x, &Target::Outcome(y)).unwrap();
        assert!(ci > 0.65, "training concordance {ci}");
    }

    #[test]
    fn fitting_increases_the_partial_likelihood() {
        let (x, y) = synthetic(120, 2);
        let risk_sets = RiskSets::new(&y);
        let null = risk_sets.log_likelihood(Array1::zeros(y.len()).view(), y.event());
        let mut model = PenalizedCox::new("CPH", 0.0, 0.0);
        model.fit(&x, &Target::Outcome(y.clone())).unwrap();
        let eta = model.predict(&x).unwrap();
        assert!(risk_sets.log_likelihood(eta.view(), y.event()) > null);
    }

    #[test]
    fn strong_lasso_zeroes_every_coefficient() {
        let (x, y) = synthetic(100, 3);
        let mut model = PenalizedCox::new("CPHLasso", 10.0, 1.0);
        model.fit(&x, &Target::Outcome(y)).unwrap();
        assert!(model.coefficients().unwrap().iter().all(|&c| c == 0.0));
    }

    #[test]
    fn survival_curves_are_monotone_and_bounded() {
        let (x, y) = synthetic(80, 4);
        let mut model = PenalizedCox::new("CPH", 1e-3, 0.0);
        model.fit(&x, &Target::Outcome(y)).unwrap();
        let grid = [0.1, 0.5, 1.0, 2.0];
        let curves = model.predict_survival_function(&x, &grid).unwrap();
        assert_eq!(curves.dim(), (80, 4));
        for row in curves.rows() {
            assert!(row.iter().all(|&s| (0.0..=1.0).contains(&s)));
            assert!(row.windows(2).into_iter().all(|w| w[1] <= w[0]));
        }
    }

    #[test]
    fn breslow_hazard_steps_at_event_times() {
        let y = SurvivalOutcome::new(array![true, false, true], array![1.0, 2.0, 3.0]).unwrap();
        let baseline = BreslowBaseline::fit(&y, Array1::zeros(3).view());
        assert_eq!(baseline.cumulative_hazard_at(0.5), 0.0);
        assert!((baseline.cumulative_hazard_at(1.0) - 1.0 / 3.0).abs() < 1e-12);
        assert!((baseline.cumulative_hazard_at(2.5) - 1.0 / 3.0).abs() < 1e-12);
        assert!((baseline.cumulative_hazard_at(3.0) - (1.0 / 3.0 + 1.0)).abs() < 1e-12);
    }

    #[test]
    fn unknown_parameters_are_rejected() {
        let mut model = PenalizedCox::new("CPH", 0.0, 0.0);
        let params = ParamSet::from([("gamma".to_string(), ParamValue::Float(1.0))]);
        assert!(matches!(
            model.set_params(&params),
            Err(FitError::InvalidParameter { .. })
        ));
        assert_eq!(
            model.predict(&synthetic(5, 0).0).unwrap_err(),
            FitError::NotFitted
        );
    }
}
