//! Second-order gradient boosting with the Cox objective.
//!
//! Labels use the signed-time convention and predictions are hazard ratios
//! (`exp(margin)`, the margin clamped to `±MAX_LINEAR_PREDICTOR`). Three boosters
//! share the objective: a coordinate-wise linear booster, a depth-limited
//! exact-greedy regression tree booster, and its DART variant that drops
//! earlier trees at random while fitting each new one. None produces survival
//! curves.

use super::cox::{MAX_LINEAR_PREDICTOR, RiskSets, check_rows, outcome_from};
use super::{
    ConcordanceRoutine, CurveSource, Estimator, FitError, LabelConvention, ModelBuilder,
    ModelCapabilities, SelectorEstimator, check_width, risk_concordance,
};
use crate::search::{ParamDomain, SearchSpace};
use crate::types::{FeatureFrame, ParamSet, Target};
use ndarray::{Array1, ArrayView1, ArrayView2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const CAPABILITIES: ModelCapabilities = ModelCapabilities {
    label: LabelConvention::SignedTime,
    concordance: ConcordanceRoutine::RiskScore,
    curves: CurveSource::Unsupported,
    selector_estimator: SelectorEstimator::Outer,
    unsupported: &[],
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoosterKind {
    Linear,
    Tree,
    Dart,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct BoostParams {
    n_estimators: usize,
    learning_rate: f64,
    reg_lambda: f64,
    reg_alpha: f64,
    max_depth: usize,
    min_child_weight: f64,
    gamma: f64,
    /// DART: probability that each earlier tree is dropped in a round.
    rate_drop: f64,
    /// DART: probability that a round drops nothing.
    skip_drop: f64,
    seed: u64,
}

impl Default for BoostParams {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            learning_rate: 0.3,
            reg_lambda: 1.0,
            reg_alpha: 0.0,
            max_depth: 3,
            min_child_weight: 1.0,
            gamma: 0.0,
            rate_drop: 0.1,
            skip_drop: 0.0,
            seed: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Leaf(f64),
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

#[derive(Debug, Clone, PartialEq)]
struct RegressionTree {
    nodes: Vec<Node>,
}

impl RegressionTree {
    fn predict_row(&self, row: ArrayView1<'_, f64>) -> f64 {
        let mut idx = 0;
        loop {
            match self.nodes[idx] {
                Node::Leaf(value) => return value,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => idx = if row[feature] < threshold { left } else { right },
            }
        }
    }
}

struct TreeGrower<'a, 'x> {
    x: ArrayView2<'x, f64>,
    gradient: &'a Array1<f64>,
    hessian: &'a Array1<f64>,
    params: &'a BoostParams,
    nodes: Vec<Node>,
    gains: &'a mut Array1<f64>,
}

struct BestSplit {
    feature: usize,
    threshold: f64,
    gain: f64,
}

impl TreeGrower<'_, '_> {
    fn leaf_weight(&self, g: f64, h: f64) -> f64 {
        -self.params.learning_rate * g / (h + self.params.reg_lambda)
    }

    fn grow(&mut self, indices: Vec<usize>, depth: usize) -> usize {
        let g: f64 = indices.iter().map(|&i| self.gradient[i]).sum();
        let h: f64 = indices.iter().map(|&i| self.hessian[i]).sum();
        let slot = self.nodes.len();
        self.nodes.push(Node::Leaf(self.leaf_weight(g, h)));
        if depth >= self.params.max_depth || indices.len() < 2 {
            return slot;
        }
        let Some(split) = self.best_split(&indices, g, h) else {
            return slot;
        };
        self.gains[split.feature] += split.gain;

        let (left_rows, right_rows): (Vec<usize>, Vec<usize>) = indices
            .into_iter()
            .partition(|&i| self.x[[i, split.feature]] < split.threshold);
        let left = self.grow(left_rows, depth + 1);
        let right = self.grow(right_rows, depth + 1);
        self.nodes[slot] = Node::Split {
            feature: split.feature,
            threshold: split.threshold,
            left,
            right,
        };
        slot
    }

    fn best_split(&self, indices: &[usize], g_total: f64, h_total: f64) -> Option<BestSplit> {
        let lambda = self.params.reg_lambda;
        let parent = g_total * g_total / (h_total + lambda);
        let mut best: Option<BestSplit> = None;
        let mut order = indices.to_vec();
        for feature in 0..self.x.ncols() {
            order.sort_by(|&a, &b| self.x[[a, feature]].total_cmp(&self.x[[b, feature]]));
            let (mut g_left, mut h_left) = (0.0, 0.0);
            for pair in order.windows(2) {
                let (current, next) = (pair[0], pair[1]);
                g_left += self.gradient[current];
                h_left += self.hessian[current];
                let (lo, hi) = (self.x[[current, feature]], self.x[[next, feature]]);
                if lo == hi {
                    continue;
                }
                let (g_right, h_right) = (g_total - g_left, h_total - h_left);
                if h_left < self.params.min_child_weight || h_right < self.params.min_child_weight
                {
                    continue;
                }
                let gain = 0.5
                    * (g_left * g_left / (h_left + lambda) + g_right * g_right / (h_right + lambda)
                        - parent)
                    - self.params.gamma;
                if gain > 0.0 && best.as_ref().is_none_or(|b| gain > b.gain) {
                    best = Some(BestSplit {
                        feature,
                        threshold: 0.5 * (lo + hi),
                        gain,
                    });
                }
            }
        }
        best
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Fitted {
    Linear { weights: Array1<f64>, bias: f64 },
    Trees(Vec<RegressionTree>),
    /// DART trees with their normalised weights.
    Dart {
        trees: Vec<RegressionTree>,
        weights: Vec<f64>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CoxGradientBooster {
    name: &'static str,
    kind: BoosterKind,
    params: BoostParams,
    n_features: usize,
    importances: Option<Array1<f64>>,
    fitted: Option<Fitted>,
}

impl CoxGradientBooster {
    pub fn new(name: &'static str, kind: BoosterKind) -> Self {
        Self {
            name,
            kind,
            params: BoostParams::default(),
            n_features: 0,
            importances: None,
            fitted: None,
        }
    }

    fn margin(&self, x: ArrayView2<'_, f64>) -> Result<Array1<f64>, FitError> {
        match self.fitted.as_ref().ok_or(FitError::NotFitted)? {
            Fitted::Linear { weights, bias } => Ok(x.dot(weights) + *bias),
            Fitted::Trees(trees) => Ok(x
                .rows()
                .into_iter()
                .map(|row| trees.iter().map(|t| t.predict_row(row)).sum())
                .collect()),
            Fitted::Dart { trees, weights } => Ok(x
                .rows()
                .into_iter()
                .map(|row| {
                    trees
                        .iter()
                        .zip(weights)
                        .map(|(t, w)| w * t.predict_row(row))
                        .sum()
                })
                .collect()),
        }
    }

    fn fit_linear(&self, x: ArrayView2<'_, f64>, risk_sets: &RiskSets, event: &Array1<bool>) -> Fitted {
        let p = &self.params;
        let (n, n_features) = x.dim();
        let mut weights: Array1<f64> = Array1::zeros(n_features);
        let mut bias = 0.0;
        let mut margin: Array1<f64> = Array1::zeros(n);
        for _ in 0..p.n_estimators {
            let (gradient, hessian) = risk_sets.margin_gradients(&margin, event);
            let h_sum = hessian.sum();
            if h_sum > 0.0 {
                let step = -p.learning_rate * gradient.sum() / h_sum;
                bias += step;
                margin += step;
            }
            for j in 0..n_features {
                let column = x.column(j);
                let g = gradient.dot(&column) + p.reg_lambda * weights[j];
                let h = (&hessian * &column).dot(&column) + p.reg_lambda;
                if h <= 0.0 {
                    continue;
                }
                let w = weights[j];
                // Elastic-net coordinate step, clipped so the L1 term cannot flip the sign.
                let raw = if w - g / h >= 0.0 {
                    (-(g + p.reg_alpha) / h).max(-w)
                } else {
                    (-(g - p.reg_alpha) / h).min(-w)
                };
                let step = p.learning_rate * raw;
                weights[j] += step;
                margin.scaled_add(step, &column);
            }
        }
        Fitted::Linear { weights, bias }
    }

    fn grow_tree(
        &self,
        x: ArrayView2<'_, f64>,
        gradient: &Array1<f64>,
        hessian: &Array1<f64>,
        gains: &mut Array1<f64>,
    ) -> RegressionTree {
        let mut grower = TreeGrower {
            x,
            gradient,
            hessian,
            params: &self.params,
            nodes: Vec::new(),
            gains,
        };
        grower.grow((0..x.nrows()).collect(), 0);
        RegressionTree {
            nodes: grower.nodes,
        }
    }

    fn fit_trees(
        &self,
        x: ArrayView2<'_, f64>,
        risk_sets: &RiskSets,
        event: &Array1<bool>,
        gains: &mut Array1<f64>,
    ) -> Fitted {
        let n = x.nrows();
        let mut margin: Array1<f64> = Array1::zeros(n);
        let mut trees = Vec::with_capacity(self.params.n_estimators);
        for _ in 0..self.params.n_estimators {
            let (gradient, hessian) = risk_sets.margin_gradients(&margin, event);
            let tree = self.grow_tree(x, &gradient, &hessian, gains);
            for (i, row) in x.rows().into_iter().enumerate() {
                margin[i] += tree.predict_row(row);
            }
            trees.push(tree);
        }
        Fitted::Trees(trees)
    }

    /// Each round fits a tree against the margin of the trees that survive a
    /// random drop, then rescales: the new tree gets `1 / (k + eta)` and each of
    /// the `k` dropped trees is shrunk by `k / (k + eta)`.
    fn fit_dart(
        &self,
        x: ArrayView2<'_, f64>,
        risk_sets: &RiskSets,
        event: &Array1<bool>,
        gains: &mut Array1<f64>,
    ) -> Fitted {
        let p = &self.params;
        let n = x.nrows();
        let mut rng = StdRng::seed_from_u64(p.seed);
        let mut trees: Vec<RegressionTree> = Vec::with_capacity(p.n_estimators);
        let mut weights: Vec<f64> = Vec::with_capacity(p.n_estimators);
        let mut contributions: Vec<Array1<f64>> = Vec::with_capacity(p.n_estimators);

        for _ in 0..p.n_estimators {
            let mut dropped = vec![false; trees.len()];
            if !trees.is_empty() && !rng.gen_bool(p.skip_drop) {
                for flag in dropped.iter_mut() {
                    *flag = rng.gen_bool(p.rate_drop);
                }
            }
            let mut margin: Array1<f64> = Array1::zeros(n);
            for ((contribution, &w), _) in contributions
                .iter()
                .zip(&weights)
                .zip(&dropped)
                .filter(|(_, is_dropped)| !**is_dropped)
            {
                margin.scaled_add(w, contribution);
            }

            let (gradient, hessian) = risk_sets.margin_gradients(&margin, event);
            let tree = self.grow_tree(x, &gradient, &hessian, gains);
            let contribution: Array1<f64> =
                x.rows().into_iter().map(|row| tree.predict_row(row)).collect();

            let k = dropped.iter().filter(|&&d| d).count() as f64;
            let new_weight = if k > 0.0 {
                let shrink = k / (k + p.learning_rate);
                for (w, _) in weights.iter_mut().zip(&dropped).filter(|(_, d)| **d) {
                    *w *= shrink;
                }
                1.0 / (k + p.learning_rate)
            } else {
                1.0
            };
            trees.push(tree);
            weights.push(new_weight);
            contributions.push(contribution);
        }
        Fitted::Dart { trees, weights }
    }
}

impl Estimator for CoxGradientBooster {
    fn set_params(&mut self, params: &ParamSet) -> Result<(), FitError> {
        let p = &mut self.params;
        for (name, value) in params {
            let invalid = || FitError::invalid_parameter(name, value);
            match name.as_str() {
                "n_estimators" => p.n_estimators = value.as_usize().ok_or_else(invalid)?,
                "max_depth" => p.max_depth = value.as_usize().ok_or_else(invalid)?,
                "learning_rate" => {
                    p.learning_rate = value.as_f64().filter(|&v| v > 0.0).ok_or_else(invalid)?
                }
                "reg_lambda" => {
                    p.reg_lambda = value.as_f64().filter(|&v| v >= 0.0).ok_or_else(invalid)?
                }
                "reg_alpha" => {
                    p.reg_alpha = value.as_f64().filter(|&v| v >= 0.0).ok_or_else(invalid)?
                }
                "min_child_weight" => {
                    p.min_child_weight = value.as_f64().filter(|&v| v >= 0.0).ok_or_else(invalid)?
                }
                "gamma" => p.gamma = value.as_f64().filter(|&v| v >= 0.0).ok_or_else(invalid)?,
                "rate_drop" => {
                    p.rate_drop = value
                        .as_f64()
                        .filter(|v| (0.0..=1.0).contains(v))
                        .ok_or_else(invalid)?
                }
                "skip_drop" => {
                    p.skip_drop = value
                        .as_f64()
                        .filter(|v| (0.0..=1.0).contains(v))
                        .ok_or_else(invalid)?
                }
                _ => return Err(invalid()),
            }
        }
        Ok(())
    }

    fn fit(&mut self, x: &FeatureFrame, y: &Target) -> Result<(), FitError> {
        let outcome = outcome_from(self.name, y)?;
        check_rows(x, &outcome)?;
        let risk_sets = RiskSets::new(&outcome);
        let values = x.values().view();
        let mut gains: Array1<f64> = Array1::zeros(x.n_cols());
        let fitted = match self.kind {
            BoosterKind::Linear => self.fit_linear(values, &risk_sets, outcome.event()),
            BoosterKind::Tree => self.fit_trees(values, &risk_sets, outcome.event(), &mut gains),
            BoosterKind::Dart => self.fit_dart(values, &risk_sets, outcome.event(), &mut gains),
        };
        let importances = match &fitted {
            Fitted::Linear { weights, .. } => weights.mapv(f64::abs),
            Fitted::Trees(_) | Fitted::Dart { .. } => gains,
        };
        if importances.iter().any(|v| !v.is_finite()) {
            return Err(FitError::Diverged("boosted margin"));
        }
        self.n_features = x.n_cols();
        self.importances = Some(importances);
        self.fitted = Some(fitted);
        Ok(())
    }

    /// Hazard ratios `exp(margin)`; the margin is clamped so outlying inputs stay finite.
    fn predict(&self, x: &FeatureFrame) -> Result<Array1<f64>, FitError> {
        if self.fitted.is_some() {
            check_width(x, self.n_features)?;
        }
        Ok(self
            .margin(x.values().view())?
            .mapv(|m| m.clamp(-MAX_LINEAR_PREDICTOR, MAX_LINEAR_PREDICTOR).exp()))
    }

    fn score(&self, x: &FeatureFrame, y: &Target) -> Result<f64, FitError> {
        risk_concordance(self.name, &self.predict(x)?, y)
    }

    fn feature_importances(&self) -> Option<Array1<f64>> {
        self.importances.clone()
    }

    fn boxed_clone(&self) -> Box<dyn Estimator> {
        Box::new(self.clone())
    }
}

pub struct XgbLinear;

impl ModelBuilder for XgbLinear {
    fn name(&self) -> &'static str {
        "XGBLinear"
    }

    fn capabilities(&self) -> ModelCapabilities {
        CAPABILITIES
    }

    fn fresh_estimator(&self) -> Box<dyn Estimator> {
        Box::new(CoxGradientBooster::new(self.name(), BoosterKind::Linear))
    }

    fn search_space(&self) -> SearchSpace {
        SearchSpace::from([
            ("n_estimators".to_string(), ParamDomain::choice([50_i64, 100])),
            ("learning_rate".to_string(), ParamDomain::choice([0.05, 0.1, 0.3])),
            ("reg_lambda".to_string(), ParamDomain::choice([0.0, 1.0, 10.0])),
            ("reg_alpha".to_string(), ParamDomain::choice([0.0, 0.1, 1.0])),
        ])
    }
}

pub struct XgbTree;

impl ModelBuilder for XgbTree {
    fn name(&self) -> &'static str {
        "XGBTree"
    }

    fn capabilities(&self) -> ModelCapabilities {
        CAPABILITIES
    }

    fn fresh_estimator(&self) -> Box<dyn Estimator> {
        Box::new(CoxGradientBooster::new(self.name(), BoosterKind::Tree))
    }

    fn search_space(&self) -> SearchSpace {
        SearchSpace::from([
            ("n_estimators".to_string(), ParamDomain::choice([25_i64, 50, 100])),
            ("learning_rate".to_string(), ParamDomain::choice([0.05, 0.1, 0.3])),
            ("max_depth".to_string(), ParamDomain::choice([2_i64, 3, 4])),
            ("min_child_weight".to_string(), ParamDomain::choice([0.5, 1.0, 5.0])),
        ])
    }
}

pub struct XgbDart;

impl ModelBuilder for XgbDart {
    fn name(&self) -> &'static str {
        "XGBDart"
    }

    fn capabilities(&self) -> ModelCapabilities {
        CAPABILITIES
    }

    fn fresh_estimator(&self) -> Box<dyn Estimator> {
        Box::new(CoxGradientBooster::new(self.name(), BoosterKind::Dart))
    }

    fn search_space(&self) -> SearchSpace {
        SearchSpace::from([
            ("n_estimators".to_string(), ParamDomain::choice([25_i64, 50, 100])),
            ("learning_rate".to_string(), ParamDomain::choice([0.05, 0.1, 0.3])),
            ("max_depth".to_string(), ParamDomain::choice([2_i64, 3, 4])),
            ("rate_drop".to_string(), ParamDomain::choice([0.05, 0.1, 0.2])),
        ])
    }
}
