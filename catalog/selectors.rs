//! Feature-selection strategies.

use super::cox::RiskSets;
use super::{Estimator, FeatureSelector, SelectionError, SelectorFamily};
use crate::types::{FeatureFrame, Target};
use ndarray::{ArrayView1, Axis};

/// Redundancy is floored at this value before dividing relevance by it.
const MRMR_REDUNDANCY_FLOOR: f64 = 0.001;

/// Keeps every feature.
pub struct NoneSelector;

impl FeatureSelector for NoneSelector {
    fn name(&self) -> &'static str {
        "NoneSelector"
    }

    fn display_name(&self) -> &'static str {
        "None"
    }

    fn family(&self) -> SelectorFamily {
        SelectorFamily::Passthrough
    }

    fn select(
        &self,
        x: &FeatureFrame,
        _y: &Target,
        _estimator: &dyn Estimator,
    ) -> Result<Vec<String>, SelectionError> {
        Ok(x.names().to_vec())
    }
}

/// Drops features whose training variance does not exceed `threshold`.
pub struct LowVar {
    pub threshold: f64,
}

impl Default for LowVar {
    fn default() -> Self {
        Self { threshold: 0.16 }
    }
}

impl FeatureSelector for LowVar {
    fn name(&self) -> &'static str {
        "LowVar"
    }

    fn family(&self) -> SelectorFamily {
        SelectorFamily::Variance
    }

    fn select(
        &self,
        x: &FeatureFrame,
        _y: &Target,
        _estimator: &dyn Estimator,
    ) -> Result<Vec<String>, SelectionError> {
        if x.n_rows() == 0 {
            return Ok(Vec::new());
        }
        let variances = x.values().var_axis(Axis(0), 0.0);
        Ok(x.names()
            .iter()
            .zip(variances.iter())
            .filter(|(_, v)| **v > self.threshold)
            .map(|(name, _)| name.clone())
            .collect())
    }
}

/// Names at `indices`, in frame column order.
fn names_in_column_order(x: &FeatureFrame, mut indices: Vec<usize>) -> Vec<String> {
    indices.sort_unstable();
    indices.into_iter().map(|j| x.names()[j].clone()).collect()
}

/// Top-`k` features by univariate Cox score statistic.
pub struct SelectKBest {
    name: &'static str,
    k: usize,
}

impl SelectKBest {
    pub fn new(name: &'static str, k: usize) -> Self {
        Self { name, k }
    }

    /// Score test of `beta_j = 0` in a single-feature Cox model, per feature.
    pub fn scores(x: &FeatureFrame, y: &Target) -> Result<Vec<f64>, SelectionError> {
        let outcome = y.to_outcome().ok_or(SelectionError::UnsupportedTarget {
            selector: "SelectKBest",
            expected: "censored outcome",
            found: y.kind(),
        })?;
        let risk_sets = RiskSets::new(&outcome);
        let weights = vec![1.0; outcome.len()];
        Ok(x.values()
            .axis_iter(Axis(1))
            .map(|column| {
                let (gradient, information) =
                    risk_sets.coordinate_derivatives(column, &weights, outcome.event());
                if information > 0.0 {
                    gradient * gradient / information
                } else {
                    0.0
                }
            })
            .collect())
    }
}

impl FeatureSelector for SelectKBest {
    fn name(&self) -> &'static str {
        self.name
    }

    fn family(&self) -> SelectorFamily {
        SelectorFamily::Univariate
    }

    fn select(
        &self,
        x: &FeatureFrame,
        y: &Target,
        _estimator: &dyn Estimator,
    ) -> Result<Vec<String>, SelectionError> {
        let scores = Self::scores(x, y)?;
        let mut ranked: Vec<usize> = (0..scores.len()).collect();
        ranked.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]).then(a.cmp(&b)));
        ranked.truncate(self.k);
        Ok(names_in_column_order(x, ranked))
    }
}

/// Recursive feature elimination: refit, drop the least important feature, repeat.
pub struct Rfe {
    name: &'static str,
    k: usize,
}

impl Rfe {
    pub fn new(name: &'static str, k: usize) -> Self {
        Self { name, k }
    }
}

impl FeatureSelector for Rfe {
    fn name(&self) -> &'static str {
        self.name
    }

    fn family(&self) -> SelectorFamily {
        SelectorFamily::Recursive
    }

    fn select(
        &self,
        x: &FeatureFrame,
        y: &Target,
        estimator: &dyn Estimator,
    ) -> Result<Vec<String>, SelectionError> {
        let mut remaining: Vec<String> = x.names().to_vec();
        while remaining.len() > self.k {
            let subset = x.project(&remaining)?;
            let mut model = estimator.boxed_clone();
            model.fit(&subset, y)?;
            let importances = model
                .feature_importances()
                .ok_or(SelectionError::NoImportances(self.name))?;
            let weakest = importances
                .iter()
                .enumerate()
                .min_by(|a, b| a.1.total_cmp(b.1))
                .map(|(idx, _)| idx)
                .ok_or(SelectionError::NoImportances(self.name))?;
            log::trace!("{} eliminated '{}'", self.name, remaining[weakest]);
            remaining.remove(weakest);
        }
        Ok(remaining)
    }
}

fn pearson(a: ArrayView1<'_, f64>, b: ArrayView1<'_, f64>) -> f64 {
    let n = a.len() as f64;
    if n < 2.0 {
        return 0.0;
    }
    let (mean_a, mean_b) = (a.sum() / n, b.sum() / n);
    let (mut cov, mut var_a, mut var_b) = (0.0, 0.0, 0.0);
    for (&u, &v) in a.iter().zip(b.iter()) {
        cov += (u - mean_a) * (v - mean_b);
        var_a += (u - mean_a) * (u - mean_a);
        var_b += (v - mean_b) * (v - mean_b);
    }
    if var_a <= 0.0 || var_b <= 0.0 {
        0.0
    } else {
        cov / (var_a * var_b).sqrt()
    }
}

/// Univariate regression F-statistic, `r^2 / (1 - r^2) * (n - 2)`.
fn f_statistic(feature: ArrayView1<'_, f64>, target: ArrayView1<'_, f64>) -> f64 {
    let r = pearson(feature, target);
    let dof = feature.len() as f64 - 2.0;
    if dof <= 0.0 {
        return 0.0;
    }
    let r2 = r * r;
    if r2 >= 1.0 {
        f64::MAX
    } else {
        r2 / (1.0 - r2) * dof
    }
}

/// Greedy minimum-redundancy maximum-relevance selection against a continuous
/// target: relevance is the F-statistic, redundancy the mean absolute Pearson
/// correlation with features already chosen. Returns features in selection order.
pub struct RegMrmr {
    name: &'static str,
    k: usize,
}

impl RegMrmr {
    pub fn new(name: &'static str, k: usize) -> Self {
        Self { name, k }
    }
}

impl FeatureSelector for RegMrmr {
    fn name(&self) -> &'static str {
        self.name
    }

    fn family(&self) -> SelectorFamily {
        SelectorFamily::RegressionMrmr
    }

    fn select(
        &self,
        x: &FeatureFrame,
        y: &Target,
        _estimator: &dyn Estimator,
    ) -> Result<Vec<String>, SelectionError> {
        let Target::Time(target) = y else {
            return Err(SelectionError::UnsupportedTarget {
                selector: self.name,
                expected: "continuous time",
                found: y.kind(),
            });
        };
        let values = x.values();
        let p = x.n_cols();
        let relevance: Vec<f64> = (0..p)
            .map(|j| f_statistic(values.column(j), target.view()))
            .collect();

        let mut selected: Vec<usize> = Vec::with_capacity(self.k.min(p));
        let mut redundancy_sum = vec![0.0; p];
        let mut available: Vec<bool> = vec![true; p];
        while selected.len() < self.k.min(p) {
            let mut best: Option<(usize, f64)> = None;
            for j in (0..p).filter(|&j| available[j]) {
                let score = if selected.is_empty() {
                    relevance[j]
                } else {
                    let redundancy = redundancy_sum[j] / selected.len() as f64;
                    relevance[j] / redundancy.max(MRMR_REDUNDANCY_FLOOR)
                };
                if best.is_none_or(|(_, current)| score > current) {
                    best = Some((j, score));
                }
            }
            let Some((chosen, _)) = best else { break };
            available[chosen] = false;
            selected.push(chosen);
            for j in (0..p).filter(|&j| available[j]) {
                redundancy_sum[j] += pearson(values.column(j), values.column(chosen)).abs();
            }
        }
        Ok(selected.into_iter().map(|j| x.names()[j].clone()).collect())
    }
}
