//! Random survival forest.
//!
//! Each tree is grown on a bootstrap sample by maximising the log-rank
//! statistic over a random subset of features at every node. Leaves hold
//! Nelson-Aalen cumulative hazards and Kaplan-Meier survival on the grid of
//! distinct training event times. The risk score is the ensemble mortality,
//! the cumulative hazard summed over that grid.

use super::cox::{check_rows, outcome_from};
use super::{
    Estimator, FitError, ModelBuilder, ModelCapabilities, SurvivalCurveError, check_width,
    risk_concordance,
};
use crate::search::{ParamDomain, SearchSpace};
use crate::types::{FeatureFrame, ParamSet, SurvivalOutcome, Target};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

/// Distinct thresholds tried per feature at one node, evenly spaced in rank.
const MAX_SPLIT_CANDIDATES: usize = 32;

#[derive(Debug, Clone, PartialEq)]
enum TreeNode {
    Leaf {
        survival: Vec<f64>,
        mortality: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

#[derive(Debug, Clone, PartialEq)]
struct SurvivalTree {
    nodes: Vec<TreeNode>,
}

impl SurvivalTree {
    fn leaf(&self, row: ArrayView1<'_, f64>) -> (&[f64], f64) {
        let mut idx = 0;
        loop {
            match &self.nodes[idx] {
                TreeNode::Leaf {
                    survival,
                    mortality,
                } => return (survival, *mortality),
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => idx = if row[*feature] <= *threshold { *left } else { *right },
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct ForestParams {
    n_estimators: usize,
    max_depth: usize,
    min_samples_split: usize,
    min_samples_leaf: usize,
    /// Fraction of features tried per node; `None` means `ceil(sqrt(p))`.
    max_features: Option<f64>,
    seed: u64,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            max_depth: usize::MAX,
            min_samples_split: 6,
            min_samples_leaf: 3,
            max_features: None,
            seed: 0,
        }
    }
}

impl ForestParams {
    fn features_per_node(&self, p: usize) -> usize {
        let m = match self.max_features {
            Some(fraction) => (fraction * p as f64).ceil() as usize,
            None => (p as f64).sqrt().ceil() as usize,
        };
        m.clamp(1, p.max(1))
    }
}

/// Bootstrap sample of one tree, sorted by ascending time.
struct Sample<'a> {
    x: ArrayView2<'a, f64>,
    rows: Vec<usize>,
    time: Vec<f64>,
    event: Vec<bool>,
}

/// Squared standardised log-rank statistic between `left` and the rest.
/// All slices are parallel and ordered by ascending time.
fn log_rank_statistic(time: &[f64], event: &[bool], left: &[bool]) -> f64 {
    let len = time.len();
    let mut at_risk = len as f64;
    let mut at_risk_left = left.iter().filter(|&&l| l).count() as f64;
    let (mut observed_minus_expected, mut variance) = (0.0, 0.0);
    let mut start = 0;
    while start < len {
        let t = time[start];
        let mut end = start;
        let (mut deaths, mut deaths_left, mut size_left) = (0.0, 0.0, 0.0);
        while end < len && time[end] == t {
            if event[end] {
                deaths += 1.0;
                if left[end] {
                    deaths_left += 1.0;
                }
            }
            if left[end] {
                size_left += 1.0;
            }
            end += 1;
        }
        if deaths > 0.0 && at_risk > 1.0 {
            let share = at_risk_left / at_risk;
            observed_minus_expected += deaths_left - deaths * share;
            variance += deaths * share * (1.0 - share) * (at_risk - deaths) / (at_risk - 1.0);
        }
        at_risk -= (end - start) as f64;
        at_risk_left -= size_left;
        start = end;
    }
    if variance <= 0.0 {
        0.0
    } else {
        observed_minus_expected * observed_minus_expected / variance
    }
}

struct Grower<'s, 'x> {
    sample: &'s Sample<'x>,
    grid: &'s [f64],
    params: &'s ForestParams,
    rng: StdRng,
    nodes: Vec<TreeNode>,
    importance: Vec<f64>,
}

impl Grower<'_, '_> {
    /// Nelson-Aalen mortality and Kaplan-Meier survival of the positions in
    /// `members` (ascending time) on the event-time grid.
    fn leaf(&self, members: &[usize]) -> TreeNode {
        let (time, event) = (&self.sample.time, &self.sample.event);
        let mut survival = Vec::with_capacity(self.grid.len());
        let (mut hazard, mut surv, mut mortality) = (0.0, 1.0, 0.0);
        let mut at_risk = members.len() as f64;
        let mut cursor = 0;
        for &t in self.grid {
            while cursor < members.len() && time[members[cursor]] < t {
                at_risk -= 1.0;
                cursor += 1;
            }
            let deaths = members[cursor..]
                .iter()
                .take_while(|&&m| time[m] == t)
                .filter(|&&m| event[m])
                .count() as f64;
            if deaths > 0.0 && at_risk > 0.0 {
                hazard += deaths / at_risk;
                surv *= 1.0 - deaths / at_risk;
            }
            mortality += hazard;
            survival.push(surv);
        }
        TreeNode::Leaf {
            survival,
            mortality,
        }
    }

    fn grow(&mut self, members: Vec<usize>, depth: usize) -> usize {
        let slot = self.nodes.len();
        let leaf = self.leaf(&members);
        self.nodes.push(leaf);
        let has_events = members.iter().any(|&m| self.sample.event[m]);
        if depth >= self.params.max_depth
            || members.len() < self.params.min_samples_split
            || !has_events
        {
            return slot;
        }
        let Some((feature, threshold, statistic)) = self.best_split(&members) else {
            return slot;
        };
        self.importance[feature] += statistic;

        let x = self.sample.x;
        let rows = &self.sample.rows;
        let (left_members, right_members): (Vec<usize>, Vec<usize>) = members
            .into_iter()
            .partition(|&m| x[[rows[m], feature]] <= threshold);
        let left = self.grow(left_members, depth + 1);
        let right = self.grow(right_members, depth + 1);
        self.nodes[slot] = TreeNode::Split {
            feature,
            threshold,
            left,
            right,
        };
        slot
    }

    fn best_split(&mut self, members: &[usize]) -> Option<(usize, f64, f64)> {
        let p = self.sample.x.ncols();
        if p == 0 {
            return None;
        }
        let tried = rand::seq::index::sample(&mut self.rng, p, self.params.features_per_node(p));
        let time: Vec<f64> = members.iter().map(|&m| self.sample.time[m]).collect();
        let event: Vec<bool> = members.iter().map(|&m| self.sample.event[m]).collect();
        let min_leaf = self.params.min_samples_leaf.max(1);

        let mut best: Option<(usize, f64, f64)> = None;
        for feature in tried.into_iter() {
            let values: Vec<f64> = members
                .iter()
                .map(|&m| self.sample.x[[self.sample.rows[m], feature]])
                .collect();
            let mut sorted = values.clone();
            sorted.sort_by(f64::total_cmp);
            sorted.dedup();
            if sorted.len() < 2 {
                continue;
            }
            let stride = (sorted.len() - 1).div_ceil(MAX_SPLIT_CANDIDATES).max(1);
            for k in (0..sorted.len() - 1).step_by(stride) {
                let threshold = 0.5 * (sorted[k] + sorted[k + 1]);
                let left: Vec<bool> = values.iter().map(|&v| v <= threshold).collect();
                let n_left = left.iter().filter(|&&l| l).count();
                if n_left < min_leaf || members.len() - n_left < min_leaf {
                    continue;
                }
                let statistic = log_rank_statistic(&time, &event, &left);
                if statistic > 0.0 && best.is_none_or(|(_, _, current)| statistic > current) {
                    best = Some((feature, threshold, statistic));
                }
            }
        }
        best
    }
}

#[derive(Debug, Clone, PartialEq)]
struct FittedForest {
    grid: Vec<f64>,
    trees: Vec<SurvivalTree>,
    importances: Array1<f64>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RandomSurvivalForest {
    params: ForestParams,
    fitted: Option<FittedForest>,
}

impl RandomSurvivalForest {
    fn fitted(&self) -> Result<&FittedForest, FitError> {
        self.fitted.as_ref().ok_or(FitError::NotFitted)
    }

    fn grow_tree(
        &self,
        x: ArrayView2<'_, f64>,
        outcome: &SurvivalOutcome,
        grid: &[f64],
        tree_idx: usize,
    ) -> (SurvivalTree, Vec<f64>) {
        let mut rng = StdRng::seed_from_u64(self.params.seed.wrapping_add(tree_idx as u64));
        let n = outcome.len();
        let mut rows: Vec<usize> = (0..n).map(|_| rng.gen_range(0..n)).collect();
        let (time, event) = (outcome.time(), outcome.event());
        rows.sort_by(|&a, &b| time[a].total_cmp(&time[b]));
        let sample = Sample {
            x,
            time: rows.iter().map(|&r| time[r]).collect(),
            event: rows.iter().map(|&r| event[r]).collect(),
            rows,
        };
        let mut grower = Grower {
            sample: &sample,
            grid,
            params: &self.params,
            rng,
            nodes: Vec::new(),
            importance: vec![0.0; x.ncols()],
        };
        grower.grow((0..n).collect(), 0);
        (
            SurvivalTree {
                nodes: grower.nodes,
            },
            grower.importance,
        )
    }
}

impl Estimator for RandomSurvivalForest {
    fn set_params(&mut self, params: &ParamSet) -> Result<(), FitError> {
        let p = &mut self.params;
        for (name, value) in params {
            let invalid = || FitError::invalid_parameter(name, value);
            match name.as_str() {
                "n_estimators" => {
                    p.n_estimators = value.as_usize().filter(|&v| v > 0).ok_or_else(invalid)?
                }
                "max_depth" => p.max_depth = value.as_usize().filter(|&v| v > 0).ok_or_else(invalid)?,
                "min_samples_split" => {
                    p.min_samples_split = value.as_usize().filter(|&v| v >= 2).ok_or_else(invalid)?
                }
                "min_samples_leaf" => {
                    p.min_samples_leaf = value.as_usize().filter(|&v| v >= 1).ok_or_else(invalid)?
                }
                "max_features" => {
                    p.max_features = Some(
                        value
                            .as_f64()
                            .filter(|&v| v > 0.0 && v <= 1.0)
                            .ok_or_else(invalid)?,
                    )
                }
                _ => return Err(invalid()),
            }
        }
        Ok(())
    }

    fn fit(&mut self, x: &FeatureFrame, y: &Target) -> Result<(), FitError> {
        let outcome = outcome_from("RSF", y)?;
        check_rows(x, &outcome)?;
        let mut grid: Vec<f64> = outcome
            .time()
            .iter()
            .zip(outcome.event())
            .filter(|(_, e)| **e)
            .map(|(t, _)| *t)
            .collect();
        grid.sort_by(f64::total_cmp);
        grid.dedup();

        let values = x.values().view();
        let grown: Vec<(SurvivalTree, Vec<f64>)> = (0..self.params.n_estimators)
            .into_par_iter()
            .map(|idx| self.grow_tree(values, &outcome, &grid, idx))
            .collect();

        let mut importances = Array1::zeros(x.n_cols());
        let mut trees = Vec::with_capacity(grown.len());
        for (tree, importance) in grown {
            importances += &Array1::from(importance);
            trees.push(tree);
        }
        importances /= trees.len().max(1) as f64;
        log::trace!("Grew {} survival trees on {} event times", trees.len(), grid.len());
        self.fitted = Some(FittedForest {
            grid,
            trees,
            importances,
        });
        Ok(())
    }

    /// Ensemble mortality: larger values mean higher risk.
    fn predict(&self, x: &FeatureFrame) -> Result<Array1<f64>, FitError> {
        let fitted = self.fitted()?;
        check_width(x, fitted.importances.len())?;
        let n_trees = fitted.trees.len().max(1) as f64;
        Ok(x.values()
            .rows()
            .into_iter()
            .map(|row| fitted.trees.iter().map(|t| t.leaf(row).1).sum::<f64>() / n_trees)
            .collect())
    }

    fn score(&self, x: &FeatureFrame, y: &Target) -> Result<f64, FitError> {
        risk_concordance("RSF", &self.predict(x)?, y)
    }

    fn predict_survival_function(
        &self,
        x: &FeatureFrame,
        times: &[f64],
    ) -> Result<Array2<f64>, SurvivalCurveError> {
        let fitted = self.fitted()?;
        check_width(x, fitted.importances.len())?;
        // Grid position of the last event time at or before each query time.
        let steps: Vec<Option<usize>> = times
            .iter()
            .map(|&t| fitted.grid.partition_point(|&g| g <= t).checked_sub(1))
            .collect();
        let n_trees = fitted.trees.len().max(1) as f64;
        let mut curves: Array2<f64> = Array2::zeros((x.n_rows(), times.len()));
        for (i, row) in x.values().rows().into_iter().enumerate() {
            for tree in &fitted.trees {
                let (survival, _) = tree.leaf(row);
                for (k, step) in steps.iter().enumerate() {
                    curves[[i, k]] += step.map_or(1.0, |s| survival[s]);
                }
            }
        }
        curves /= n_trees;
        Ok(curves)
    }

    fn feature_importances(&self) -> Option<Array1<f64>> {
        self.fitted.as_ref().map(|f| f.importances.clone())
    }

    fn boxed_clone(&self) -> Box<dyn Estimator> {
        Box::new(self.clone())
    }
}

pub struct Rsf;

impl ModelBuilder for Rsf {
    fn name(&self) -> &'static str {
        "RSF"
    }

    fn capabilities(&self) -> ModelCapabilities {
        ModelCapabilities::standard()
    }

    fn fresh_estimator(&self) -> Box<dyn Estimator> {
        Box::new(RandomSurvivalForest::default())
    }

    fn search_space(&self) -> SearchSpace {
        SearchSpace::from([
            ("n_estimators".to_string(), ParamDomain::choice([50_i64, 100, 200])),
            ("max_depth".to_string(), ParamDomain::choice([3_i64, 5, 8])),
            ("min_samples_leaf".to_string(), ParamDomain::choice([3_i64, 5, 10])),
        ])
    }
}
