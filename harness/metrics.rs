//! # Survival Evaluation Metrics
//!
//! Ranking agreement and calibration for right-censored predictions:
//!
//! - Harrell's concordance over risk scores (higher score = earlier event).
//! - Concordance over predicted survival times (higher value = later event), for
//!   models whose native output is a time rather than a risk.
//! - Uno's IPCW concordance, weighting comparable pairs by the inverse squared
//!   censoring survival estimated on a reference (training) sample.
//! - An approximate integrated Brier score over a time grid, weighted by the
//!   censoring distribution of the scored sample itself.
//!
//! Comparable pairs are (i, j) where i is an observed event and either
//! `T_j > T_i`, or `T_j == T_i` and j is censored.

use crate::scaler::quantile_sorted;
use crate::types::SurvivalOutcome;
use ndarray::{Array2, ArrayView1};
use thiserror::Error;

/// Prediction differences within this tolerance count as ties.
const TIED_TOLERANCE: f64 = 1e-8;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MetricError {
    #[error("expected {expected} predictions but received {found}")]
    LengthMismatch { expected: usize, found: usize },
    #[error("all samples are censored")]
    AllCensored,
    #[error("cannot evaluate an empty sample")]
    EmptyInput,
    #[error("predictions contain non-finite values")]
    NonFinitePrediction,
    #[error("survival matrix has shape {found:?} but {expected:?} was expected")]
    SurvivalShape {
        expected: (usize, usize),
        found: (usize, usize),
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Orientation {
    /// Larger value predicts an earlier event.
    Risk,
    /// Larger value predicts a later event.
    Time,
}

/// Harrell's concordance index for risk scores. NaN when no pair is comparable.
pub fn concordance_index_censored(
    outcome: &SurvivalOutcome,
    risk: ArrayView1<'_, f64>,
) -> Result<f64, MetricError> {
    concordance(outcome, risk, Orientation::Risk, |_| 1.0)
}

/// Concordance for predicted survival times, where a longer prediction should
/// pair with a later observed time.
pub fn concordance_index_predicted_time(
    outcome: &SurvivalOutcome,
    predicted_time: ArrayView1<'_, f64>,
) -> Result<f64, MetricError> {
    concordance(outcome, predicted_time, Orientation::Time, |_| 1.0)
}

/// Uno's IPCW concordance. The censoring distribution comes from `reference`;
/// pairs are drawn from `outcome`. Events whose left-limit censoring survival is
/// zero carry no weight.
pub fn concordance_index_ipcw(
    reference: &SurvivalOutcome,
    outcome: &SurvivalOutcome,
    risk: ArrayView1<'_, f64>,
) -> Result<f64, MetricError> {
    if reference.is_empty() {
        return Err(MetricError::EmptyInput);
    }
    let censoring = KaplanMeier::censoring(reference);
    let time = outcome.time();
    let weights: Vec<f64> = time
        .iter()
        .map(|&t| {
            let g = censoring.survival_before(t);
            if g > 0.0 { 1.0 / (g * g) } else { 0.0 }
        })
        .collect();
    concordance(outcome, risk, Orientation::Risk, |i| weights[i])
}

fn concordance<W>(
    outcome: &SurvivalOutcome,
    scores: ArrayView1<'_, f64>,
    orientation: Orientation,
    weight: W,
) -> Result<f64, MetricError>
where
    W: Fn(usize) -> f64,
{
    let n = outcome.len();
    if n == 0 {
        return Err(MetricError::EmptyInput);
    }
    if scores.len() != n {
        return Err(MetricError::LengthMismatch {
            expected: n,
            found: scores.len(),
        });
    }
    if scores.iter().any(|s| !s.is_finite()) {
        return Err(MetricError::NonFinitePrediction);
    }
    if outcome.n_events() == 0 {
        return Err(MetricError::AllCensored);
    }

    let time = outcome.time();
    let event = outcome.event();
    let mut numerator = 0.0;
    let mut denominator = 0.0;
    for i in (0..n).filter(|&i| event[i]) {
        let w = weight(i);
        if w == 0.0 {
            continue;
        }
        for j in 0..n {
            if j == i {
                continue;
            }
            let comparable = time[j] > time[i] || (time[j] == time[i] && !event[j]);
            if !comparable {
                continue;
            }
            denominator += w;
            let margin = match orientation {
                Orientation::Risk => scores[i] - scores[j],
                Orientation::Time => scores[j] - scores[i],
            };
            if margin.abs() <= TIED_TOLERANCE {
                numerator += 0.5 * w;
            } else if margin > 0.0 {
                numerator += w;
            }
        }
    }

    if denominator == 0.0 {
        return Ok(f64::NAN);
    }
    Ok(numerator / denominator)
}

/// Product-limit survival estimate as a right-continuous step function.
#[derive(Debug, Clone, PartialEq)]
pub struct KaplanMeier {
    times: Vec<f64>,
    survival: Vec<f64>,
}

impl KaplanMeier {
    /// Fits on `time` treating `failed[i] == true` as the event of interest.
    pub fn fit(time: ArrayView1<'_, f64>, failed: ArrayView1<'_, bool>) -> Self {
        let mut order: Vec<usize> = (0..time.len()).collect();
        order.sort_by(|&a, &b| time[a].total_cmp(&time[b]));

        let mut times = Vec::new();
        let mut survival = Vec::new();
        let mut at_risk = time.len();
        let mut current = 1.0;
        let mut idx = 0;
        while idx < order.len() {
            let t = time[order[idx]];
            let mut failures = 0usize;
            let mut leaving = 0usize;
            while idx < order.len() && time[order[idx]] == t {
                failures += usize::from(failed[order[idx]]);
                leaving += 1;
                idx += 1;
            }
            if at_risk > 0 {
                current *= 1.0 - failures as f64 / at_risk as f64;
            }
            times.push(t);
            survival.push(current);
            at_risk -= leaving;
        }
        Self { times, survival }
    }

    /// Kaplan-Meier estimate of the censoring distribution (censoring is the "event").
    pub fn censoring(outcome: &SurvivalOutcome) -> Self {
        let censored = outcome.event().mapv(|e| !e);
        Self::fit(outcome.time().view(), censored.view())
    }

    /// `S(t)`, including any drop at `t`.
    pub fn survival_at(&self, t: f64) -> f64 {
        let idx = self.times.partition_point(|&u| u <= t);
        if idx == 0 { 1.0 } else { self.survival[idx - 1] }
    }

    /// `S(t-)`, excluding any drop at `t`.
    pub fn survival_before(&self, t: f64) -> f64 {
        let idx = self.times.partition_point(|&u| u < t);
        if idx == 0 { 1.0 } else { self.survival[idx - 1] }
    }
}

/// Evaluation grid between the 10th and 90th percentile of `times`, at unit steps
/// starting from the lower percentile and stopping before `upper + 1`.
pub fn brier_time_grid(times: ArrayView1<'_, f64>) -> Result<Vec<f64>, MetricError> {
    if times.is_empty() {
        return Err(MetricError::EmptyInput);
    }
    let mut sorted = times.to_vec();
    sorted.sort_by(f64::total_cmp);
    let lower = quantile_sorted(&sorted, 0.10);
    let upper = quantile_sorted(&sorted, 0.90);
    let steps = (upper + 1.0 - lower).ceil().max(0.0) as usize;
    Ok((0..steps).map(|k| lower + k as f64).collect())
}

/// Approximate integrated Brier score: the IPCW Brier score at each grid time,
/// averaged over the grid. `survival[[i, k]]` is sample i's survival probability
/// at `grid[k]`.
pub fn approx_brier_score(
    outcome: &SurvivalOutcome,
    grid: &[f64],
    survival: &Array2<f64>,
) -> Result<f64, MetricError> {
    let n = outcome.len();
    if n == 0 || grid.is_empty() {
        return Err(MetricError::EmptyInput);
    }
    if survival.dim() != (n, grid.len()) {
        return Err(MetricError::SurvivalShape {
            expected: (n, grid.len()),
            found: survival.dim(),
        });
    }

    let censoring = KaplanMeier::censoring(outcome);
    let time = outcome.time();
    let event = outcome.event();
    let censoring_at_event: Vec<f64> = time.iter().map(|&t| censoring.survival_at(t)).collect();

    let mut total = 0.0;
    for (k, &window) in grid.iter().enumerate() {
        let censoring_at_window = censoring.survival_at(window);
        let mut window_sum = 0.0;
        for i in 0..n {
            let s = survival[[i, k]];
            if time[i] <= window && event[i] {
                if censoring_at_event[i] > 0.0 {
                    window_sum += s * s / censoring_at_event[i];
                }
            } else if time[i] > window && censoring_at_window > 0.0 {
                window_sum += (1.0 - s) * (1.0 - s) / censoring_at_window;
            }
        }
        total += window_sum / n as f64;
    }
    Ok(total / grid.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array1, array};

    fn outcome(event: Vec<bool>, time: Vec<f64>) -> SurvivalOutcome {
        SurvivalOutcome::new(Array1::from(event), Array1::from(time)).unwrap()
    }

    #[test]
    fn perfect_risk_ordering_scores_one() {
        let y = outcome(vec![true, true, true, false], vec![1.0, 2.0, 3.0, 4.0]);
        let risk = array![4.0, 3.0, 2.0, 1.0];
        assert_abs_diff_eq!(concordance_index_censored(&y, risk.view()).unwrap(), 1.0);
        let reversed = array![1.0, 2.0, 3.0, 4.0];
        assert_abs_diff_eq!(concordance_index_censored(&y, reversed.view()).unwrap(), 0.0);
    }

    #[test]
    fn tied_predictions_count_half() {
        let y = outcome(vec![true, true], vec![1.0, 2.0]);
        let risk = array![0.5, 0.5];
        assert_abs_diff_eq!(concordance_index_censored(&y, risk.view()).unwrap(), 0.5);
    }

    #[test]
    fn censored_at_event_time_is_comparable() {
        // Event at t=2 vs censored at t=2 is one comparable pair; two events tied at
        // the same time are not.
        let y = outcome(vec![true, false, true], vec![2.0, 2.0, 2.0]);
        let risk = array![1.0, 0.0, 3.0];
        // Pairs: (0,1) concordant, (2,1) concordant.
        assert_abs_diff_eq!(concordance_index_censored(&y, risk.view()).unwrap(), 1.0);
    }

    #[test]
    fn predicted_time_orientation_is_reversed() {
        let y = outcome(vec![true, true, true], vec![1.0, 2.0, 3.0]);
        let predicted = array![1.5, 2.5, 3.5];
        assert_abs_diff_eq!(
            concordance_index_predicted_time(&y, predicted.view()).unwrap(),
            1.0
        );
        assert_abs_diff_eq!(concordance_index_censored(&y, predicted.view()).unwrap(), 0.0);
    }

    #[test]
    fn all_censored_is_an_error() {
        let y = outcome(vec![false, false], vec![1.0, 2.0]);
        let risk = array![1.0, 2.0];
        assert_eq!(
            concordance_index_censored(&y, risk.view()).unwrap_err(),
            MetricError::AllCensored
        );
    }

    #[test]
    fn length_mismatch_is_an_error() {
        let y = outcome(vec![true, false], vec![1.0, 2.0]);
        let risk = array![1.0];
        assert!(matches!(
            concordance_index_censored(&y, risk.view()),
            Err(MetricError::LengthMismatch { expected: 2, found: 1 })
        ));
    }

    #[test]
    fn ipcw_matches_harrell_without_censoring() {
        let reference = outcome(vec![true; 5], vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        let y = outcome(vec![true, true, true, true], vec![1.5, 2.5, 3.5, 4.5]);
        let risk = array![3.0, 4.0, 2.0, 1.0];
        let harrell = concordance_index_censored(&y, risk.view()).unwrap();
        let uno = concordance_index_ipcw(&reference, &y, risk.view()).unwrap();
        assert_abs_diff_eq!(harrell, uno, epsilon = 1e-12);
    }

    #[test]
    fn ipcw_upweights_late_events() {
        // Censoring in the reference sample lowers G for later times, so the late
        // discordant pair dominates.
        let reference = outcome(
            vec![true, false, true, false, true, false],
            vec![1.0, 1.5, 2.0, 2.5, 3.0, 3.5],
        );
        let y = outcome(vec![true, true, true], vec![1.0, 2.0, 3.0]);
        let risk = array![3.0, 1.0, 2.0];
        let harrell = concordance_index_censored(&y, risk.view()).unwrap();
        let uno = concordance_index_ipcw(&reference, &y, risk.view()).unwrap();
        assert_abs_diff_eq!(harrell, 2.0 / 3.0, epsilon = 1e-12);
        assert!(uno < harrell);
    }

    #[test]
    fn kaplan_meier_steps() {
        let y = outcome(vec![true, false, true, true], vec![1.0, 2.0, 3.0, 3.0]);
        let km = KaplanMeier::fit(y.time().view(), y.event().view());
        assert_abs_diff_eq!(km.survival_at(0.5), 1.0);
        assert_abs_diff_eq!(km.survival_at(1.0), 0.75);
        assert_abs_diff_eq!(km.survival_before(1.0), 1.0);
        assert_abs_diff_eq!(km.survival_at(2.5), 0.75);
        assert_abs_diff_eq!(km.survival_at(3.0), 0.0);
    }

    #[test]
    fn grid_spans_the_inner_percentiles() {
        let times = Array1::from_iter((1..=100).map(f64::from));
        let grid = brier_time_grid(times.view()).unwrap();
        assert_abs_diff_eq!(grid[0], 10.9, epsilon = 1e-9);
        assert_abs_diff_eq!(*grid.last().unwrap(), 90.9, epsilon = 1e-9);
        assert_eq!(grid.len(), 81);
        for pair in grid.windows(2) {
            assert_abs_diff_eq!(pair[1] - pair[0], 1.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn brier_is_zero_for_perfect_curves() {
        let y = outcome(vec![true, true, true, true], vec![1.0, 2.0, 3.0, 4.0]);
        let grid = [1.5, 2.5];
        let survival = Array2::from_shape_fn((4, 2), |(i, k)| {
            if y.time()[i] <= grid[k] { 0.0 } else { 1.0 }
        });
        assert_abs_diff_eq!(approx_brier_score(&y, &grid, &survival).unwrap(), 0.0);
    }

    #[test]
    fn brier_of_an_uninformative_curve() {
        let y = outcome(vec![true, true], vec![1.0, 3.0]);
        let grid = [2.0];
        let survival = Array2::from_elem((2, 1), 0.5);
        assert_abs_diff_eq!(approx_brier_score(&y, &grid, &survival).unwrap(), 0.25);
    }

    #[test]
    fn brier_rejects_misshapen_curves() {
        let y = outcome(vec![true, false], vec![1.0, 3.0]);
        let survival = Array2::zeros((2, 3));
        assert!(matches!(
            approx_brier_score(&y, &[1.0, 2.0], &survival),
            Err(MetricError::SurvivalShape { .. })
        ));
    }
}
