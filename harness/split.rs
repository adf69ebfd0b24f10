//! Stratified sample partitioning.
//!
//! Splits are index sets into a parent collection. The event indicator is the
//! stratification key throughout, so every partition keeps the observed/censored
//! proportion of its parent.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SplitError {
    #[error("number of folds must be at least 2 (got {0})")]
    InvalidFoldCount(usize),
    #[error("cannot make {n_splits} folds from {n_samples} samples")]
    TooFewSamples { n_splits: usize, n_samples: usize },
    #[error("n_splits={n_splits} cannot be greater than the number of members in each class")]
    ClassTooSmall { n_splits: usize },
    #[error("holdout fraction must lie strictly between 0 and 1 (got {0})")]
    InvalidFraction(f64),
}

/// Disjoint (training, validation) index sets whose union is the parent set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Split {
    pub train: Vec<usize>,
    pub validation: Vec<usize>,
}

/// One stratified train/holdout split. The holdout receives `ceil(fraction * n)` samples,
/// allotted to each class in proportion to its size.
pub fn stratified_holdout(
    strata: &[bool],
    holdout_fraction: f64,
    seed: u64,
) -> Result<Split, SplitError> {
    if !(holdout_fraction > 0.0 && holdout_fraction < 1.0) {
        return Err(SplitError::InvalidFraction(holdout_fraction));
    }
    let n = strata.len();
    let n_holdout = (holdout_fraction * n as f64).ceil() as usize;
    if n_holdout == 0 || n_holdout >= n {
        return Err(SplitError::TooFewSamples {
            n_splits: 2,
            n_samples: n,
        });
    }

    let classes = class_members(strata);
    let counts: Vec<usize> = classes.iter().map(Vec::len).collect();
    let allotted = approximate_mode(&counts, n_holdout);

    let mut rng = StdRng::seed_from_u64(seed);
    let mut train = Vec::with_capacity(n - n_holdout);
    let mut validation = Vec::with_capacity(n_holdout);
    for (mut members, take) in classes.into_iter().zip(allotted) {
        members.shuffle(&mut rng);
        validation.extend_from_slice(&members[..take]);
        train.extend_from_slice(&members[take..]);
    }
    train.sort_unstable();
    validation.sort_unstable();
    Ok(Split { train, validation })
}

/// Stratified k-fold partitioning, shuffled within each class using `seed`.
///
/// Class members are dealt to folds so that per-fold class counts differ by at
/// most one; validation indices are returned in ascending order.
pub fn stratified_kfold(
    strata: &[bool],
    n_splits: usize,
    seed: u64,
) -> Result<Vec<Split>, SplitError> {
    let n = strata.len();
    check_fold_count(n, n_splits)?;

    let classes = class_members(strata);
    let largest = classes.iter().map(Vec::len).max().unwrap_or(0);
    if largest < n_splits {
        return Err(SplitError::ClassTooSmall { n_splits });
    }
    let smallest = classes.iter().map(Vec::len).min().unwrap_or(0);
    if smallest < n_splits {
        log::warn!(
            "The least populated class has only {smallest} members, which is less than n_splits={n_splits}."
        );
    }

    // Dealing the class-sorted labels round-robin gives each fold its per-class quota.
    let mut sorted_labels: Vec<usize> = Vec::with_capacity(n);
    for (class, members) in classes.iter().enumerate() {
        sorted_labels.extend(std::iter::repeat_n(class, members.len()));
    }
    let mut allocation = vec![vec![0usize; classes.len()]; n_splits];
    for (position, &class) in sorted_labels.iter().enumerate() {
        allocation[position % n_splits][class] += 1;
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut fold_of = vec![0usize; n];
    for (class, members) in classes.iter().enumerate() {
        let mut folds_for_class: Vec<usize> = Vec::with_capacity(members.len());
        for (fold, quota) in allocation.iter().enumerate() {
            folds_for_class.extend(std::iter::repeat_n(fold, quota[class]));
        }
        folds_for_class.shuffle(&mut rng);
        for (&sample, &fold) in members.iter().zip(&folds_for_class) {
            fold_of[sample] = fold;
        }
    }

    Ok(splits_from_assignment(&fold_of, n_splits))
}

/// Unshuffled k-fold over `n` samples; the first `n % k` folds hold one extra sample.
pub fn kfold(n: usize, n_splits: usize) -> Result<Vec<Split>, SplitError> {
    check_fold_count(n, n_splits)?;
    let base = n / n_splits;
    let extra = n % n_splits;
    let mut fold_of = Vec::with_capacity(n);
    for fold in 0..n_splits {
        let size = base + usize::from(fold < extra);
        fold_of.extend(std::iter::repeat_n(fold, size));
    }
    Ok(splits_from_assignment(&fold_of, n_splits))
}

fn check_fold_count(n: usize, n_splits: usize) -> Result<(), SplitError> {
    if n_splits < 2 {
        return Err(SplitError::InvalidFoldCount(n_splits));
    }
    if n_splits > n {
        return Err(SplitError::TooFewSamples {
            n_splits,
            n_samples: n,
        });
    }
    Ok(())
}

/// Indices grouped by class; censored (`false`) first, then observed.
fn class_members(strata: &[bool]) -> Vec<Vec<usize>> {
    let mut classes = vec![Vec::new(), Vec::new()];
    for (idx, &observed) in strata.iter().enumerate() {
        classes[usize::from(observed)].push(idx);
    }
    classes.retain(|members| !members.is_empty());
    classes
}

/// Distributes `draws` over classes proportionally to `counts`, handing leftover
/// draws to the largest fractional remainders (earlier classes win ties).
fn approximate_mode(counts: &[usize], draws: usize) -> Vec<usize> {
    let total: usize = counts.iter().sum();
    let mut allotted: Vec<usize> = counts.iter().map(|&c| c * draws / total).collect();
    let mut remaining = draws - allotted.iter().sum::<usize>();
    let mut remainders: Vec<(usize, usize)> = counts
        .iter()
        .enumerate()
        .map(|(class, &c)| (class, (c * draws) % total))
        .collect();
    remainders.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    for (class, _) in remainders {
        if remaining == 0 {
            break;
        }
        if allotted[class] < counts[class] {
            allotted[class] += 1;
            remaining -= 1;
        }
    }
    allotted
}

fn splits_from_assignment(fold_of: &[usize], n_splits: usize) -> Vec<Split> {
    (0..n_splits)
        .map(|fold| {
            let (validation, train): (Vec<usize>, Vec<usize>) =
                (0..fold_of.len()).partition(|&idx| fold_of[idx] == fold);
            Split { train, validation }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    /// 30% observed, interleaved.
    fn strata(n: usize) -> Vec<bool> {
        (0..n).map(|i| i % 10 < 3).collect()
    }

    fn observed_ratio(strata: &[bool], indices: &[usize]) -> f64 {
        indices.iter().filter(|&&i| strata[i]).count() as f64 / indices.len() as f64
    }

    #[test]
    fn folds_are_disjoint_and_cover_the_pool() {
        let labels = strata(97);
        let splits = stratified_kfold(&labels, 5, 3).unwrap();
        assert_eq!(splits.len(), 5);

        let mut seen_validation = HashSet::new();
        for split in &splits {
            let train: HashSet<_> = split.train.iter().copied().collect();
            let validation: HashSet<_> = split.validation.iter().copied().collect();
            assert!(train.is_disjoint(&validation));
            assert_eq!(train.len() + validation.len(), labels.len());
            for idx in &split.validation {
                assert!(seen_validation.insert(*idx), "sample {idx} validated twice");
            }
        }
        assert_eq!(seen_validation.len(), labels.len());
    }

    #[test]
    fn folds_preserve_the_event_ratio() {
        let labels = strata(200);
        let pool_ratio = observed_ratio(&labels, &(0..200).collect::<Vec<_>>());
        for split in stratified_kfold(&labels, 5, 0).unwrap() {
            let ratio = observed_ratio(&labels, &split.validation);
            assert!((ratio - pool_ratio).abs() < 0.03, "ratio {ratio} vs {pool_ratio}");
        }
    }

    #[test]
    fn identical_seeds_reproduce_identical_folds() {
        let labels = strata(60);
        assert_eq!(
            stratified_kfold(&labels, 4, 7).unwrap(),
            stratified_kfold(&labels, 4, 7).unwrap()
        );
        assert_ne!(
            stratified_kfold(&labels, 4, 7).unwrap(),
            stratified_kfold(&labels, 4, 8).unwrap()
        );
    }

    #[test]
    fn holdout_takes_twenty_percent_per_class() {
        let labels = strata(100);
        let split = stratified_holdout(&labels, 0.2, 0).unwrap();
        assert_eq!(split.validation.len(), 20);
        assert_eq!(split.train.len(), 80);
        assert_eq!(split.validation.iter().filter(|&&i| labels[i]).count(), 6);
        assert_eq!(split, stratified_holdout(&labels, 0.2, 0).unwrap());
    }

    #[test]
    fn plain_kfold_is_contiguous() {
        let splits = kfold(7, 3).unwrap();
        assert_eq!(splits[0].validation, vec![0, 1, 2]);
        assert_eq!(splits[1].validation, vec![3, 4]);
        assert_eq!(splits[2].validation, vec![5, 6]);
        assert_eq!(splits[2].train, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn fold_count_is_validated() {
        assert_eq!(kfold(5, 1).unwrap_err(), SplitError::InvalidFoldCount(1));
        assert!(matches!(
            stratified_kfold(&strata(3), 5, 0).unwrap_err(),
            SplitError::TooFewSamples { .. }
        ));
    }
}
