// ========================================================================================
//
//                 SURVBENCH EVALUATION METRIC BENCHMARK
//
// ========================================================================================
//
// Measures the validation-fold metrics on synthetic cohorts of increasing size. The
// concordance routines are quadratic in the number of samples; the Brier score is
// linear in samples times grid points.
//
// ========================================================================================

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use survbench::metrics;
use survbench::types::SurvivalOutcome;

const COHORT_SIZES: [usize; 3] = [200, 1_000, 4_000];

/// Exponential-ish event times driven by a single risk score, about 30% censored.
fn synthetic_cohort(n: usize) -> (SurvivalOutcome, Array1<f64>) {
    let mut rng = StdRng::seed_from_u64(42);
    let risk: Array1<f64> = (0..n).map(|_| rng.gen_range(-2.0..2.0)).collect();
    let time: Array1<f64> = risk
        .iter()
        .map(|r| {
            let u: f64 = rng.gen_range(1e-6..1.0);
            (-u.ln() * 50.0 * (-r).exp()).ceil()
        })
        .collect();
    let event: Array1<bool> = (0..n).map(|_| rng.gen_bool(0.7)).collect();
    let outcome = SurvivalOutcome::new(event, time).expect("synthetic cohort is valid");
    (outcome, risk)
}

fn bench_concordance(c: &mut Criterion) {
    let mut group = c.benchmark_group("concordance");
    for &n in &COHORT_SIZES {
        let (outcome, risk) = synthetic_cohort(n);
        group.bench_with_input(BenchmarkId::new("harrell", n), &n, |b, _| {
            b.iter(|| metrics::concordance_index_censored(black_box(&outcome), risk.view()))
        });
        group.bench_with_input(BenchmarkId::new("uno_ipcw", n), &n, |b, _| {
            b.iter(|| {
                metrics::concordance_index_ipcw(black_box(&outcome), &outcome, risk.view())
            })
        });
    }
    group.finish();
}

fn bench_brier(c: &mut Criterion) {
    let mut group = c.benchmark_group("approx_brier");
    for &n in &COHORT_SIZES {
        let (outcome, risk) = synthetic_cohort(n);
        let grid = metrics::brier_time_grid(outcome.time().view()).expect("non-empty cohort");
        let curves = Array2::from_shape_fn((n, grid.len()), |(i, k)| {
            (-grid[k] / 50.0 * risk[i].exp()).exp()
        });
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, _| {
            b.iter(|| metrics::approx_brier_score(black_box(&outcome), &grid, &curves))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_concordance, bench_brier);
criterion_main!(benches);
