use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs;
use survbench::catalog::cox::Cph;
use survbench::catalog::selectors::{LowVar, NoneSelector, RegMrmr, Rfe, SelectKBest};
use survbench::catalog::weibull::WeibullAft;
use survbench::catalog::xgb::XgbLinear;
use survbench::catalog::{FeatureSelector, ModelBuilder};
use survbench::config::{AppConfig, RunSettings};
use survbench::data::Dataset;
use survbench::orchestrator::{self, Orchestrator};
use survbench::progress::NoopProgress;
use survbench::record::{self, CandidateStatus, CsvReportWriter, MemoryWriter, ResultRecord};
use survbench::types::{FeatureFrame, SurvivalOutcome};
use tempfile::tempdir;

const N_SAMPLES: usize = 100;
const FEATURES: [&str; 4] = ["age", "visits", "score", "noise"];

/// Weekly event times driven by the first two features, roughly a quarter censored.
fn cohort() -> Dataset {
    synthetic_cohort(&FEATURES, 0.75, 7)
}

fn synthetic_cohort(features: &[&str], event_rate: f64, seed: u64) -> Dataset {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut values: Array2<f64> = Array2::zeros((N_SAMPLES, features.len()));
    let mut time = Array1::zeros(N_SAMPLES);
    let mut event = Array1::from_elem(N_SAMPLES, true);
    for i in 0..N_SAMPLES {
        for j in 0..features.len() {
            values[[i, j]] = rng.gen_range(-1.5..1.5);
        }
        let hazard = (0.9 * values[[i, 0]] - 0.5 * values[[i, 1]]).exp();
        let u: f64 = rng.gen_range(1e-6..1.0);
        time[i] = (-u.ln() * 30.0 / hazard).ceil().min(200.0);
        event[i] = rng.gen_bool(event_rate);
    }
    Dataset {
        features: FeatureFrame::new(features.iter().map(|s| s.to_string()).collect(), values)
            .unwrap(),
        outcome: SurvivalOutcome::new(event, time).unwrap(),
    }
}

fn small_settings() -> RunSettings {
    RunSettings {
        n_repeats: 1,
        n_splits: 2,
        n_iter: 1,
        search_workers: 1,
        ..RunSettings::default()
    }
}

fn run_in_memory(
    models: Vec<Box<dyn ModelBuilder>>,
    selectors: Vec<Box<dyn FeatureSelector>>,
    settings: RunSettings,
) -> MemoryWriter {
    let orchestrator = Orchestrator::new(models, selectors, settings).unwrap();
    let mut writer = MemoryWriter::default();
    orchestrator
        .run(&cohort(), &mut writer, &mut NoopProgress)
        .unwrap();
    writer
}

#[test]
fn one_model_one_selector_yields_a_row_per_fold() {
    let writer = run_in_memory(vec![Box::new(Cph)], vec![Box::new(NoneSelector)], small_settings());

    assert_eq!(writer.tables.len(), 1);
    let (model, rows) = &writer.tables[0];
    assert_eq!(model, "CPH");
    assert_eq!(rows.len(), 2);
    for row in rows {
        assert_eq!(row.model_name, "(1) CPH");
        assert_eq!(row.selector_name, "(1) None");
        assert_eq!(row.repeat, 0);
        assert_eq!(row.status, CandidateStatus::Evaluated);
        let ci = row.ci.unwrap();
        assert!((0.0..=1.0).contains(&ci), "CI {ci}");
        let ctd = row.ctd.unwrap();
        assert!((0.0..=1.0).contains(&ctd), "CTD {ctd}");
        let brier = row.brier.unwrap();
        assert!((0.0..=1.0).contains(&brier), "BS {brier}");
        assert!(row.timings.total.is_some());
        assert_eq!(row.selected_features.len(), FEATURES.len());
        assert!(row.best_params.contains_key("alpha"));
    }
}

#[test]
fn sparse_events_scenario_reports_two_folds() {
    let features: Vec<String> = (0..10).map(|j| format!("f{j}")).collect();
    let names: Vec<&str> = features.iter().map(String::as_str).collect();
    let dataset = synthetic_cohort(&names, 0.3, 11);

    let orchestrator =
        Orchestrator::new(vec![Box::new(Cph)], vec![Box::new(NoneSelector)], small_settings())
            .unwrap();
    let mut writer = MemoryWriter::default();
    orchestrator
        .run(&dataset, &mut writer, &mut NoopProgress)
        .unwrap();

    let rows = &writer.tables[0].1;
    assert_eq!(rows.len(), 2);
    for row in rows {
        let ci = row.ci.unwrap();
        assert!((0.0..=1.0).contains(&ci), "CI {ci}");
        assert!(row.timings.total.unwrap().as_secs_f64() >= 0.0);
    }
}

#[test]
fn incompatible_pairings_are_skipped_but_still_recorded() {
    let selectors: Vec<Box<dyn FeatureSelector>> = vec![
        Box::new(NoneSelector),
        Box::new(LowVar::default()),
        Box::new(SelectKBest::new("SelectKBest2", 2)),
        Box::new(Rfe::new("RFE2", 2)),
        Box::new(RegMrmr::new("RegMRMR2", 2)),
    ];
    let writer = run_in_memory(vec![Box::new(WeibullAft)], selectors, small_settings());
    let rows = &writer.tables[0].1;
    assert_eq!(rows.len(), 10);

    let by_selector = |label: &str| -> Vec<&ResultRecord> {
        rows.iter().filter(|r| r.selector_name == label).collect()
    };
    for label in ["(1) None", "(2) LowVar", "(4) RFE2"] {
        let skipped = by_selector(label);
        assert_eq!(skipped.len(), 2, "{label}");
        for row in skipped {
            assert_eq!(row.status, CandidateStatus::Skipped);
            assert!(row.ci.is_none() && row.ctd.is_none() && row.brier.is_none());
            assert!(row.timings.total.is_none());
            assert!(row.best_params.is_empty());
            assert!(row.selected_features.is_empty());
        }
    }
    for label in ["(3) SelectKBest2", "(5) RegMRMR2"] {
        for row in by_selector(label) {
            assert_eq!(row.status, CandidateStatus::Evaluated);
            assert_eq!(row.selected_features.len(), 2);
            assert!(row.ci.is_some());
        }
    }
}

#[test]
fn tables_are_rectangular_across_models() {
    let selectors: Vec<Box<dyn FeatureSelector>> = vec![
        Box::new(NoneSelector),
        Box::new(SelectKBest::new("SelectKBest2", 2)),
    ];
    let settings = RunSettings {
        n_repeats: 2,
        ..small_settings()
    };
    let writer = run_in_memory(
        vec![Box::new(Cph), Box::new(WeibullAft), Box::new(XgbLinear)],
        selectors,
        settings,
    );
    assert_eq!(writer.tables.len(), 3);
    let selector_columns: Vec<Vec<(String, usize)>> = writer
        .tables
        .iter()
        .map(|(_, rows)| {
            rows.iter()
                .map(|r| (r.selector_name.clone(), r.repeat))
                .collect()
        })
        .collect();
    for column in &selector_columns {
        assert_eq!(column.len(), 2 * 2 * 2);
        assert_eq!(column, &selector_columns[0]);
    }
    // Gradient-boosted Cox margins carry no survival curves.
    assert!(writer.tables[2].1.iter().all(|r| r.brier.is_none()));
}

fn read_report(path: &std::path::Path) -> (Vec<String>, Vec<Vec<String>>) {
    let mut reader = csv::Reader::from_path(path).unwrap();
    let headers = reader.headers().unwrap().iter().map(String::from).collect();
    let rows = reader
        .records()
        .map(|r| r.unwrap().iter().map(String::from).collect())
        .collect();
    (headers, rows)
}

#[test]
fn repeated_runs_write_identical_reports_apart_from_timings() {
    let first = tempdir().unwrap();
    let second = tempdir().unwrap();
    for dir in [first.path(), second.path()] {
        let orchestrator = Orchestrator::new(
            vec![Box::new(Cph)],
            vec![Box::new(SelectKBest::new("SelectKBest2", 2))],
            small_settings(),
        )
        .unwrap();
        let mut writer = CsvReportWriter::new(dir).unwrap();
        orchestrator
            .run(&cohort(), &mut writer, &mut NoopProgress)
            .unwrap();
    }

    let (headers, rows_a) = read_report(&record::report_path(first.path(), "CPH"));
    let (_, rows_b) = read_report(&record::report_path(second.path(), "CPH"));
    assert_eq!(rows_a.len(), 2);
    let stable: Vec<usize> = headers
        .iter()
        .enumerate()
        .filter(|(_, h)| !h.starts_with('T'))
        .map(|(idx, _)| idx)
        .collect();
    assert_eq!(stable.len(), 8);
    for (a, b) in rows_a.iter().zip(&rows_b) {
        for &idx in &stable {
            assert_eq!(a[idx], b[idx], "column {}", headers[idx]);
        }
    }
}

#[test]
fn full_catalog_writes_one_report_per_model() {
    let workspace = tempdir().unwrap();
    let data_dir = workspace.path().join("processed");
    fs::create_dir_all(&data_dir).unwrap();

    let dataset = cohort();
    let mut file = csv::Writer::from_path(data_dir.join("cohort.csv")).unwrap();
    let mut header: Vec<String> = FEATURES.iter().map(|s| s.to_string()).collect();
    header.extend(["Observed".to_string(), "Weeks".to_string()]);
    file.write_record(&header).unwrap();
    for i in 0..dataset.n_samples() {
        let mut row: Vec<String> = dataset
            .features
            .values()
            .row(i)
            .iter()
            .map(|v| v.to_string())
            .collect();
        row.push(u8::from(dataset.outcome.event()[i]).to_string());
        row.push(dataset.outcome.time()[i].to_string());
        file.write_record(&row).unwrap();
    }
    file.flush().unwrap();

    let config = AppConfig {
        processed_data_dir: data_dir,
        reports_dir: workspace.path().join("reports"),
        dataset_file: "cohort.csv".to_string(),
        ..AppConfig::default()
    };
    orchestrator::run_benchmark(&config, small_settings(), &mut NoopProgress).unwrap();

    let models = survbench::catalog::default_models();
    let n_selectors = survbench::catalog::default_selectors().len();
    for model in &models {
        let path = record::report_path(&config.reports_dir, model.name());
        let (headers, rows) = read_report(&path);
        assert_eq!(headers[0], "ModelName");
        assert_eq!(headers.len(), 14);
        assert_eq!(rows.len(), n_selectors * 2, "{}", model.name());
    }
}
