use crate::record::{CandidateStatus, ResultRecord};
use std::io::{self, Write};

/// Observer for reporting benchmark progress as candidates finish.
pub trait RunObserver {
    fn on_run_start(&mut self, n_models: usize, n_selectors: usize, n_samples: usize) {
        let _ = (n_models, n_selectors, n_samples);
    }
    fn on_candidate_finished(&mut self, record: &ResultRecord) {
        let _ = record;
    }
    fn on_model_finished(&mut self, model_name: &str, n_records: usize) {
        let _ = (model_name, n_records);
    }
}

#[derive(Default)]
pub struct NoopProgress;

impl RunObserver for NoopProgress {}

/// Prints one line per event to stdout, flushing each so the last completed
/// candidate stays visible after an abort.
#[derive(Default)]
pub struct ConsoleProgress;

impl ConsoleProgress {
    fn emit(&self, line: &str) {
        let mut stdout = io::stdout().lock();
        // A closed stdout must not abort the run.
        let _ = writeln!(stdout, "{line}");
        let _ = stdout.flush();
    }
}

impl RunObserver for ConsoleProgress {
    fn on_run_start(&mut self, n_models: usize, n_selectors: usize, n_samples: usize) {
        self.emit(&format!(
            "Started evaluation of {n_models} models/{n_selectors} ft selectors/{n_samples} total samples"
        ));
    }

    fn on_candidate_finished(&mut self, record: &ResultRecord) {
        self.emit(&candidate_line(record));
    }

    fn on_model_finished(&mut self, model_name: &str, n_records: usize) {
        log::info!("Finished {model_name} with {n_records} records");
    }
}

/// Three-decimal rounding; missing values print as `nan`.
pub fn format_metric(value: Option<f64>) -> String {
    match value {
        Some(v) if v.is_finite() => format!("{:.3}", v),
        _ => "nan".to_string(),
    }
}

pub fn candidate_line(record: &ResultRecord) -> String {
    match record.status {
        CandidateStatus::Skipped => format!(
            "Skipped {} - {} (unsupported pairing)",
            record.model_name, record.selector_name
        ),
        CandidateStatus::Evaluated => format!(
            "Evaluated {} - {} - CI={} - CTD={} - BS={} - T={}",
            record.model_name,
            record.selector_name,
            format_metric(record.ci),
            format_metric(record.ctd),
            format_metric(record.brier),
            format_metric(record.timings.total.map(|d| d.as_secs_f64())),
        ),
    }
}
