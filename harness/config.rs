//! Run configuration: resolved directory paths from a TOML file, plus the
//! fixed benchmark tunables.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const N_REPEATS: usize = 5;
pub const N_SPLITS: usize = 5;
pub const N_ITER: usize = 10;
pub const HOLDOUT_FRACTION: f64 = 0.2;
pub const HOLDOUT_SEED: u64 = 0;
pub const SEARCH_SEED: u64 = 0;
pub const SEARCH_WORKERS: usize = N_ITER;

/// Environment variable naming an explicit configuration file.
pub const CONFIG_ENV_VAR: &str = "SURVBENCH_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "survbench.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse TOML configuration file '{path}': {source}")]
    TomlParse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub processed_data_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub dataset_file: String,
    pub event_column: String,
    pub time_column: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            processed_data_dir: PathBuf::from("data/processed"),
            reports_dir: PathBuf::from("reports"),
            dataset_file: "home_care_ma.csv".to_string(),
            event_column: "Observed".to_string(),
            time_column: "Weeks".to_string(),
        }
    }
}

impl AppConfig {
    /// `$SURVBENCH_CONFIG` if set, else `survbench.toml` when present, else defaults.
    pub fn resolve() -> Result<Self, ConfigError> {
        if let Some(path) = std::env::var_os(CONFIG_ENV_VAR) {
            return Self::load(Path::new(&path));
        }
        let local = Path::new(DEFAULT_CONFIG_FILE);
        if local.is_file() {
            return Self::load(local);
        }
        log::debug!("No configuration file found; using built-in defaults");
        Ok(Self::default())
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = toml::from_str(&text).map_err(|source| ConfigError::TomlParse {
            path: path.to_path_buf(),
            source,
        })?;
        log::info!("Loaded configuration from '{}'", path.display());
        Ok(config)
    }

    pub fn dataset_path(&self) -> PathBuf {
        self.processed_data_dir.join(&self.dataset_file)
    }
}

/// Benchmark tunables. `Default` gives the production constants.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunSettings {
    pub n_repeats: usize,
    pub n_splits: usize,
    pub n_iter: usize,
    pub holdout_fraction: f64,
    pub holdout_seed: u64,
    pub search_seed: u64,
    pub search_workers: usize,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            n_repeats: N_REPEATS,
            n_splits: N_SPLITS,
            n_iter: N_ITER,
            holdout_fraction: HOLDOUT_FRACTION,
            holdout_seed: HOLDOUT_SEED,
            search_seed: SEARCH_SEED,
            search_workers: SEARCH_WORKERS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn partial_files_fall_back_to_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "reports_dir = \"out/reports\"\ntime_column = \"Days\"").unwrap();
        let config = AppConfig::load(file.path()).unwrap();
        assert_eq!(config.reports_dir, PathBuf::from("out/reports"));
        assert_eq!(config.time_column, "Days");
        assert_eq!(config.event_column, "Observed");
        assert_eq!(
            config.dataset_path(),
            PathBuf::from("data/processed/home_care_ma.csv")
        );
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "report_dir = \"typo\"").unwrap();
        assert!(matches!(
            AppConfig::load(file.path()),
            Err(ConfigError::TomlParse { .. })
        ));
    }

    #[test]
    fn default_settings_use_the_fixed_constants() {
        let settings = RunSettings::default();
        assert_eq!((settings.n_repeats, settings.n_splits, settings.n_iter), (5, 5, 10));
        assert_eq!(settings.search_workers, settings.n_iter);
    }
}
