//! Median/IQR feature scaling fitted on a fold's training partition only.

use crate::types::{FeatureFrame, FrameError};
use ndarray::{Array1, Array2, Axis, Zip};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ScaleError {
    #[error("cannot fit a scaler on zero rows")]
    EmptyTrainingData,
    #[error("scaler was fitted on columns {expected:?} but received {found:?}")]
    ColumnMismatch {
        expected: Vec<String>,
        found: Vec<String>,
    },
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Centres each column on its median and divides by its interquartile range.
/// Columns with zero IQR keep a unit scale.
#[derive(Debug, Clone, PartialEq)]
pub struct RobustScaler {
    columns: Vec<String>,
    center: Array1<f64>,
    scale: Array1<f64>,
}

impl RobustScaler {
    pub fn fit(train: &FeatureFrame) -> Result<Self, ScaleError> {
        if train.n_rows() == 0 {
            return Err(ScaleError::EmptyTrainingData);
        }
        let n_cols = train.n_cols();
        let mut center = Array1::zeros(n_cols);
        let mut scale = Array1::ones(n_cols);
        for (j, column) in train.values().axis_iter(Axis(1)).enumerate() {
            let mut sorted = column.to_vec();
            sorted.sort_by(f64::total_cmp);
            center[j] = quantile_sorted(&sorted, 0.5);
            let iqr = quantile_sorted(&sorted, 0.75) - quantile_sorted(&sorted, 0.25);
            if iqr > 0.0 && iqr.is_finite() {
                scale[j] = iqr;
            }
        }
        Ok(Self {
            columns: train.names().to_vec(),
            center,
            scale,
        })
    }

    pub fn transform(&self, frame: &FeatureFrame) -> Result<FeatureFrame, ScaleError> {
        if frame.names() != self.columns.as_slice() {
            return Err(ScaleError::ColumnMismatch {
                expected: self.columns.clone(),
                found: frame.names().to_vec(),
            });
        }
        let mut values: Array2<f64> = frame.values().clone();
        for mut row in values.axis_iter_mut(Axis(0)) {
            Zip::from(&mut row)
                .and(&self.center)
                .and(&self.scale)
                .for_each(|v, &c, &s| *v = (*v - c) / s);
        }
        Ok(FeatureFrame::new(self.columns.clone(), values)?)
    }

    #[inline]
    pub fn center(&self) -> &Array1<f64> {
        &self.center
    }

    #[inline]
    pub fn scale(&self) -> &Array1<f64> {
        &self.scale
    }
}

/// Linear-interpolated quantile of an ascending slice. `q` in [0, 1].
pub fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    match sorted.len() {
        0 => f64::NAN,
        1 => sorted[0],
        n => {
            let position = q.clamp(0.0, 1.0) * (n - 1) as f64;
            let lower = position.floor() as usize;
            let upper = position.ceil() as usize;
            let weight = position - lower as f64;
            sorted[lower] + weight * (sorted[upper] - sorted[lower])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn frame(values: Array2<f64>) -> FeatureFrame {
        let names = (0..values.ncols()).map(|j| format!("f{j}")).collect();
        FeatureFrame::new(names, values).unwrap()
    }

    #[test]
    fn quantiles_interpolate_linearly() {
        let sorted = [1.0, 2.0, 3.0, 4.0];
        assert_abs_diff_eq!(quantile_sorted(&sorted, 0.5), 2.5);
        assert_abs_diff_eq!(quantile_sorted(&sorted, 0.25), 1.75);
        assert_abs_diff_eq!(quantile_sorted(&sorted, 0.75), 3.25);
    }

    #[test]
    fn columns_are_centered_on_median_and_scaled_by_iqr() {
        let train = frame(array![[1.0, 5.0], [2.0, 5.0], [3.0, 5.0], [4.0, 5.0], [100.0, 5.0]]);
        let scaler = RobustScaler::fit(&train).unwrap();
        assert_abs_diff_eq!(scaler.center()[0], 3.0);
        assert_abs_diff_eq!(scaler.scale()[0], 2.0);
        // A constant column keeps unit scale.
        assert_abs_diff_eq!(scaler.scale()[1], 1.0);

        let scaled = scaler.transform(&train).unwrap();
        assert_abs_diff_eq!(scaled.values()[[0, 0]], -1.0);
        assert_abs_diff_eq!(scaled.values()[[4, 0]], 48.5);
        assert_abs_diff_eq!(scaled.values()[[2, 1]], 0.0);
    }

    #[test]
    fn parameters_depend_only_on_the_training_partition() {
        let train = frame(array![[0.0], [1.0], [2.0], [3.0]]);
        let validation = frame(array![[50.0], [60.0], [70.0], [80.0]]);
        let mut pooled = train.values().clone();
        pooled.append(Axis(0), validation.values().view()).unwrap();

        let on_train = RobustScaler::fit(&train).unwrap();
        let on_pool = RobustScaler::fit(&frame(pooled)).unwrap();
        assert_ne!(on_train, on_pool);

        // Transforming validation data leaves the fitted parameters untouched.
        let before = on_train.clone();
        let scaled = on_train.transform(&validation).unwrap();
        assert_eq!(on_train, before);
        assert_abs_diff_eq!(scaled.values()[[0, 0]], (50.0 - 1.5) / 1.5);
    }

    #[test]
    fn mismatched_columns_are_rejected() {
        let scaler = RobustScaler::fit(&frame(array![[1.0, 2.0]])).unwrap();
        let other = FeatureFrame::new(vec!["x".into(), "y".into()], array![[1.0, 2.0]]).unwrap();
        assert!(matches!(
            scaler.transform(&other),
            Err(ScaleError::ColumnMismatch { .. })
        ));
    }
}
