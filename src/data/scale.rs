/*!
Input data scaling

Scalers are fitted on training rows only and then applied unchanged to validation, test and
live rows, so no statistic of the future leaks into the past.
*/
use crate::error::{Error, Result};
use crate::features::FeatureRow;
use crate::{CpuFloat, GpuFloat};
use num::{Float, NumCast};
use serde::{Deserialize, Serialize};

/// Clip a value within an absolute value range
pub fn clip<F: Copy + Float>(value: F, range: F) -> F {
    value.max(-range).min(range)
}

/// Standardizes a column to zero mean and unit variance
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler<F = CpuFloat> {
    /// The mean of the fitted data
    pub mean: F,
    /// The (population) standard deviation of the fitted data
    pub std: F,
    /// Scaled values are clipped to this many standard deviations
    pub clip: F,
}

impl<F> StandardScaler<F>
where
    F: Copy + Float,
{
    /// Fit a scaler to a set of values, ignoring NaN and Inf
    ///
    /// Returns `None` if there are no finite values.
    pub fn fit<I: IntoIterator<Item = F>>(values: I) -> Option<StandardScaler<F>> {
        let mut n = F::zero();
        let mut mean = F::zero();
        let mut m2 = F::zero();
        // Welford's online update
        for value in values.into_iter().filter(|v| v.is_finite()) {
            n = n + F::one();
            let delta = value - mean;
            mean = mean + delta / n;
            m2 = m2 + delta * (value - mean);
        }
        if n == F::zero() {
            return None;
        }
        Some(StandardScaler {
            mean,
            std: (m2 / n).sqrt(),
            clip: NumCast::from(10.0).unwrap_or_else(F::max_value),
        })
    }
    /// Scale a value
    #[inline]
    pub fn transform(&self, value: F) -> F {
        // Return 0 for NaN and Inf
        if !value.is_finite() {
            return F::zero();
        }
        if self.std == F::zero() {
            return F::zero();
        }
        clip((value - self.mean) / self.std, self.clip)
    }
    /// Undo scaling
    #[inline]
    pub fn inverse(&self, scaled: F) -> F {
        scaled * self.std + self.mean
    }
}

/// The scalers for every feature column and for the price targets of a feature table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableScaler {
    /// One scaler per feature column
    pub features: Vec<StandardScaler>,
    /// The scaler for target prices
    pub target: StandardScaler,
}

impl TableScaler {
    /// Fit the scalers on a set of (training) rows
    pub fn fit<'a, I>(rows: I) -> Result<TableScaler>
    where
        I: IntoIterator<Item = &'a FeatureRow>,
    {
        let rows: Vec<&FeatureRow> = rows.into_iter().collect();
        let width = rows
            .first()
            .map(|row| row.values.len())
            .ok_or_else(|| Error::InsufficientData("no rows to fit scalers on".into()))?;
        let mut features = Vec::with_capacity(width);
        for column in 0..width {
            let scaler = StandardScaler::fit(rows.iter().map(|row| row.values[column]))
                .ok_or_else(|| {
                    Error::InsufficientData(format!("feature column {} has no finite values", column))
                })?;
            features.push(scaler);
        }
        let target = StandardScaler::fit(
            rows.iter()
                .filter_map(|row| row.targets.as_ref())
                .flat_map(|targets| targets.iter().copied()),
        )
        .ok_or_else(|| Error::InsufficientData("no training targets to fit scaler on".into()))?;
        Ok(TableScaler { features, target })
    }
    /// Scale a row of feature values
    pub fn scale_features(&self, values: &[CpuFloat]) -> Vec<GpuFloat> {
        values
            .iter()
            .zip(&self.features)
            .map(|(value, scaler)| scaler.transform(*value) as GpuFloat)
            .collect()
    }
    /// Scale a vector of target prices
    pub fn scale_targets(&self, targets: &[CpuFloat]) -> Vec<GpuFloat> {
        targets
            .iter()
            .map(|target| self.target.transform(*target) as GpuFloat)
            .collect()
    }
    /// Convert scaled network outputs back into prices
    pub fn unscale_targets(&self, scaled: &[GpuFloat]) -> Vec<CpuFloat> {
        scaled
            .iter()
            .map(|value| self.target.inverse(*value as CpuFloat))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_scaler_matches_population_stats() {
        let scaler = StandardScaler::fit(vec![2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]).unwrap();
        assert!((scaler.mean - 5.0).abs() < 1e-12);
        assert!((scaler.std - 2.0).abs() < 1e-12);
        assert!((scaler.transform(9.0) - 2.0).abs() < 1e-12);
        assert!((scaler.inverse(-1.5) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn degenerate_inputs_scale_to_zero() {
        let constant = StandardScaler::fit(vec![3.0_f64; 5]).unwrap();
        assert_eq!(constant.transform(3.0), 0.0);
        assert_eq!(constant.transform(100.0), 0.0);
        let scaler = StandardScaler::fit(vec![1.0_f64, f64::NAN, 3.0]).unwrap();
        assert_eq!(scaler.mean, 2.0);
        assert_eq!(scaler.transform(f64::INFINITY), 0.0);
        assert!(StandardScaler::<f64>::fit(vec![f64::NAN]).is_none());
    }

    #[test]
    fn outliers_are_clipped() {
        let scaler = StandardScaler::fit(vec![-1.0_f64, 1.0]).unwrap();
        assert_eq!(scaler.transform(1e6), 10.0);
        assert_eq!(scaler.transform(-1e6), -10.0);
    }
}
