/*!
Regression and directional metrics, in price units
*/
use crate::error::{Error, Result};
use crate::util::{round_to, safe_div};
use itertools::izip;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Evaluation metrics for a set of predictions
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    /// Mean squared error
    pub mse: f64,
    /// Root mean squared error
    pub rmse: f64,
    /// Mean absolute error
    pub mae: f64,
    /// Coefficient of determination
    pub r2: f64,
    /// Mean absolute percentage error, in percent, over nonzero actual values
    pub mape: f64,
    /// Percentage of nonzero moves whose direction was predicted correctly
    pub directional_accuracy: f64,
    /// The number of predictions evaluated
    pub samples: usize,
}

impl fmt::Display for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "RMSE {:.4}, MAE {:.4}, R² {:.4}, MAPE {:.2}%, direction {:.1}% ({} samples)",
            self.rmse, self.mae, self.r2, self.mape, self.directional_accuracy, self.samples
        )
    }
}

impl Metrics {
    /// Whether every value is finite
    pub fn is_finite(&self) -> bool {
        [
            self.mse,
            self.rmse,
            self.mae,
            self.r2,
            self.mape,
            self.directional_accuracy,
        ]
        .iter()
        .all(|v| v.is_finite())
    }
    /// A copy with every value rounded to four decimal places, for reports
    pub fn rounded(&self) -> Metrics {
        Metrics {
            mse: round_to(self.mse, 4),
            rmse: round_to(self.rmse, 4),
            mae: round_to(self.mae, 4),
            r2: round_to(self.r2, 4),
            mape: round_to(self.mape, 4),
            directional_accuracy: round_to(self.directional_accuracy, 4),
            samples: self.samples,
        }
    }
}

/// Evaluate predictions against actual values
///
/// Directions are measured against `reference`, the last price known when each prediction was
/// made. Samples where the actual price did not move are left out of the directional accuracy.
pub fn evaluate(actual: &[f64], predicted: &[f64], reference: &[f64]) -> Result<Metrics> {
    if actual.len() != predicted.len() || actual.len() != reference.len() {
        return Err(Error::InsufficientData(format!(
            "mismatched lengths: {} actual, {} predicted, {} reference",
            actual.len(),
            predicted.len(),
            reference.len()
        )));
    }
    if actual.is_empty() {
        return Err(Error::InsufficientData("no predictions to evaluate".into()));
    }
    let n = actual.len() as f64;
    let mean = actual.iter().sum::<f64>() / n;

    let mut squared = 0.0;
    let mut absolute = 0.0;
    let mut total = 0.0;
    let mut percent = 0.0;
    let mut nonzero = 0usize;
    let mut moves = 0usize;
    let mut hits = 0usize;
    for (&a, &p, &r) in izip!(actual, predicted, reference) {
        let err = p - a;
        squared += err * err;
        absolute += err.abs();
        total += (a - mean) * (a - mean);
        if a != 0.0 {
            percent += (err / a).abs();
            nonzero += 1;
        }
        let actual_move = (a - r).signum();
        if a != r {
            moves += 1;
            if (p - r).signum() == actual_move && p != r {
                hits += 1;
            }
        }
    }

    let mse = squared / n;
    let r2 = if total == 0.0 {
        if squared == 0.0 {
            1.0
        } else {
            0.0
        }
    } else {
        1.0 - squared / total
    };
    Ok(Metrics {
        mse,
        rmse: mse.sqrt(),
        mae: absolute / n,
        r2,
        mape: safe_div(percent * 100.0, nonzero as f64, 0.0),
        directional_accuracy: safe_div(hits as f64 * 100.0, moves as f64, 0.0),
        samples: actual.len(),
    })
}

/// Average a set of metrics, weighting each equally
pub fn mean(metrics: &[Metrics]) -> Option<Metrics> {
    if metrics.is_empty() {
        return None;
    }
    let n = metrics.len() as f64;
    let avg = |f: fn(&Metrics) -> f64| metrics.iter().map(f).sum::<f64>() / n;
    Some(Metrics {
        mse: avg(|m| m.mse),
        rmse: avg(|m| m.rmse),
        mae: avg(|m| m.mae),
        r2: avg(|m| m.r2),
        mape: avg(|m| m.mape),
        directional_accuracy: avg(|m| m.directional_accuracy),
        samples: metrics.iter().map(|m| m.samples).sum(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn perfect_predictions() {
        let actual = [10.0, 11.0, 9.0, 12.0];
        let reference = [10.5, 10.0, 11.0, 9.0];
        let m = evaluate(&actual, &actual, &reference).unwrap();
        assert_eq!(m.mse, 0.0);
        assert_eq!(m.r2, 1.0);
        assert_eq!(m.mape, 0.0);
        assert_eq!(m.directional_accuracy, 100.0);
        assert_eq!(m.samples, 4);
    }

    #[test]
    fn known_errors() {
        let actual = [100.0, 110.0];
        let predicted = [110.0, 100.0];
        let reference = [105.0, 105.0];
        let m = evaluate(&actual, &predicted, &reference).unwrap();
        assert_eq!(m.mse, 100.0);
        assert_eq!(m.rmse, 10.0);
        assert_eq!(m.mae, 10.0);
        // Variance of actuals is 25 per sample, so R² = 1 - 200/50
        assert_eq!(m.r2, -3.0);
        assert!((m.mape - (10.0 + 100.0 / 11.0) / 2.0).abs() < 1e-9);
        assert_eq!(m.directional_accuracy, 0.0);
    }

    #[test]
    fn flat_moves_are_not_counted() {
        let actual = [1.0, 2.0, 3.0];
        let predicted = [1.5, 2.5, 2.0];
        let reference = [1.0, 1.0, 2.0];
        let m = evaluate(&actual, &predicted, &reference).unwrap();
        // The first actual did not move, the second was called, the third was missed
        assert_eq!(m.directional_accuracy, 50.0);
    }

    #[test]
    fn degenerate_inputs() {
        let m = evaluate(&[5.0, 5.0], &[4.0, 6.0], &[5.0, 5.0]).unwrap();
        assert_eq!(m.r2, 0.0);
        assert_eq!(m.directional_accuracy, 0.0);
        let zeros = evaluate(&[0.0, 0.0], &[1.0, 1.0], &[1.0, 1.0]).unwrap();
        assert_eq!(zeros.mape, 0.0);
        assert!(evaluate(&[], &[], &[]).is_err());
        assert!(evaluate(&[1.0], &[1.0, 2.0], &[1.0]).is_err());
    }

    #[test]
    fn means_weight_folds_equally() {
        let a = evaluate(&[1.0, 2.0], &[1.0, 2.0], &[0.0, 0.0]).unwrap();
        let b = evaluate(&[1.0, 2.0], &[2.0, 3.0], &[0.0, 0.0]).unwrap();
        let m = mean(&[a, b]).unwrap();
        assert_eq!(m.mse, 0.5);
        assert_eq!(m.samples, 4);
        assert!(mean(&[]).is_none());
    }
}
