/*!
Walk-forward validation

The labelled rows of a feature table are split into an expanding training window followed by
a fixed-size test window, several times over:

- Fold 0: train on `[0, min_train)`, test on the next `test_size` rows
- Fold 1: train on `[0, min_train + test_size)`, test on the next `test_size` rows
- etc.

Each fold fits its own scalers and its own network, and training rows whose targets reach into
the fold's test window are purged.
*/
use crate::config::Config;
use crate::error::{Error, Result};
use crate::experiment::{Experiment, Prediction};
use crate::features::FeatureTable;
use crate::metrics::{evaluate, mean, Metrics};
use crate::sequence::{carve_validation, Split};
use crate::train::EpochObserver;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tch::Device;
use tracing::info;

/// Walk-forward settings
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalkForwardConfig {
    /// The number of folds
    pub folds: usize,
    /// Labelled rows in the first fold's training window
    pub min_train: usize,
    /// Minimum labelled rows per test window
    pub min_test: usize,
}

impl Default for WalkForwardConfig {
    fn default() -> WalkForwardConfig {
        WalkForwardConfig {
            folds: 5,
            min_train: 252,
            min_test: 21,
        }
    }
}

impl WalkForwardConfig {
    /// Check that every setting is usable
    pub fn validate(&self) -> Result<()> {
        if self.folds == 0 || self.min_train == 0 || self.min_test == 0 {
            return Err(Error::InvalidConfig(format!(
                "walk-forward settings must be positive: {:?}",
                self
            )));
        }
        Ok(())
    }
}

/// The labelled-row ranges of one fold
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Fold {
    /// The fold number, starting at zero
    pub index: usize,
    /// The end of the training window (exclusive), after purging
    pub train_end: usize,
    /// The start of the test window (inclusive)
    pub test_start: usize,
    /// The end of the test window (exclusive)
    pub test_end: usize,
}

/// Lay out expanding-window folds over `samples` labelled rows
///
/// The last `horizon - 1` rows before each test window are left out of training, since their
/// targets overlap the test window.
pub fn create_folds(samples: usize, horizon: usize, config: &WalkForwardConfig) -> Result<Vec<Fold>> {
    config.validate()?;
    let min_total = config.min_train + config.folds * config.min_test;
    if samples < min_total {
        return Err(Error::InsufficientData(format!(
            "{} labelled rows < minimum {} for {} folds",
            samples, min_total, config.folds
        )));
    }
    let test_size = (samples - config.min_train) / config.folds;
    let gap = horizon.saturating_sub(1);
    let mut folds = Vec::with_capacity(config.folds);
    for index in 0..config.folds {
        let test_start = config.min_train + index * test_size;
        let test_end = test_start + test_size;
        if test_end > samples {
            break;
        }
        let train_end = test_start.saturating_sub(gap);
        if train_end == 0 {
            continue;
        }
        folds.push(Fold {
            index,
            train_end,
            test_start,
            test_end,
        });
    }
    if folds.is_empty() {
        return Err(Error::InsufficientData(format!(
            "cannot fit {} folds in {} labelled rows",
            config.folds, samples
        )));
    }
    Ok(folds)
}

/// The outcome of one fold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoldOutcome {
    /// The fold's layout
    pub fold: Fold,
    /// The first and last test dates
    pub test_dates: (NaiveDate, NaiveDate),
    /// In-sample metrics
    pub train: Metrics,
    /// Out-of-sample metrics
    pub test: Metrics,
    /// The epoch whose weights were kept
    pub best_epoch: usize,
    /// Out-of-sample predictions
    pub predictions: Vec<Prediction>,
}

/// The outcome of a walk-forward run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalkForwardReport {
    /// Per-fold outcomes
    pub folds: Vec<FoldOutcome>,
    /// Fold test metrics, averaged with equal weight per fold
    pub mean: Metrics,
    /// Test metrics over every fold's predictions together
    pub pooled: Metrics,
}

/// Run walk-forward validation over a feature table
pub fn run(
    config: &Config,
    table: &FeatureTable,
    device: Device,
    mut observer: impl EpochObserver,
) -> Result<WalkForwardReport> {
    config.validate()?;
    let labelled: Vec<usize> = table.labelled().collect();
    let folds = create_folds(labelled.len(), table.horizon, &config.walk_forward)?;
    let experiment = Experiment::new(config.clone(), device);
    let mut outcomes = Vec::with_capacity(folds.len());
    for fold in folds {
        let (train, validation) = carve_validation(
            table,
            labelled[..fold.train_end].to_vec(),
            config.split.validation_fraction,
        );
        let split = Split {
            train,
            validation,
            test: labelled[fold.test_start..fold.test_end].to_vec(),
        };
        let test_dates = (
            table.rows[split.test[0]].date,
            table.rows[split.test[split.test.len() - 1]].date,
        );
        info!(
            fold = fold.index,
            train = split.train.len(),
            test = split.test.len(),
            from = %test_dates.0,
            to = %test_dates.1,
            "running fold"
        );
        let outcome = experiment.fit_split(table, &split, &mut observer)?;
        outcomes.push(FoldOutcome {
            fold,
            test_dates,
            train: outcome.train.metrics,
            test: outcome.test.metrics,
            best_epoch: outcome.history.best_epoch,
            predictions: outcome.test.predictions,
        });
    }

    let tests: Vec<Metrics> = outcomes.iter().map(|o| o.test).collect();
    let mean = mean(&tests).ok_or_else(|| Error::InsufficientData("no folds ran".into()))?;
    let predictions = outcomes.iter().flat_map(|o| o.predictions.iter());
    let (actual, (predicted, reference)): (Vec<f64>, (Vec<f64>, Vec<f64>)) = predictions
        .map(|p| (p.actual, (p.predicted, p.reference_close)))
        .unzip();
    let pooled = evaluate(&actual, &predicted, &reference)?;
    info!(folds = outcomes.len(), mean = %mean, pooled = %pooled, "finished walk-forward");
    Ok(WalkForwardReport {
        folds: outcomes,
        mean,
        pooled,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::fake::random_walk_bars;
    use crate::features::{engineer, FeatureSet};
    use crate::train::NoObserver;

    fn config(folds: usize, min_train: usize, min_test: usize) -> WalkForwardConfig {
        WalkForwardConfig {
            folds,
            min_train,
            min_test,
        }
    }

    #[test]
    fn folds_expand_and_do_not_overlap() {
        let folds = create_folds(1000, 1, &WalkForwardConfig::default()).unwrap();
        assert_eq!(folds.len(), 5);
        let test_size = (1000 - 252) / 5;
        for (i, fold) in folds.iter().enumerate() {
            assert_eq!(fold.index, i);
            assert_eq!(fold.train_end, fold.test_start);
            assert_eq!(fold.test_end - fold.test_start, test_size);
            if i > 0 {
                assert_eq!(fold.test_start, folds[i - 1].test_end);
                assert!(fold.train_end > folds[i - 1].train_end);
            }
        }
        assert!(folds[4].test_end <= 1000);
    }

    #[test]
    fn longer_horizons_are_purged() {
        let folds = create_folds(400, 5, &config(3, 100, 20)).unwrap();
        for fold in &folds {
            assert_eq!(fold.train_end + 4, fold.test_start);
        }
    }

    #[test]
    fn too_little_data_is_rejected() {
        assert!(create_folds(300, 1, &WalkForwardConfig::default()).is_err());
        assert!(create_folds(100, 1, &config(0, 10, 10)).is_err());
    }

    #[test]
    fn run_pools_every_fold() {
        let bars = random_walk_bars(21, NaiveDate::from_ymd_opt(2021, 1, 4).unwrap(), 160).unwrap();
        let table = engineer(&bars, FeatureSet::CloseOnly, 1).unwrap();
        let mut config = Config::close_only();
        config.model.lookback = 8;
        config.model.hidden = 4;
        config.model.layers = 1;
        config.model.dense = None;
        config.training.epochs = 2;
        config.walk_forward = WalkForwardConfig {
            folds: 3,
            min_train: 60,
            min_test: 20,
        };
        let report = run(&config, &table, Device::Cpu, NoObserver).unwrap();
        assert_eq!(report.folds.len(), 3);
        let total: usize = report.folds.iter().map(|f| f.test.samples).sum();
        assert_eq!(report.pooled.samples, total);
        assert_eq!(report.mean.samples, total);
        for pair in report.folds.windows(2) {
            assert!(pair[0].test_dates.1 < pair[1].test_dates.0);
        }
    }
}
