/*!
End-to-end training and evaluation of a model for one ticker
*/
use crate::config::Config;
use crate::data::scale::TableScaler;
use crate::data::Bar;
use crate::error::{Error, Result};
use crate::features::{engineer, FeatureSet, FeatureTable};
use crate::metrics::{evaluate, Metrics};
use crate::rnn::{StockRnn, StockRnnDesc};
use crate::sequence::{build_windows, split, window_at, SequenceSet, Split};
use crate::train::{EpochObserver, TrainHistory, Trainer};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tch::nn::VarStore;
use tch::Device;
use tracing::info;

/// Everything needed to rebuild a trained model, apart from its weights
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// The network shape
    pub desc: StockRnnDesc,
    /// The scalers fitted on the training rows
    pub scaler: TableScaler,
    /// The feature set the network reads
    pub feature_set: FeatureSet,
    /// The feature column names, in order
    pub names: Vec<String>,
    /// Rows per lookback window
    pub lookback: usize,
    /// Days predicted
    pub horizon: usize,
    /// The date of the last training row
    pub trained_through: NaiveDate,
    /// When training finished
    pub trained_at: DateTime<Utc>,
    /// Metrics on the chronological holdout, if one was evaluated
    pub holdout: Option<Metrics>,
    /// The configuration used to train
    pub config: Config,
}

/// A single holdout prediction, on the last day of the horizon
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    /// The first predicted date
    pub date: NaiveDate,
    /// The last known close when predicting
    pub reference_close: f64,
    /// The actual close
    pub actual: f64,
    /// The predicted close
    pub predicted: f64,
}

/// Metrics and predictions over a set of samples
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    /// The metrics
    pub metrics: Metrics,
    /// The individual predictions
    pub predictions: Vec<Prediction>,
}

/// A network together with its weights, scalers and metadata
pub struct TrainedModel {
    vs: VarStore,
    model: StockRnn,
    /// Everything needed to rebuild the network
    pub meta: ModelMetadata,
}

impl fmt::Debug for TrainedModel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TrainedModel")
            .field("device", &self.vs.device())
            .field("meta", &self.meta)
            .finish()
    }
}

fn weights_path(dir: &Path, ticker: &str) -> PathBuf {
    dir.join(format!("rnn_model_{}.ot", ticker))
}

fn metadata_path(dir: &Path, ticker: &str) -> PathBuf {
    dir.join(format!("rnn_model_{}.json", ticker))
}

impl TrainedModel {
    /// The network
    pub fn network(&self) -> &StockRnn {
        &self.model
    }
    /// The device the weights live on
    pub fn device(&self) -> Device {
        self.vs.device()
    }
    /// Predict the prices of every sample in a set
    pub fn predict_set(&self, set: &SequenceSet) -> Result<Vec<Vec<f64>>> {
        let mut prices = Vec::with_capacity(set.len());
        let batch_size = self.meta.config.training.batch_size;
        for batch in set.batches::<rand::rngs::StdRng>(batch_size, None) {
            for scaled in self.model.predict(set, &batch, self.device())? {
                prices.push(self.meta.scaler.unscale_targets(&scaled));
            }
        }
        Ok(prices)
    }
    /// Evaluate the model on the last horizon day of every labelled sample in a set
    pub fn evaluate(&self, set: &SequenceSet) -> Result<Evaluation> {
        let predicted = self.predict_set(set)?;
        let last = set.horizon.saturating_sub(1);
        let predictions: Vec<Prediction> = set
            .samples
            .iter()
            .zip(predicted)
            .filter_map(|(sample, predicted)| {
                let actual = *sample.prices.as_ref()?.get(last)?;
                Some(Prediction {
                    date: sample.date,
                    reference_close: sample.reference_close,
                    actual,
                    predicted: *predicted.get(last)?,
                })
            })
            .collect();
        let actual: Vec<f64> = predictions.iter().map(|p| p.actual).collect();
        let predicted: Vec<f64> = predictions.iter().map(|p| p.predicted).collect();
        let reference: Vec<f64> = predictions.iter().map(|p| p.reference_close).collect();
        Ok(Evaluation {
            metrics: evaluate(&actual, &predicted, &reference)?,
            predictions,
        })
    }
    /// Predict the next `horizon` closes from the latest row of a feature table
    pub fn forecast(&self, table: &FeatureTable) -> Result<Vec<f64>> {
        if table.names != self.meta.names || table.horizon != self.meta.horizon {
            return Err(Error::InvalidConfig(format!(
                "table has {} features and horizon {}, model expects {} and {}",
                table.width(),
                table.horizon,
                self.meta.names.len(),
                self.meta.horizon
            )));
        }
        let last = table
            .len()
            .checked_sub(1)
            .ok_or_else(|| Error::InsufficientData("empty feature table".into()))?;
        let sample = window_at(table, &self.meta.scaler, last, self.meta.lookback).ok_or_else(
            || {
                Error::InsufficientData(format!(
                    "need {} consecutive rows to forecast, have {}",
                    self.meta.lookback,
                    table.len()
                ))
            },
        )?;
        let set = SequenceSet {
            lookback: self.meta.lookback,
            features: table.width(),
            horizon: table.horizon,
            samples: vec![sample],
        };
        let scaled = self.model.predict(&set, &[0], self.device())?;
        let scaled = scaled
            .first()
            .ok_or_else(|| Error::InsufficientData("model returned no prediction".into()))?;
        Ok(self.meta.scaler.unscale_targets(scaled))
    }
    /// Save weights to `rnn_model_{TICKER}.ot` and metadata to `rnn_model_{TICKER}.json`
    pub fn save(&self, dir: &Path, ticker: &str) -> Result<PathBuf> {
        // JSON has no NaN, so these would not load again
        if let Some(holdout) = self.meta.holdout.filter(|m| !m.is_finite()) {
            return Err(Error::Diverged(format!(
                "holdout metrics for {} are not finite: {}",
                ticker, holdout
            )));
        }
        std::fs::create_dir_all(dir)?;
        let weights = weights_path(dir, ticker);
        self.vs.save(&weights)?;
        let file = BufWriter::new(File::create(metadata_path(dir, ticker))?);
        serde_json::to_writer_pretty(file, &self.meta)?;
        info!(ticker, path = %weights.display(), "saved model");
        Ok(weights)
    }
    /// Load a model saved with [`TrainedModel::save`]
    pub fn load(dir: &Path, ticker: &str, device: Device) -> Result<TrainedModel> {
        let file = BufReader::new(File::open(metadata_path(dir, ticker))?);
        let meta: ModelMetadata = serde_json::from_reader(file)?;
        let mut vs = VarStore::new(device);
        let model = meta.desc.build(&vs)?;
        vs.load(weights_path(dir, ticker))?;
        Ok(TrainedModel { vs, model, meta })
    }
}

/// The result of an experiment
#[derive(Debug)]
pub struct ExperimentOutcome {
    /// The trained model
    pub model: TrainedModel,
    /// The training record
    pub history: TrainHistory,
    /// In-sample evaluation
    pub train: Evaluation,
    /// Holdout evaluation
    pub test: Evaluation,
}

/// Trains and evaluates models according to a configuration
#[derive(Debug, Clone)]
pub struct Experiment {
    /// The configuration
    pub config: Config,
    /// The device to train on
    pub device: Device,
}

impl Experiment {
    /// Create a new experiment
    pub fn new(config: Config, device: Device) -> Experiment {
        Experiment { config, device }
    }
    /// Engineer features from bars, split them chronologically, then train and evaluate
    pub fn run(&self, bars: &[Bar], observer: impl EpochObserver) -> Result<ExperimentOutcome> {
        self.config.validate()?;
        let table = engineer(bars, self.config.features.set, self.config.features.horizon)?;
        self.run_table(&table, observer)
    }
    /// Split an engineered table chronologically, then train and evaluate
    pub fn run_table(
        &self,
        table: &FeatureTable,
        observer: impl EpochObserver,
    ) -> Result<ExperimentOutcome> {
        self.config.validate()?;
        if table.set != self.config.features.set || table.horizon != self.config.features.horizon {
            return Err(Error::InvalidConfig(format!(
                "table has {:?} features over {} days, configuration asks for {:?} over {}",
                table.set, table.horizon, self.config.features.set, self.config.features.horizon
            )));
        }
        let split = split(
            table,
            self.config.split.rule,
            self.config.split.validation_fraction,
        )?;
        self.fit_split(table, &split, observer)
    }
    /// Train on the training rows of a split and evaluate on its test rows
    ///
    /// Scalers are fitted on the training rows alone.
    pub fn fit_split(
        &self,
        table: &FeatureTable,
        split: &Split,
        observer: impl EpochObserver,
    ) -> Result<ExperimentOutcome> {
        let lookback = self.config.model.lookback;
        let scaler = TableScaler::fit(split.train.iter().map(|&p| &table.rows[p]))?;
        let train = build_windows(table, &scaler, &split.train, lookback)?;
        let validation = build_windows(table, &scaler, &split.validation, lookback)?;
        let test = build_windows(table, &scaler, &split.test, lookback)?;
        if train.is_empty() {
            return Err(Error::InsufficientData(format!(
                "no training rows have {} rows of history",
                lookback
            )));
        }
        if test.is_empty() {
            return Err(Error::InsufficientData(format!(
                "no test rows have {} rows of history",
                lookback
            )));
        }
        let trained_through = split
            .train
            .last()
            .map(|&p| table.rows[p].date)
            .ok_or_else(|| Error::InsufficientData("no training rows".into()))?;

        tch::manual_seed(self.config.training.seed as i64);
        let vs = VarStore::new(self.device);
        let desc = self.config.model.desc(table.width(), table.horizon);
        let model = desc.build(&vs)?;
        info!(
            kind = %desc.kind,
            features = desc.inputs,
            horizon = desc.outputs,
            train = train.len(),
            test = test.len(),
            "training model"
        );
        let history = Trainer::new(self.config.training.clone(), self.device).fit(
            &model,
            &vs,
            &train,
            &validation,
            observer,
        )?;

        let mut trained = TrainedModel {
            vs,
            model,
            meta: ModelMetadata {
                desc,
                scaler,
                feature_set: table.set,
                names: table.names.clone(),
                lookback,
                horizon: table.horizon,
                trained_through,
                trained_at: Utc::now(),
                holdout: None,
                config: self.config.clone(),
            },
        };
        let train_eval = trained.evaluate(&train)?;
        let test_eval = trained.evaluate(&test)?;
        trained.meta.holdout = Some(test_eval.metrics);
        info!(train = %train_eval.metrics, test = %test_eval.metrics, "evaluated model");
        Ok(ExperimentOutcome {
            model: trained,
            history,
            train: train_eval,
            test: test_eval,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::fake::random_walk_bars;
    use crate::sequence::SplitRule;
    use crate::train::NoObserver;

    fn tiny_config() -> Config {
        let mut config = Config::close_only();
        config.features.horizon = 2;
        config.model.lookback = 10;
        config.model.hidden = 8;
        config.model.layers = 1;
        config.model.dense = Some(8);
        config.training.epochs = 3;
        config.split.rule = SplitRule::Ratio(0.8);
        config
    }

    #[test]
    fn run_evaluates_holdout_and_forecasts() {
        let bars = random_walk_bars(4, NaiveDate::from_ymd_opt(2022, 1, 3).unwrap(), 150).unwrap();
        let experiment = Experiment::new(tiny_config(), Device::Cpu);
        let outcome = experiment.run(&bars, NoObserver).unwrap();
        assert_eq!(outcome.history.epochs.len(), 3);
        assert!(outcome.test.metrics.samples > 0);
        assert_eq!(outcome.model.meta.holdout, Some(outcome.test.metrics));
        assert!(outcome.train.predictions.iter().all(|p| p.date <= outcome.model.meta.trained_through));

        let table = engineer(&bars, FeatureSet::CloseOnly, 2).unwrap();
        let forecast = outcome.model.forecast(&table).unwrap();
        assert_eq!(forecast.len(), 2);
        assert!(forecast.iter().all(|p| p.is_finite()));

        let wrong = engineer(&bars, FeatureSet::CloseOnly, 3).unwrap();
        assert!(outcome.model.forecast(&wrong).is_err());
    }

    #[test]
    fn saved_models_predict_identically() {
        let bars = random_walk_bars(8, NaiveDate::from_ymd_opt(2022, 1, 3).unwrap(), 120).unwrap();
        let outcome = Experiment::new(tiny_config(), Device::Cpu)
            .run(&bars, NoObserver)
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let weights = outcome.model.save(dir.path(), "TEST").unwrap();
        assert!(weights.ends_with("rnn_model_TEST.ot"));
        assert!(dir.path().join("rnn_model_TEST.json").exists());

        let loaded = TrainedModel::load(dir.path(), "TEST", Device::Cpu).unwrap();
        assert_eq!(loaded.meta, outcome.model.meta);
        let table = engineer(&bars, FeatureSet::CloseOnly, 2).unwrap();
        assert_eq!(
            loaded.forecast(&table).unwrap(),
            outcome.model.forecast(&table).unwrap()
        );
        assert!(TrainedModel::load(dir.path(), "MISSING", Device::Cpu).is_err());
    }

    #[test]
    fn diverged_models_are_not_saved() {
        let bars = random_walk_bars(8, NaiveDate::from_ymd_opt(2022, 1, 3).unwrap(), 120).unwrap();
        let mut outcome = Experiment::new(tiny_config(), Device::Cpu)
            .run(&bars, NoObserver)
            .unwrap();
        let mut holdout = outcome.test.metrics;
        holdout.rmse = f64::NAN;
        outcome.model.meta.holdout = Some(holdout);
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            outcome.model.save(dir.path(), "TEST"),
            Err(Error::Diverged(_))
        ));
        assert!(!dir.path().join("rnn_model_TEST.json").exists());
    }

    #[test]
    fn tables_must_match_the_configuration() {
        let bars = random_walk_bars(4, NaiveDate::from_ymd_opt(2022, 1, 3).unwrap(), 120).unwrap();
        let table = engineer(&bars, FeatureSet::CloseOnly, 1).unwrap();
        let result = Experiment::new(tiny_config(), Device::Cpu).run_table(&table, NoObserver);
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn short_histories_fail_cleanly() {
        let bars = random_walk_bars(4, NaiveDate::from_ymd_opt(2022, 1, 3).unwrap(), 12).unwrap();
        let result = Experiment::new(tiny_config(), Device::Cpu).run(&bars, NoObserver);
        assert!(matches!(result, Err(Error::InsufficientData(_))));
    }
}
