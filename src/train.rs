/*!
Training loop with early stopping
*/
use crate::error::{Error, Result};
use crate::rnn::{LossKind, StockRnn};
use crate::sequence::SequenceSet;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tch::nn::{self, OptimizerConfig, VarStore};
use tch::{Device, Tensor};
use tracing::{debug, info, warn};

/// Optimisation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// The maximum number of passes over the training set
    pub epochs: usize,
    /// Samples per optimiser step
    pub batch_size: usize,
    /// Adam learning rate
    pub learning_rate: f64,
    /// Adam weight decay
    pub weight_decay: f64,
    /// Epochs without improvement before stopping; zero disables early stopping
    pub patience: usize,
    /// Maximum gradient norm; zero or less disables clipping
    pub gradient_clip: f64,
    /// The loss to minimise
    pub loss: LossKind,
    /// Seed for weight initialisation and batch shuffling
    pub seed: u64,
}

impl Default for TrainConfig {
    fn default() -> TrainConfig {
        TrainConfig {
            epochs: 100,
            batch_size: 32,
            learning_rate: 1e-3,
            weight_decay: 1e-4,
            patience: 7,
            gradient_clip: 1.0,
            loss: LossKind::Mse,
            seed: 42,
        }
    }
}

impl TrainConfig {
    /// Check that every setting is usable
    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 {
            return Err(Error::InvalidConfig("epochs must be at least one".into()));
        }
        if self.batch_size == 0 {
            return Err(Error::InvalidConfig("batch size must be at least one".into()));
        }
        if !(self.learning_rate > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "learning rate {} must be positive",
                self.learning_rate
            )));
        }
        if self.weight_decay < 0.0 {
            return Err(Error::InvalidConfig(format!(
                "weight decay {} must not be negative",
                self.weight_decay
            )));
        }
        Ok(())
    }
}

/// Losses recorded after one epoch
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochStats {
    /// The epoch number, starting at one
    pub epoch: usize,
    /// The mean training loss, in scaled units
    pub train_loss: f64,
    /// The mean validation loss, if there is a validation set
    pub validation_loss: Option<f64>,
}

impl EpochStats {
    /// The loss early stopping watches
    pub fn monitored(&self) -> f64 {
        self.validation_loss.unwrap_or(self.train_loss)
    }
    /// Whether every loss is finite
    pub fn is_finite(&self) -> bool {
        self.train_loss.is_finite() && self.validation_loss.map_or(true, f64::is_finite)
    }
}

/// The record of a training run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainHistory {
    /// Per-epoch losses
    pub epochs: Vec<EpochStats>,
    /// The epoch whose weights were kept
    pub best_epoch: usize,
    /// Whether training stopped before the epoch limit
    pub stopped_early: bool,
}

impl TrainHistory {
    /// The statistics of the epoch whose weights were kept
    pub fn best(&self) -> Option<&EpochStats> {
        self.epochs.iter().find(|stats| stats.epoch == self.best_epoch)
    }
}

/// Receives training progress
pub trait EpochObserver {
    /// Training is starting, with at most this many epochs
    fn on_start(&mut self, _epochs: usize) {}
    /// An epoch finished
    fn on_epoch(&mut self, _stats: &EpochStats) {}
    /// Training finished
    fn on_finish(&mut self, _history: &TrainHistory) {}
}

/// An observer which ignores everything
#[derive(Debug, Copy, Clone, Default)]
pub struct NoObserver;

impl EpochObserver for NoObserver {}

impl<O: EpochObserver + ?Sized> EpochObserver for &mut O {
    fn on_start(&mut self, epochs: usize) {
        (**self).on_start(epochs)
    }
    fn on_epoch(&mut self, stats: &EpochStats) {
        (**self).on_epoch(stats)
    }
    fn on_finish(&mut self, history: &TrainHistory) {
        (**self).on_finish(history)
    }
}

/// Copy every variable of a `VarStore`
fn snapshot(vs: &VarStore) -> HashMap<String, Tensor> {
    tch::no_grad(|| {
        vs.variables()
            .into_iter()
            .map(|(name, var)| (name, var.detach().copy()))
            .collect()
    })
}

/// Overwrite the variables of a `VarStore` with a snapshot
fn restore(vs: &VarStore, snapshot: &HashMap<String, Tensor>) {
    tch::no_grad(|| {
        for (name, mut var) in vs.variables() {
            if let Some(saved) = snapshot.get(&name) {
                var.copy_(saved);
            }
        }
    })
}

/// Trains a `StockRnn` on a device
#[derive(Debug, Clone)]
pub struct Trainer {
    /// Optimisation settings
    pub config: TrainConfig,
    /// The device batches are sent to
    pub device: Device,
}

impl Trainer {
    /// Create a new trainer
    pub fn new(config: TrainConfig, device: Device) -> Trainer {
        Trainer { config, device }
    }
    /// The mean loss of a model over a set, without tracking gradients
    pub fn evaluate_loss(&self, model: &StockRnn, set: &SequenceSet) -> Result<f64> {
        if set.is_empty() {
            return Err(Error::InsufficientData("no samples to compute a loss over".into()));
        }
        let mut total = 0.0;
        for batch in set.batches::<StdRng>(self.config.batch_size, None) {
            let (xs, ys) = model.make_batch(set, &batch)?;
            let ys = ys.ok_or_else(|| Error::InsufficientData("unlabelled sample".into()))?;
            let loss = tch::no_grad(|| {
                model.loss(
                    &xs.to_device(self.device),
                    &ys.to_device(self.device),
                    self.config.loss,
                    false,
                )
            });
            total += f64::try_from(&loss)? * batch.len() as f64;
        }
        Ok(total / set.len() as f64)
    }
    /// Fit a model's weights, restoring the best epoch's weights at the end
    ///
    /// Early stopping watches the validation loss, or the training loss when `validation` is
    /// empty.
    pub fn fit(
        &self,
        model: &StockRnn,
        vs: &VarStore,
        train: &SequenceSet,
        validation: &SequenceSet,
        mut observer: impl EpochObserver,
    ) -> Result<TrainHistory> {
        self.config.validate()?;
        if train.is_empty() {
            return Err(Error::InsufficientData("no training samples".into()));
        }
        let mut opt = nn::Adam {
            wd: self.config.weight_decay,
            ..Default::default()
        }
        .build(vs, self.config.learning_rate)?;
        let mut rng = StdRng::seed_from_u64(self.config.seed);

        info!(
            train = train.len(),
            validation = validation.len(),
            epochs = self.config.epochs,
            "beginning training"
        );
        observer.on_start(self.config.epochs);

        let mut history = TrainHistory::default();
        let mut best_loss = f64::INFINITY;
        let mut best_weights = snapshot(vs);
        let mut stale = 0;

        for epoch in 1..=self.config.epochs {
            // === TRAINING ===
            let mut sum_loss = 0.0;
            for batch in train.batches(self.config.batch_size, Some(&mut rng)) {
                let (xs, ys) = model.make_batch(train, &batch)?;
                let ys = ys.ok_or_else(|| {
                    Error::InsufficientData("unlabelled sample in training set".into())
                })?;
                let loss = model.loss(
                    &xs.to_device(self.device),
                    &ys.to_device(self.device),
                    self.config.loss,
                    true,
                );
                if self.config.gradient_clip > 0.0 {
                    opt.backward_step_clip_norm(&loss, self.config.gradient_clip);
                } else {
                    opt.backward_step(&loss);
                }
                sum_loss += f64::try_from(&loss)? * batch.len() as f64;
            }

            // === VALIDATION ===
            let validation_loss = if validation.is_empty() {
                None
            } else {
                Some(self.evaluate_loss(model, validation)?)
            };
            let stats = EpochStats {
                epoch,
                train_loss: sum_loss / train.len() as f64,
                validation_loss,
            };
            debug!(
                epoch,
                train_loss = stats.train_loss,
                validation_loss = ?stats.validation_loss,
                "finished epoch"
            );
            if !stats.is_finite() {
                warn!(epoch, train_loss = stats.train_loss, "loss is not finite");
                return Err(Error::Diverged(format!(
                    "epoch {} has training loss {} and validation loss {:?}",
                    epoch, stats.train_loss, stats.validation_loss
                )));
            }
            history.epochs.push(stats);
            observer.on_epoch(&stats);

            // === EARLY STOPPING ===
            let monitored = stats.monitored();
            if monitored < best_loss {
                best_loss = monitored;
                best_weights = snapshot(vs);
                history.best_epoch = epoch;
                stale = 0;
            } else {
                stale += 1;
                if self.config.patience > 0 && stale >= self.config.patience {
                    history.stopped_early = true;
                    info!(epoch, best_epoch = history.best_epoch, "stopping early");
                    break;
                }
            }
        }

        if history.best_epoch > 0 {
            restore(vs, &best_weights);
        }
        info!(
            best_epoch = history.best_epoch,
            best_loss, "finished training"
        );
        observer.on_finish(&history);
        Ok(history)
    }
}
