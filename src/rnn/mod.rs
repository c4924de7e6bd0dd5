/*!
The recurrent network: an LSTM or GRU stack, optional attention pooling, and a linear head
predicting one scaled close per horizon day
*/

use crate::error::{Error, Result};
use crate::sequence::SequenceSet;
use crate::GpuFloat;
use serde::{Deserialize, Serialize};
use std::fmt;
use tch::nn::{self, Linear, LinearConfig, Module, ModuleT, RNNConfig, VarStore, GRU, LSTM, RNN};
use tch::{Device, Kind, Reduction, Tensor};

/// The kind of recurrent cell to use
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RnnKind {
    /// Long short-term memory
    Lstm,
    /// Gated recurrent unit
    Gru,
}

impl Default for RnnKind {
    fn default() -> RnnKind {
        RnnKind::Lstm
    }
}

impl fmt::Display for RnnKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RnnKind::Lstm => write!(f, "LSTM"),
            RnnKind::Gru => write!(f, "GRU"),
        }
    }
}

/// The loss to train against
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossKind {
    /// Mean squared error
    Mse,
    /// Mean absolute error
    Mae,
}

impl Default for LossKind {
    fn default() -> LossKind {
        LossKind::Mse
    }
}

/// A stack of recurrent layers
#[derive(Debug)]
pub enum RecurrentLayer {
    /// An LSTM stack
    Lstm(LSTM),
    /// A GRU stack
    Gru(GRU),
}

impl RecurrentLayer {
    /// Run a batch-first sequence through the stack, returning the top layer's outputs at every step
    pub fn seq(&self, xs: &Tensor) -> Tensor {
        match self {
            RecurrentLayer::Lstm(lstm) => lstm.seq(xs).0,
            RecurrentLayer::Gru(gru) => gru.seq(xs).0,
        }
    }
}

/// Additive attention over the time steps of a recurrent output
#[derive(Debug)]
pub struct Attention {
    /// Projects each hidden state before scoring
    pub projection: Linear,
    /// Scores each projected hidden state
    pub score: Linear,
}

impl Attention {
    /// Build an attention layer over hidden states of a given size
    pub fn new(path: nn::Path, hidden: i64) -> Attention {
        let projection = nn::linear(&path / "projection", hidden, hidden, Default::default());
        let score = nn::linear(
            &path / "score",
            hidden,
            1,
            LinearConfig {
                bias: false,
                ..Default::default()
            },
        );
        Attention { projection, score }
    }
    /// Pool `[batch, steps, hidden]` states into `[batch, hidden]`, also returning the `[batch, steps]` weights
    pub fn pool(&self, hidden: &Tensor) -> (Tensor, Tensor) {
        let scores = self.score.forward(&self.projection.forward(hidden).tanh());
        let weights = scores.softmax(1, Kind::Float);
        let context = weights.transpose(1, 2).bmm(hidden).squeeze_dim(1);
        (context, weights.squeeze_dim(2))
    }
}

/// The stock price model
#[derive(Debug)]
pub struct StockRnn {
    /// The descriptor this model was built from
    pub desc: StockRnnDesc,
    /// This model's recurrent layers
    pub recurrent: RecurrentLayer,
    /// This model's attention layer, if any
    pub attention: Option<Attention>,
    /// This model's hidden dense layer, if any
    pub dense: Option<Linear>,
    /// This model's output layer
    pub head: Linear,
}

impl ModuleT for StockRnn {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let hidden = self.recurrent.seq(xs);
        let pooled = match &self.attention {
            Some(attention) => attention.pool(&hidden).0,
            None => hidden.select(1, -1),
        };
        let mut out = if self.desc.pool_dropout {
            pooled.dropout(self.desc.dropout, train)
        } else {
            pooled
        };
        if let Some(dense) = &self.dense {
            out = dense.forward(&out).relu().dropout(self.desc.dropout, train);
        }
        self.head.forward(&out)
    }
}

impl StockRnn {
    /// Compute the loss of a batch of inputs against their targets
    pub fn loss(&self, xs: &Tensor, ys: &Tensor, loss: LossKind, train: bool) -> Tensor {
        let yhat = self.forward_t(xs, train);
        match loss {
            LossKind::Mse => yhat.mse_loss(ys, Reduction::Mean),
            LossKind::Mae => yhat.l1_loss(ys, Reduction::Mean),
        }
    }
    /// The attention weights for a batch of inputs, if this model uses attention
    pub fn attention_weights(&self, xs: &Tensor) -> Option<Tensor> {
        let attention = self.attention.as_ref()?;
        Some(tch::no_grad(|| attention.pool(&self.recurrent.seq(xs)).1))
    }
    /// Package some samples of a sequence set into an input tensor and, if every sample has one, a target tensor
    pub fn make_batch(&self, set: &SequenceSet, indices: &[usize]) -> Result<(Tensor, Option<Tensor>)> {
        Self::make_batch_impl(self.desc.inputs, self.desc.outputs, set, indices)
    }
    fn make_batch_impl(
        inputs: usize,
        outputs: usize,
        set: &SequenceSet,
        indices: &[usize],
    ) -> Result<(Tensor, Option<Tensor>)> {
        // Step 1: verify basic invariants
        if set.features != inputs {
            return Err(Error::InvalidConfig(format!(
                "model expects {} features per row, samples have {}",
                inputs, set.features
            )));
        }
        if set.horizon != outputs {
            return Err(Error::InvalidConfig(format!(
                "model predicts {} days, samples have {}",
                outputs, set.horizon
            )));
        }
        if indices.is_empty() {
            return Err(Error::InsufficientData("empty batch".into()));
        }

        // Step 2: copy windows and targets into contiguous buffers
        let mut input = Vec::<GpuFloat>::with_capacity(indices.len() * set.lookback * set.features);
        let mut output = Vec::<GpuFloat>::with_capacity(indices.len() * set.horizon);
        let mut labelled = true;
        for &i in indices {
            let sample = set.samples.get(i).ok_or_else(|| {
                Error::InsufficientData(format!("no sample {} in a set of {}", i, set.len()))
            })?;
            input.extend_from_slice(&sample.window);
            match &sample.target {
                Some(target) => output.extend_from_slice(target),
                None => labelled = false,
            }
        }

        // Step 3: generate tensors from vectors
        let batch = indices.len() as i64;
        let input =
            Tensor::from_slice(&input).view([batch, set.lookback as i64, set.features as i64]);
        let output = if labelled {
            Some(Tensor::from_slice(&output).view([batch, set.horizon as i64]))
        } else {
            None
        };
        Ok((input, output))
    }
    /// Predict the scaled targets of some samples, without tracking gradients
    pub fn predict(
        &self,
        set: &SequenceSet,
        indices: &[usize],
        device: Device,
    ) -> Result<Vec<Vec<GpuFloat>>> {
        let (xs, _) = self.make_batch(set, indices)?;
        let out = tch::no_grad(|| self.forward_t(&xs.to_device(device), false));
        let flat = out.to_device(Device::Cpu).to_kind(Kind::Float).reshape([-1]);
        let values = Vec::<GpuFloat>::try_from(&flat)?;
        Ok(values
            .chunks(self.desc.outputs)
            .map(|chunk| chunk.to_vec())
            .collect())
    }
}

/// A descriptor for an instance of the `StockRnn` model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockRnnDesc {
    /// The number of features per time step
    pub inputs: usize,
    /// The size of the hidden recurrent layers
    pub hidden: usize,
    /// The number of stacked recurrent layers
    pub layers: usize,
    /// The dropout probability applied after the dense layer
    pub dropout: f64,
    /// Whether dropout is also applied to the pooled recurrent state
    #[serde(default = "pool_dropout_default")]
    pub pool_dropout: bool,
    /// The recurrent cell
    pub kind: RnnKind,
    /// Whether to pool time steps with attention rather than taking the last step
    pub attention: bool,
    /// The width of an optional ReLU layer before the head
    pub dense: Option<usize>,
    /// The number of days predicted
    pub outputs: usize,
}

fn pool_dropout_default() -> bool {
    true
}

impl StockRnnDesc {
    /// Build a `StockRnn` over a given `VarStore`
    pub fn build(&self, vs: &VarStore) -> Result<StockRnn> {
        if self.inputs == 0 || self.hidden == 0 || self.layers == 0 || self.outputs == 0 {
            return Err(Error::InvalidConfig(format!(
                "model dimensions must be positive: {:?}",
                self
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(Error::InvalidConfig(format!(
                "dropout {} is not in [0, 1)",
                self.dropout
            )));
        }
        let root = vs.root();
        let hidden = self.hidden as i64;
        // The train flag is baked into tch's layers, so inter-layer dropout would also fire at
        // inference time: dropout is applied on the pooled state and the dense layer instead
        let config = RNNConfig {
            has_biases: true,
            num_layers: self.layers as i64,
            dropout: 0.,
            train: true,
            bidirectional: false,
            batch_first: true,
            ..Default::default()
        };
        let recurrent = match self.kind {
            RnnKind::Lstm => {
                RecurrentLayer::Lstm(nn::lstm(&root / "rnn", self.inputs as i64, hidden, config))
            }
            RnnKind::Gru => {
                RecurrentLayer::Gru(nn::gru(&root / "rnn", self.inputs as i64, hidden, config))
            }
        };
        let attention = if self.attention {
            Some(Attention::new(&root / "attention", hidden))
        } else {
            None
        };
        let (dense, head_inputs) = match self.dense {
            Some(units) => (
                Some(nn::linear(&root / "dense", hidden, units as i64, Default::default())),
                units as i64,
            ),
            None => (None, hidden),
        };
        let head = nn::linear(&root / "head", head_inputs, self.outputs as i64, Default::default());
        Ok(StockRnn {
            desc: self.clone(),
            recurrent,
            attention,
            dense,
            head,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::Sample;
    use chrono::NaiveDate;

    fn fake_set(samples: usize, lookback: usize, features: usize, horizon: usize) -> SequenceSet {
        let date = NaiveDate::from_ymd_opt(2020, 6, 22).unwrap();
        SequenceSet {
            lookback,
            features,
            horizon,
            samples: (0..samples)
                .map(|i| Sample {
                    position: i,
                    date,
                    reference_close: 40.0,
                    window: (0..lookback * features).map(|j| (i + j) as f32 * 0.01).collect(),
                    target: Some(vec![i as f32 * 0.1; horizon]),
                    prices: Some(vec![40.0; horizon]),
                })
                .collect(),
        }
    }

    fn desc(kind: RnnKind, attention: bool, dense: Option<usize>) -> StockRnnDesc {
        StockRnnDesc {
            inputs: 3,
            hidden: 8,
            layers: 2,
            dropout: 0.2,
            pool_dropout: true,
            kind,
            attention,
            dense,
            outputs: 2,
        }
    }

    /// Test making batches of data
    #[test]
    fn batch_making_works() {
        let set = fake_set(6, 4, 3, 2);
        let (input, output) = StockRnn::make_batch_impl(3, 2, &set, &[0, 2, 5]).unwrap();
        assert_eq!(input.size3().unwrap(), (3, 4, 3));
        assert_eq!(output.unwrap().size2().unwrap(), (3, 2));
        assert!(StockRnn::make_batch_impl(4, 2, &set, &[0]).is_err());
        assert!(StockRnn::make_batch_impl(3, 2, &set, &[9]).is_err());
    }

    #[test]
    fn unlabelled_samples_have_no_targets() {
        let mut set = fake_set(2, 4, 3, 2);
        set.samples[1].target = None;
        let (_, output) = StockRnn::make_batch_impl(3, 2, &set, &[0, 1]).unwrap();
        assert!(output.is_none());
    }

    #[test]
    fn every_variant_predicts_the_horizon() {
        let set = fake_set(5, 4, 3, 2);
        for kind in [RnnKind::Lstm, RnnKind::Gru] {
            for (attention, dense) in [(false, None), (true, None), (true, Some(16))] {
                let vs = VarStore::new(Device::Cpu);
                let model = desc(kind, attention, dense).build(&vs).unwrap();
                let predictions = model.predict(&set, &[0, 1, 2, 3, 4], Device::Cpu).unwrap();
                assert_eq!(predictions.len(), 5);
                assert!(predictions.iter().all(|p| p.len() == 2 && p.iter().all(|v| v.is_finite())));
            }
        }
    }

    #[test]
    fn attention_weights_sum_to_one() {
        let set = fake_set(3, 5, 3, 2);
        let vs = VarStore::new(Device::Cpu);
        let model = desc(RnnKind::Lstm, true, None).build(&vs).unwrap();
        let (xs, _) = model.make_batch(&set, &[0, 1, 2]).unwrap();
        let weights = model.attention_weights(&xs).unwrap();
        assert_eq!(weights.size2().unwrap(), (3, 5));
        let weights = Vec::<f32>::try_from(&weights.reshape([-1])).unwrap();
        for row in weights.chunks(5) {
            assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn pool_dropout_can_be_turned_off() {
        let set = fake_set(4, 5, 3, 2);
        let vs = VarStore::new(Device::Cpu);
        let mut quiet = desc(RnnKind::Lstm, false, None);
        quiet.dropout = 0.5;
        quiet.pool_dropout = false;
        let model = quiet.build(&vs).unwrap();
        let (xs, _) = model.make_batch(&set, &[0, 1, 2, 3]).unwrap();
        let train = tch::no_grad(|| model.forward_t(&xs, true));
        let eval = tch::no_grad(|| model.forward_t(&xs, false));
        assert!(train.allclose(&eval, 1e-6, 1e-6, false));
    }

    #[test]
    fn descriptors_without_pool_dropout_keep_it() {
        let json = r#"{"inputs":3,"hidden":8,"layers":1,"dropout":0.2,"kind":"gru",
            "attention":false,"dense":null,"outputs":1}"#;
        let desc: StockRnnDesc = serde_json::from_str(json).unwrap();
        assert!(desc.pool_dropout);
        assert_eq!(desc.kind, RnnKind::Gru);
    }

    #[test]
    fn invalid_descriptors_are_rejected() {
        let vs = VarStore::new(Device::Cpu);
        let mut bad = desc(RnnKind::Gru, false, None);
        bad.dropout = 1.0;
        assert!(bad.build(&vs).is_err());
        bad.dropout = 0.0;
        bad.outputs = 0;
        assert!(bad.build(&vs).is_err());
    }
}
