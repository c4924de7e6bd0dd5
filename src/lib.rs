/*!
Recurrent neural networks for forecasting daily stock closes, written in Rust using PyTorch bindings.

Bars are fetched from Yahoo Finance, local CSV files or a seeded random walk, turned into
leak-free feature tables, windowed, and fed to an LSTM or GRU. Models are evaluated on a
chronological holdout and with walk-forward validation, and served through a cached
prediction service.
*/
#![forbid(missing_docs)]

pub mod config;
pub mod data;
pub mod error;
pub mod experiment;
pub mod features;
pub mod forecast;
pub mod metrics;
pub mod report;
pub mod rnn;
pub mod sequence;
pub mod train;
pub mod util;
pub mod walk_forward;

pub use error::{Error, Result};

/// The floating point type to be used for CPU calculations
pub type CpuFloat = f64;

/// The floating point type to be used for GPU calculations
pub type GpuFloat = f32;
