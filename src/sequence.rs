/*!
Turning a feature table into lookback windows, and splitting it chronologically
*/
use crate::data::scale::TableScaler;
use crate::error::{Error, Result};
use crate::features::FeatureTable;
use crate::{CpuFloat, GpuFloat};
use chrono::NaiveDate;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// How to separate training rows from test rows
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitRule {
    /// Rows dated on or after this date are test rows
    Date(NaiveDate),
    /// This fraction of the labelled rows (rounded up) is used for training
    Ratio(f64),
}

/// Row positions of a chronological train/validation/test split
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Split {
    /// Rows used to fit weights and scalers
    pub train: Vec<usize>,
    /// Rows used for early stopping
    pub validation: Vec<usize>,
    /// Held out rows
    pub test: Vec<usize>,
}

/// Keep the rows whose whole target window ends before the bar at `boundary`
fn purge(table: &FeatureTable, positions: &[usize], boundary: usize) -> Vec<usize> {
    positions
        .iter()
        .copied()
        .filter(|&p| table.rows[p].index + table.horizon <= boundary)
        .collect()
}

/// Take the latest `fraction` of some training rows as validation rows
///
/// At least one row is taken once there are ten or more training rows, and none below that.
/// Training rows whose targets reach into the validation period are dropped.
pub fn carve_validation(
    table: &FeatureTable,
    mut train: Vec<usize>,
    fraction: f64,
) -> (Vec<usize>, Vec<usize>) {
    if train.len() < 10 || !(fraction > 0.0) {
        return (train, Vec::new());
    }
    let count = ((train.len() as f64 * fraction) as usize).clamp(1, train.len() - 1);
    let validation = train.split_off(train.len() - count);
    let validation_index = table.rows[validation[0]].index;
    (purge(table, &train, validation_index), validation)
}

/// Split a feature table chronologically
///
/// Training rows whose targets reach into the test period are dropped, as are training rows
/// whose targets reach into the validation period (see [`carve_validation`]).
pub fn split(table: &FeatureTable, rule: SplitRule, validation_fraction: f64) -> Result<Split> {
    if !(0.0..1.0).contains(&validation_fraction) {
        return Err(Error::InvalidConfig(format!(
            "validation fraction {} is not in [0, 1)",
            validation_fraction
        )));
    }
    let labelled: Vec<usize> = table.labelled().collect();
    // The position of the first test row among all rows
    let boundary = match rule {
        SplitRule::Date(date) => table.rows.iter().position(|row| row.date >= date),
        SplitRule::Ratio(ratio) => {
            if !(ratio > 0.0 && ratio < 1.0) {
                return Err(Error::InvalidConfig(format!(
                    "train ratio {} is not in (0, 1)",
                    ratio
                )));
            }
            let train_len = (labelled.len() as f64 * ratio).ceil() as usize;
            labelled.get(train_len).copied()
        }
    };
    let boundary = boundary.ok_or_else(|| {
        Error::InsufficientData(format!("no rows fall in the test period of {:?}", rule))
    })?;
    let boundary_index = table.rows[boundary].index;

    let test: Vec<usize> = labelled.iter().copied().filter(|&p| p >= boundary).collect();
    let before: Vec<usize> = labelled.iter().copied().filter(|&p| p < boundary).collect();
    let (train, validation) =
        carve_validation(table, purge(table, &before, boundary_index), validation_fraction);
    if train.is_empty() {
        return Err(Error::InsufficientData("no training rows before the split".into()));
    }
    if test.is_empty() {
        return Err(Error::InsufficientData("no labelled test rows after the split".into()));
    }
    debug!(
        train = train.len(),
        validation = validation.len(),
        test = test.len(),
        "split feature table"
    );
    Ok(Split {
        train,
        validation,
        test,
    })
}

/// A lookback window and its (scaled) targets
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// The position of the window's last row in the feature table
    pub position: usize,
    /// The date being predicted
    pub date: NaiveDate,
    /// The last known closing price
    pub reference_close: CpuFloat,
    /// The scaled feature rows, `lookback * features` values in row-major order
    pub window: Vec<GpuFloat>,
    /// The scaled targets, if known
    pub target: Option<Vec<GpuFloat>>,
    /// The unscaled target prices, if known
    pub prices: Option<Vec<CpuFloat>>,
}

/// A set of equally shaped samples
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceSet {
    /// Rows per window
    pub lookback: usize,
    /// Features per row
    pub features: usize,
    /// Targets per sample
    pub horizon: usize,
    /// The samples
    pub samples: Vec<Sample>,
}

impl SequenceSet {
    /// The number of samples
    pub fn len(&self) -> usize {
        self.samples.len()
    }
    /// Whether there are no samples
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
    /// Split the sample indices into batches, optionally shuffled
    pub fn batches<R: Rng>(&self, batch_size: usize, rng: Option<&mut R>) -> Vec<Vec<usize>> {
        let mut order: Vec<usize> = (0..self.samples.len()).collect();
        if let Some(rng) = rng {
            order.shuffle(rng);
        }
        order
            .chunks(batch_size.max(1))
            .map(|chunk| chunk.to_vec())
            .collect()
    }
}

/// Build the lookback window ending at a table position
///
/// Returns `None` when fewer than `lookback` consecutive rows end at `position`.
pub fn window_at(
    table: &FeatureTable,
    scaler: &TableScaler,
    position: usize,
    lookback: usize,
) -> Option<Sample> {
    if lookback == 0 || position >= table.rows.len() || position + 1 < lookback {
        return None;
    }
    let first = position + 1 - lookback;
    let rows = &table.rows[first..=position];
    // Rows dropped mid-series would make the window skip days
    if rows[lookback - 1].index - rows[0].index != lookback - 1 {
        return None;
    }
    let mut window = Vec::with_capacity(lookback * table.width());
    for row in rows {
        window.extend(scaler.scale_features(&row.values));
    }
    let last = &table.rows[position];
    Some(Sample {
        position,
        date: last.date,
        reference_close: last.reference_close,
        window,
        target: last.targets.as_ref().map(|t| scaler.scale_targets(t)),
        prices: last.targets.clone(),
    })
}

/// Build the windows ending at a set of table positions, skipping those without enough history
pub fn build_windows(
    table: &FeatureTable,
    scaler: &TableScaler,
    positions: &[usize],
    lookback: usize,
) -> Result<SequenceSet> {
    if lookback == 0 {
        return Err(Error::InvalidConfig("lookback must be at least one row".into()));
    }
    let samples: Vec<Sample> = positions
        .iter()
        .filter_map(|&position| window_at(table, scaler, position, lookback))
        .collect();
    Ok(SequenceSet {
        lookback,
        features: table.width(),
        horizon: table.horizon,
        samples,
    })
}
