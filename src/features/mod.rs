/*!
Leak-free feature engineering

A [`FeatureTable`] has one row per *decision point* `t`, for `t` in `0..=bars.len()`. Row `t`
is computed from `bars[..t]` only: it describes the market as of the close of `bars[t - 1]`, and
its targets are the closes of `bars[t..t + horizon]`. The final row (`t == bars.len()`) has no
targets and is the input for a live forecast.
*/
use crate::data::Bar;
use crate::error::{Error, Result};
use crate::util::next_weekday;
use crate::CpuFloat;
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::io::Write;

pub mod technical;

use technical::{technical_series, TECHNICAL_COLUMNS};

/// Which features to engineer
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureSet {
    /// Technical indicators, returns, lags, rolling statistics and calendar features
    Technical,
    /// The last known closing price alone
    CloseOnly,
}

impl Default for FeatureSet {
    fn default() -> FeatureSet {
        FeatureSet::Technical
    }
}

/// Calendar columns, which describe the row's own date and are known in advance
const CALENDAR_COLUMNS: &[&str] = &["weekday", "month_sin", "month_cos"];

impl FeatureSet {
    /// The names of the columns this feature set produces
    pub fn columns(self) -> Vec<String> {
        match self {
            FeatureSet::Technical => TECHNICAL_COLUMNS
                .iter()
                .chain(CALENDAR_COLUMNS)
                .map(|name| name.to_string())
                .collect(),
            FeatureSet::CloseOnly => vec!["close".to_string()],
        }
    }
}

/// A single row of a feature table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    /// The decision point: the number of bars this row may look at
    pub index: usize,
    /// The date being predicted (the first target's date)
    pub date: NaiveDate,
    /// The last closing price known at this decision point
    pub reference_close: CpuFloat,
    /// The feature values
    pub values: Vec<CpuFloat>,
    /// The closing prices of the next `horizon` bars, if they are all known
    pub targets: Option<Vec<CpuFloat>>,
}

/// A table of leak-free features and multi-step price targets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureTable {
    /// The feature set used
    pub set: FeatureSet,
    /// The number of future closes in each target
    pub horizon: usize,
    /// The column names
    pub names: Vec<String>,
    /// The rows, in chronological order
    pub rows: Vec<FeatureRow>,
}

fn calendar(date: NaiveDate) -> [f64; 3] {
    let month = (date.month0() as f64) * 2.0 * PI / 12.0;
    [
        date.weekday().num_days_from_monday() as f64 / 4.0,
        month.sin(),
        month.cos(),
    ]
}

/// Engineer a feature table from clean, date-ordered bars
///
/// Rows whose features are not all finite (the indicator warm-up) are dropped.
pub fn engineer(bars: &[Bar], set: FeatureSet, horizon: usize) -> Result<FeatureTable> {
    if horizon == 0 {
        return Err(Error::InvalidConfig("horizon must be at least one day".into()));
    }
    if bars.is_empty() {
        return Err(Error::InsufficientData("no bars to engineer features from".into()));
    }
    let n = bars.len();
    let technical = match set {
        FeatureSet::Technical => Some(technical_series(bars)?),
        FeatureSet::CloseOnly => None,
    };
    let mut rows = Vec::with_capacity(n);
    for t in 1..=n {
        let last = &bars[t - 1];
        let date = if t < n {
            bars[t].date
        } else {
            next_weekday(last.date)
        };
        let values: Vec<f64> = match &technical {
            Some(series) => series[t - 1]
                .iter()
                .copied()
                .chain(calendar(date))
                .collect(),
            None => vec![last.close],
        };
        if !values.iter().all(|v| v.is_finite()) {
            continue;
        }
        let targets = if t + horizon <= n {
            Some(bars[t..t + horizon].iter().map(|bar| bar.close).collect())
        } else {
            None
        };
        rows.push(FeatureRow {
            index: t,
            date,
            reference_close: last.close,
            values,
            targets,
        });
    }
    Ok(FeatureTable {
        set,
        horizon,
        names: set.columns(),
        rows,
    })
}

impl FeatureTable {
    /// The number of rows
    pub fn len(&self) -> usize {
        self.rows.len()
    }
    /// Whether the table has no rows
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
    /// The number of feature columns
    pub fn width(&self) -> usize {
        self.names.len()
    }
    /// The positions of the rows that have targets
    pub fn labelled(&self) -> impl Iterator<Item = usize> + '_ {
        self.rows
            .iter()
            .enumerate()
            .filter(|(_, row)| row.targets.is_some())
            .map(|(i, _)| i)
    }
    /// The most recent row, used for live forecasts
    pub fn latest(&self) -> Option<&FeatureRow> {
        self.rows.last()
    }
    /// The first and last row dates
    pub fn date_range(&self) -> Option<(NaiveDate, NaiveDate)> {
        Some((self.rows.first()?.date, self.rows.last()?.date))
    }
    /// Write the table as CSV: date, reference close, features, then targets
    pub fn write_csv<W: Write>(&self, wtr: W) -> Result<usize> {
        let mut wtr = csv::Writer::from_writer(wtr);
        let mut header = vec!["date".to_string(), "reference_close".to_string()];
        header.extend(self.names.iter().cloned());
        header.extend((1..=self.horizon).map(|h| format!("target_{}", h)));
        wtr.write_record(&header)?;
        for row in &self.rows {
            let mut record = vec![row.date.to_string(), row.reference_close.to_string()];
            record.extend(row.values.iter().map(|v| v.to_string()));
            match &row.targets {
                Some(targets) => record.extend(targets.iter().map(|v| v.to_string())),
                None => record.extend(std::iter::repeat(String::new()).take(self.horizon)),
            }
            wtr.write_record(&record)?;
        }
        wtr.flush()?;
        Ok(self.rows.len())
    }
}
