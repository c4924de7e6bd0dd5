/*!
Data processing and IO functions
*/
use crate::error::{Error, Result};
use chrono::{Months, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use ta::{Close, High, Low, Open, Volume};
use tracing::{debug, warn};

pub mod fake;
pub mod scale;
pub mod store;
pub mod yahoo;

/// A daily bar of stock data
#[derive(Debug, Copy, Clone, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Bar {
    /// The trading day this bar covers
    pub date: NaiveDate,
    /// The opening price
    pub open: f64,
    /// The high price
    pub high: f64,
    /// The low price
    pub low: f64,
    /// The closing price
    pub close: f64,
    /// The closing price adjusted for splits and dividends
    pub adj_close: f64,
    /// The volume traded
    pub volume: f64,
}

impl Bar {
    /// Whether every price in this bar is finite and positive, and the volume is finite and non-negative
    pub fn is_valid(&self) -> bool {
        let prices = [self.open, self.high, self.low, self.close, self.adj_close];
        prices.iter().all(|p| p.is_finite() && *p > 0.0)
            && self.volume.is_finite()
            && self.volume >= 0.0
    }
}

impl Open for Bar {
    #[inline]
    fn open(&self) -> f64 {
        self.open
    }
}

impl High for Bar {
    #[inline]
    fn high(&self) -> f64 {
        self.high
    }
}

impl Low for Bar {
    #[inline]
    fn low(&self) -> f64 {
        self.low
    }
}

impl Close for Bar {
    #[inline]
    fn close(&self) -> f64 {
        self.close
    }
}

impl Volume for Bar {
    #[inline]
    fn volume(&self) -> f64 {
        self.volume
    }
}

/// Clean a series of bars: drop invalid rows, sort by date, and keep the last bar for duplicated dates
pub fn clean_bars(bars: Vec<Bar>) -> Vec<Bar> {
    let total = bars.len();
    let mut by_date = BTreeMap::new();
    for bar in bars.into_iter().filter(Bar::is_valid) {
        by_date.insert(bar.date, bar);
    }
    let cleaned: Vec<Bar> = by_date.into_values().collect();
    if cleaned.len() != total {
        debug!(
            dropped = total - cleaned.len(),
            kept = cleaned.len(),
            "cleaned bar series"
        );
    }
    cleaned
}

/// Validate and normalize a ticker symbol
///
/// Tickers are trimmed and uppercased, must be 1 to 10 characters long, and must be
/// alphanumeric once `.` and `-` are removed (e.g. `BRK.B`, `RDS-A`).
pub fn validate_ticker(ticker: &str) -> Result<String> {
    let ticker = ticker.trim().to_uppercase();
    let len = ticker.chars().count();
    let core_ok = ticker
        .chars()
        .filter(|c| *c != '.' && *c != '-')
        .all(|c| c.is_ascii_alphanumeric());
    let has_core = ticker.chars().any(|c| c.is_ascii_alphanumeric());
    if (1..=10).contains(&len) && core_ok && has_core {
        Ok(ticker)
    } else {
        Err(Error::InvalidTicker(ticker))
    }
}

/// The default download range: the five years up to and including `today`
pub fn default_range(today: NaiveDate) -> (NaiveDate, NaiveDate) {
    let start = today.checked_sub_months(Months::new(60)).unwrap_or(today);
    (start, today)
}

/// A source of daily bars
pub trait DataProvider {
    /// A human readable name for this provider
    fn name(&self) -> &str;
    /// Fetch the daily bars for `ticker` between `start` and `end`, inclusive
    fn fetch(&self, ticker: &str, start: NaiveDate, end: NaiveDate) -> Result<Vec<Bar>>;
}

impl<P: DataProvider + ?Sized> DataProvider for &P {
    fn name(&self) -> &str {
        (**self).name()
    }
    fn fetch(&self, ticker: &str, start: NaiveDate, end: NaiveDate) -> Result<Vec<Bar>> {
        (**self).fetch(ticker, start, end)
    }
}

impl<P: DataProvider + ?Sized> DataProvider for Box<P> {
    fn name(&self) -> &str {
        (**self).name()
    }
    fn fetch(&self, ticker: &str, start: NaiveDate, end: NaiveDate) -> Result<Vec<Bar>> {
        (**self).fetch(ticker, start, end)
    }
}

/// Reads bars from a directory of `{TICKER}.csv` files
#[derive(Debug, Clone)]
pub struct CsvProvider {
    /// The directory containing the CSV files
    pub dir: PathBuf,
}

impl CsvProvider {
    /// Create a provider over a directory
    pub fn new(dir: impl Into<PathBuf>) -> CsvProvider {
        CsvProvider { dir: dir.into() }
    }
    /// The path of the file holding a ticker's bars
    pub fn path_for(&self, ticker: &str) -> PathBuf {
        self.dir.join(format!("{}.csv", ticker))
    }
}

impl DataProvider for CsvProvider {
    fn name(&self) -> &str {
        "csv"
    }
    fn fetch(&self, ticker: &str, start: NaiveDate, end: NaiveDate) -> Result<Vec<Bar>> {
        let path = self.path_for(ticker);
        if !path.exists() {
            return Err(Error::SymbolNotFound(ticker.to_string()));
        }
        let bars = load_bars(&path)?;
        let bars: Vec<Bar> = bars
            .into_iter()
            .filter(|bar| bar.date >= start && bar.date <= end)
            .collect();
        if bars.is_empty() {
            warn!(ticker, path = %path.display(), "no bars in requested range");
            return Err(Error::SymbolNotFound(ticker.to_string()));
        }
        Ok(bars)
    }
}

/// Load and clean bars from a CSV file
pub fn load_bars(path: &Path) -> Result<Vec<Bar>> {
    let file = File::open(path)?;
    Ok(clean_bars(store::read_bars(file)?))
}

/// Write bars to a CSV file, returning how many bars were written
pub fn save_bars(path: &Path, bars: &[Bar]) -> Result<usize> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = File::create(path)?;
    store::write_bars(file, bars.iter().copied())
}
