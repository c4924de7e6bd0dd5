/*!
Generate fake bar data, for testing and offline experiments
*/
use super::{Bar, DataProvider};
use crate::error::{Error, Result};
use crate::util::{is_weekday, next_weekday};
use chrono::NaiveDate;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, LogNormal, Normal};

/// Generate bar data using a price generator and a date generator
#[derive(Debug, Clone)]
pub struct BarGen<D: Iterator<Item = NaiveDate>, P: PriceGen> {
    /// The date generator in use
    pub date_generator: D,
    /// The price generator in use
    pub price_generator: P,
}

/// A trait implemented by price generators
pub trait PriceGen {
    /// Generate the next bar on a given date
    fn bar_on(&mut self, date: NaiveDate) -> Bar;
}

/// Generate fake prices using a geometric random walk
#[derive(Debug, Clone)]
pub struct PriceRandomWalk<R> {
    /// The RNG used by this random walk
    pub rng: R,
    /// The last closing price
    pub price: f64,
    /// The daily log-return distribution
    pub returns: Normal<f64>,
    /// The daily volume distribution
    pub volume: LogNormal<f64>,
    /// The daily volatility, used to size intraday ranges
    pub volatility: f64,
}

impl<R: Rng> PriceRandomWalk<R> {
    /// Create a random walk starting at `price` with a daily drift and volatility
    pub fn new(rng: R, price: f64, drift: f64, volatility: f64) -> Result<PriceRandomWalk<R>> {
        let returns = Normal::new(drift, volatility)
            .map_err(|err| Error::InvalidConfig(format!("random walk volatility: {}", err)))?;
        let volume = LogNormal::new(13.0, 0.4)
            .map_err(|err| Error::InvalidConfig(format!("random walk volume: {}", err)))?;
        Ok(PriceRandomWalk {
            rng,
            price,
            returns,
            volume,
            volatility,
        })
    }
}

impl<R: Rng> PriceGen for PriceRandomWalk<R> {
    fn bar_on(&mut self, date: NaiveDate) -> Bar {
        let open = self.price * (1.0 + self.returns.sample(&mut self.rng) * 0.25);
        let close = self.price * self.returns.sample(&mut self.rng).exp();
        let volatility = self.volatility;
        let wick = |rng: &mut R| 1.0 + rng.gen_range(0.0..1.0) * volatility;
        let high = open.max(close) * wick(&mut self.rng);
        let low = open.min(close) / wick(&mut self.rng);
        let volume = self.volume.sample(&mut self.rng).round();
        self.price = close;
        Bar {
            date,
            open,
            high,
            low,
            close,
            adj_close: close,
            volume,
        }
    }
}

impl<D: Iterator<Item = NaiveDate>, P: PriceGen> Iterator for BarGen<D, P> {
    type Item = Bar;
    fn next(&mut self) -> Option<Bar> {
        let date = self.date_generator.next()?;
        Some(self.price_generator.bar_on(date))
    }
}

/// An endless iterator over weekdays, starting at the first weekday on or after a date
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Weekdays(pub NaiveDate);

impl Iterator for Weekdays {
    type Item = NaiveDate;
    fn next(&mut self) -> Option<NaiveDate> {
        if !is_weekday(self.0) {
            self.0 = next_weekday(self.0);
        }
        let today = self.0;
        self.0 = next_weekday(today);
        Some(today)
    }
}

/// Generate `n` random walk bars starting at a date, using a fixed seed
pub fn random_walk_bars(seed: u64, start: NaiveDate, n: usize) -> Result<Vec<Bar>> {
    let walk = PriceRandomWalk::new(StdRng::seed_from_u64(seed), 100.0, 0.0003, 0.015)?;
    Ok(BarGen {
        date_generator: Weekdays(start),
        price_generator: walk,
    }
    .take(n)
    .collect())
}

/// A provider serving deterministic random walks, one per ticker
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct SyntheticProvider {
    /// The base seed, combined with the ticker
    pub seed: u64,
    /// The price on the first generated day
    pub start_price: f64,
    /// The mean daily log return
    pub drift: f64,
    /// The standard deviation of daily log returns
    pub volatility: f64,
}

impl Default for SyntheticProvider {
    fn default() -> SyntheticProvider {
        SyntheticProvider {
            seed: 42,
            start_price: 100.0,
            drift: 0.0003,
            volatility: 0.015,
        }
    }
}

impl SyntheticProvider {
    /// The seed of a ticker's walk: a 64-bit FNV-1a hash of the ticker, starting from the base seed
    pub fn seed_for(&self, ticker: &str) -> u64 {
        const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
        const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
        ticker
            .bytes()
            .fold(FNV_OFFSET ^ self.seed, |hash, byte| {
                (hash ^ byte as u64).wrapping_mul(FNV_PRIME)
            })
    }
}

impl DataProvider for SyntheticProvider {
    fn name(&self) -> &str {
        "synthetic"
    }
    fn fetch(&self, ticker: &str, start: NaiveDate, end: NaiveDate) -> Result<Vec<Bar>> {
        let rng = StdRng::seed_from_u64(self.seed_for(ticker));
        let walk = PriceRandomWalk::new(rng, self.start_price, self.drift, self.volatility)?;
        let bars: Vec<Bar> = BarGen {
            date_generator: Weekdays(start),
            price_generator: walk,
        }
        .take_while(|bar| bar.date <= end)
        .collect();
        if bars.is_empty() {
            return Err(Error::SymbolNotFound(ticker.to_string()));
        }
        Ok(bars)
    }
}
