/*!
Technical indicators over a bar series

[`technical_series`] walks the bars once, feeding streaming `ta` indicators, and records the
indicator values known at the close of every bar. Entry `i` only ever depends on `bars[..=i]`.
*/
use crate::data::Bar;
use crate::error::{Error, Result};
use crate::util::safe_div;
use std::fmt::Debug;
use ta::indicators::{
    AverageTrueRange, BollingerBands, ExponentialMovingAverage, Maximum, Minimum, MoneyFlowIndex,
    OnBalanceVolume, RelativeStrengthIndex, SimpleMovingAverage, SlowStochastic,
    StandardDeviation,
};
use ta::Next;

/// Bars needed before every technical indicator is warmed up
pub const WARMUP: usize = 50;

/// The names of the technical columns, in output order
pub const TECHNICAL_COLUMNS: &[&str] = &[
    "close",
    "open",
    "high",
    "low",
    "log_volume",
    "adj_close_ratio",
    "return_1d",
    "return_5d",
    "return_10d",
    "return_20d",
    "return_lag_1",
    "return_lag_2",
    "return_lag_3",
    "return_lag_4",
    "return_lag_5",
    "volatility_10d",
    "volatility_20d",
    "sma_5_dist",
    "sma_10_dist",
    "sma_20_dist",
    "sma_50_dist",
    "ema_12_dist",
    "ema_26_dist",
    "macd",
    "macd_signal",
    "macd_histogram",
    "rsi_14",
    "stoch_k",
    "stoch_d",
    "bollinger_percent_b",
    "bollinger_width",
    "atr_14",
    "price_std_20",
    "volume_ratio_20",
    "volume_change",
    "obv_slope_5",
    "mfi_14",
    "range_position_14",
    "intraday_range",
    "body",
    "upper_shadow",
    "lower_shadow",
    "overnight_gap",
];

fn indicator<T, E: Debug>(built: std::result::Result<T, E>) -> Result<T> {
    built.map_err(|err| Error::InvalidConfig(format!("bad indicator parameters: {:?}", err)))
}

/// The streaming indicators feeding the technical columns
#[derive(Debug, Clone)]
struct Indicators {
    sma_5: SimpleMovingAverage,
    sma_10: SimpleMovingAverage,
    sma_20: SimpleMovingAverage,
    sma_50: SimpleMovingAverage,
    ema_12: ExponentialMovingAverage,
    ema_26: ExponentialMovingAverage,
    macd_signal: ExponentialMovingAverage,
    rsi: RelativeStrengthIndex,
    stoch_k: SlowStochastic,
    stoch_d: SimpleMovingAverage,
    bollinger: BollingerBands,
    atr: AverageTrueRange,
    price_std: StandardDeviation,
    volatility_10: StandardDeviation,
    volatility_20: StandardDeviation,
    volume_sma: SimpleMovingAverage,
    obv: OnBalanceVolume,
    mfi: MoneyFlowIndex,
    max_14: Maximum,
    min_14: Minimum,
}

impl Indicators {
    fn new() -> Result<Indicators> {
        Ok(Indicators {
            sma_5: indicator(SimpleMovingAverage::new(5))?,
            sma_10: indicator(SimpleMovingAverage::new(10))?,
            sma_20: indicator(SimpleMovingAverage::new(20))?,
            sma_50: indicator(SimpleMovingAverage::new(50))?,
            ema_12: indicator(ExponentialMovingAverage::new(12))?,
            ema_26: indicator(ExponentialMovingAverage::new(26))?,
            macd_signal: indicator(ExponentialMovingAverage::new(9))?,
            rsi: indicator(RelativeStrengthIndex::new(14))?,
            stoch_k: indicator(SlowStochastic::new(14, 3))?,
            stoch_d: indicator(SimpleMovingAverage::new(3))?,
            bollinger: indicator(BollingerBands::new(20, 2.0))?,
            atr: indicator(AverageTrueRange::new(14))?,
            price_std: indicator(StandardDeviation::new(20))?,
            volatility_10: indicator(StandardDeviation::new(10))?,
            volatility_20: indicator(StandardDeviation::new(20))?,
            volume_sma: indicator(SimpleMovingAverage::new(20))?,
            obv: OnBalanceVolume::new(),
            mfi: indicator(MoneyFlowIndex::new(14))?,
            max_14: indicator(Maximum::new(14))?,
            min_14: indicator(Minimum::new(14))?,
        })
    }
}

/// Compute the technical columns for every bar
///
/// Entry `i` holds the values known at the close of `bars[i]`, in [`TECHNICAL_COLUMNS`] order.
/// Entries before the indicators are warmed up are filled with NaN.
pub fn technical_series(bars: &[Bar]) -> Result<Vec<Vec<f64>>> {
    let mut ind = Indicators::new()?;
    let mut series = Vec::with_capacity(bars.len());
    let mut returns: Vec<f64> = Vec::with_capacity(bars.len());
    let mut obvs: Vec<f64> = Vec::with_capacity(bars.len());

    for (i, bar) in bars.iter().enumerate() {
        let c = bar.close;
        let prev = if i > 0 { Some(&bars[i - 1]) } else { None };
        let ret_over = |k: usize| {
            if i >= k {
                safe_div(c, bars[i - k].close, f64::NAN) - 1.0
            } else {
                f64::NAN
            }
        };
        let ret_1 = ret_over(1);
        returns.push(ret_1);
        let lagged = |k: usize| if i >= k { returns[i - k] } else { f64::NAN };

        // Step 1: feed every indicator, in bar order
        let sma_5 = ind.sma_5.next(c);
        let sma_10 = ind.sma_10.next(c);
        let sma_20 = ind.sma_20.next(c);
        let sma_50 = ind.sma_50.next(c);
        let ema_12 = ind.ema_12.next(c);
        let ema_26 = ind.ema_26.next(c);
        let macd = ema_12 - ema_26;
        let macd_signal = ind.macd_signal.next(macd);
        let rsi = ind.rsi.next(c);
        let stoch_k = ind.stoch_k.next(c);
        let stoch_d = ind.stoch_d.next(stoch_k);
        let bands = ind.bollinger.next(c);
        let atr = ind.atr.next(bar);
        let price_std = ind.price_std.next(c);
        let (volatility_10, volatility_20) = if ret_1.is_finite() {
            (ind.volatility_10.next(ret_1), ind.volatility_20.next(ret_1))
        } else {
            (f64::NAN, f64::NAN)
        };
        let volume_sma = ind.volume_sma.next(bar.volume);
        let obv = ind.obv.next(bar);
        obvs.push(obv);
        let mfi = ind.mfi.next(bar);
        let max_14 = ind.max_14.next(bar.high);
        let min_14 = ind.min_14.next(bar.low);

        // Step 2: hold back everything until the slowest indicator has a full window
        if i + 1 < WARMUP {
            series.push(vec![f64::NAN; TECHNICAL_COLUMNS.len()]);
            continue;
        }

        // Step 3: normalize into scale-free columns
        let obv_slope = if i >= 5 {
            safe_div(obvs[i] - obvs[i - 5], 5.0 * volume_sma, 0.0)
        } else {
            f64::NAN
        };
        let prev_close = prev.map_or(f64::NAN, |p| p.close);
        let prev_volume = prev.map_or(f64::NAN, |p| p.volume);
        let band_width = bands.upper - bands.lower;
        series.push(vec![
            c,
            bar.open,
            bar.high,
            bar.low,
            bar.volume.ln_1p(),
            safe_div(bar.adj_close, c, 1.0),
            ret_1,
            ret_over(5),
            ret_over(10),
            ret_over(20),
            lagged(1),
            lagged(2),
            lagged(3),
            lagged(4),
            lagged(5),
            volatility_10,
            volatility_20,
            safe_div(sma_5, c, f64::NAN) - 1.0,
            safe_div(sma_10, c, f64::NAN) - 1.0,
            safe_div(sma_20, c, f64::NAN) - 1.0,
            safe_div(sma_50, c, f64::NAN) - 1.0,
            safe_div(ema_12, c, f64::NAN) - 1.0,
            safe_div(ema_26, c, f64::NAN) - 1.0,
            safe_div(macd * 100.0, c, f64::NAN),
            safe_div(macd_signal * 100.0, c, f64::NAN),
            safe_div((macd - macd_signal) * 100.0, c, f64::NAN),
            (rsi - 50.0) / 50.0,
            (stoch_k - 50.0) / 50.0,
            (stoch_d - 50.0) / 50.0,
            safe_div(c - bands.lower, band_width, 0.5),
            safe_div(band_width, sma_20, 0.0),
            safe_div(atr, c, f64::NAN),
            safe_div(price_std, c, f64::NAN),
            safe_div(bar.volume, volume_sma, 1.0),
            safe_div(bar.volume, prev_volume, 1.0) - 1.0,
            obv_slope,
            (mfi - 50.0) / 50.0,
            safe_div(c - min_14, max_14 - min_14, 0.5),
            safe_div(bar.high - bar.low, c, f64::NAN),
            safe_div(c - bar.open, bar.open, f64::NAN),
            safe_div(bar.high - bar.open.max(c), c, f64::NAN),
            safe_div(bar.open.min(c) - bar.low, c, f64::NAN),
            safe_div(bar.open, prev_close, f64::NAN) - 1.0,
        ]);
    }
    Ok(series)
}
