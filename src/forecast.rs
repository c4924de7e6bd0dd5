/*!
A cached prediction service: fetch bars, train on demand, and forecast the next trading days
*/
use crate::config::Config;
use crate::data::{clean_bars, validate_ticker, Bar, DataProvider};
use crate::error::{Error, Result};
use crate::experiment::{Experiment, TrainedModel};
use crate::features::engineer;
use crate::train::NoObserver;
use crate::util::{following_weekdays, round_to, safe_div};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tch::Device;
use tracing::{debug, info};

/// The longest forecast the service will make, in trading days
pub const MAX_HORIZON: usize = 30;

/// Closing prices included in a forecast for context
pub const HISTORY_POINTS: usize = 30;

/// Confidence assumed when a model has no holdout directional accuracy
pub const BASE_CONFIDENCE: f64 = 85.0;

/// A forecast request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredictRequest {
    /// The ticker symbol
    pub ticker: String,
    /// Trading days to forecast
    pub horizon: usize,
    /// Whether to retrain even if a model is cached
    pub retrain: bool,
    /// Override the configured number of training epochs
    pub epochs: Option<usize>,
}

impl PredictRequest {
    /// A request for a ticker and horizon using any cached model
    pub fn new(ticker: impl Into<String>, horizon: usize) -> PredictRequest {
        PredictRequest {
            ticker: ticker.into(),
            horizon,
            retrain: false,
            epochs: None,
        }
    }
}

/// A known closing price
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalPoint {
    /// The trading day
    pub date: NaiveDate,
    /// The close, rounded to cents
    pub price: f64,
    /// Whether this is the last known close
    pub is_current: bool,
}

/// A predicted closing price
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictedPoint {
    /// Trading days ahead, starting at one
    pub day: usize,
    /// The trading day
    pub date: NaiveDate,
    /// The predicted close, rounded to cents
    pub price: f64,
}

/// A forecast for one ticker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Forecast {
    /// The ticker symbol
    pub ticker: String,
    /// The last known close
    pub current_price: f64,
    /// The close predicted for the last day of the horizon
    pub predicted_price: f64,
    /// `predicted_price - current_price`
    pub change: f64,
    /// The change as a percentage of the current price
    pub change_percent: f64,
    /// A heuristic confidence, in percent
    pub confidence: f64,
    /// Trading days forecast
    pub horizon: usize,
    /// Recent closes
    pub historical: Vec<HistoricalPoint>,
    /// One prediction per trading day of the horizon
    pub predictions: Vec<PredictedPoint>,
    /// The recurrent cell the model uses
    pub model_type: String,
    /// When the forecast was made
    pub generated_at: DateTime<Utc>,
    /// A one-line description of the forecast
    pub message: String,
}

/// The heuristic confidence of a forecast
///
/// Starts from [`BASE_CONFIDENCE`], or from a holdout directional accuracy when one is given,
/// loses two points per day beyond the first (for at most ten days), and stays within 60 to 99
/// percent.
pub fn confidence(directional_accuracy: Option<f64>, horizon: usize) -> f64 {
    let base = directional_accuracy
        .filter(|accuracy| accuracy.is_finite())
        .unwrap_or(BASE_CONFIDENCE);
    let penalty = 2.0 * horizon.saturating_sub(1).min(10) as f64;
    (base - penalty).clamp(60.0, 99.0)
}

/// Serves forecasts, caching fetched bars by ticker and trained models by ticker and horizon
pub struct PredictionService<P: DataProvider> {
    provider: P,
    config: Config,
    device: Device,
    bars: HashMap<String, Vec<Bar>>,
    models: HashMap<(String, usize), TrainedModel>,
}

impl<P: DataProvider> PredictionService<P> {
    /// Create a service over a provider, training models as described by `config`
    pub fn new(provider: P, config: Config, device: Device) -> PredictionService<P> {
        PredictionService {
            provider,
            config,
            device,
            bars: HashMap::new(),
            models: HashMap::new(),
        }
    }
    /// The configuration models are trained with
    pub fn config(&self) -> &Config {
        &self.config
    }
    /// The number of cached models
    pub fn cached_models(&self) -> usize {
        self.models.len()
    }
    /// Forget every cached bar and model
    pub fn clear_cache(&mut self) {
        self.bars.clear();
        self.models.clear();
    }
    /// Add a trained model to the cache, e.g. one loaded from disk
    pub fn insert_model(&mut self, ticker: &str, model: TrainedModel) -> Result<()> {
        let ticker = validate_ticker(ticker)?;
        self.models.insert((ticker, model.meta.horizon), model);
        Ok(())
    }
    /// A cached model, if there is one
    pub fn model(&self, ticker: &str, horizon: usize) -> Option<&TrainedModel> {
        self.models.get(&(ticker.to_string(), horizon))
    }
    /// Fetch and clean the bars for a ticker, or return the cached ones
    pub fn bars(&mut self, ticker: &str) -> Result<&[Bar]> {
        let ticker = validate_ticker(ticker)?;
        if !self.bars.contains_key(&ticker) {
            let (start, end) = self.config.data.range(Utc::now().date_naive());
            info!(%ticker, provider = self.provider.name(), %start, %end, "fetching bars");
            let bars = clean_bars(self.provider.fetch(&ticker, start, end)?);
            if bars.is_empty() {
                return Err(Error::SymbolNotFound(ticker));
            }
            self.bars.insert(ticker.clone(), bars);
        }
        self.bars
            .get(&ticker)
            .map(|bars| bars.as_slice())
            .ok_or(Error::SymbolNotFound(ticker))
    }
    /// Forecast a ticker, training a model first if none is cached
    pub fn predict(&mut self, request: &PredictRequest) -> Result<Forecast> {
        let ticker = validate_ticker(&request.ticker)?;
        let horizon = request.horizon;
        if !(1..=MAX_HORIZON).contains(&horizon) {
            return Err(Error::InvalidConfig(format!(
                "horizon {} is not between 1 and {} days",
                horizon, MAX_HORIZON
            )));
        }
        let bars = self.bars(&ticker)?.to_vec();
        let key = (ticker.clone(), horizon);

        let mut table = None;
        if request.retrain || !self.models.contains_key(&key) {
            let mut config = self.config.clone();
            config.features.horizon = horizon;
            if let Some(epochs) = request.epochs {
                config.training.epochs = epochs;
            }
            let engineered = engineer(&bars, config.features.set, horizon)?;
            let outcome =
                Experiment::new(config, self.device).run_table(&engineered, NoObserver)?;
            self.models.insert(key.clone(), outcome.model);
            table = Some(engineered);
        } else {
            debug!(%ticker, horizon, "using cached model");
        }
        let model = self
            .models
            .get(&key)
            .ok_or_else(|| Error::InsufficientData(format!("no model for {}", ticker)))?;

        let table = match table {
            Some(table) => table,
            None => engineer(&bars, model.meta.feature_set, horizon)?,
        };
        let prices = model.forecast(&table)?;
        let last = bars
            .last()
            .ok_or_else(|| Error::InsufficientData(format!("no bars for {}", ticker)))?;
        let predicted = *prices
            .last()
            .ok_or_else(|| Error::InsufficientData("empty forecast".into()))?;

        let current = last.close;
        let change = predicted - current;
        let historical = bars[bars.len().saturating_sub(HISTORY_POINTS)..]
            .iter()
            .map(|bar| HistoricalPoint {
                date: bar.date,
                price: round_to(bar.close, 2),
                is_current: bar.date == last.date,
            })
            .collect();
        let predictions = following_weekdays(last.date, horizon)
            .into_iter()
            .zip(&prices)
            .enumerate()
            .map(|(i, (date, price))| PredictedPoint {
                day: i + 1,
                date,
                price: round_to(*price, 2),
            })
            .collect();
        let accuracy = if self.config.forecast.accuracy_confidence {
            model.meta.holdout.map(|m| m.directional_accuracy)
        } else {
            None
        };
        let forecast = Forecast {
            ticker: ticker.clone(),
            current_price: round_to(current, 2),
            predicted_price: round_to(predicted, 2),
            change: round_to(change, 2),
            change_percent: round_to(safe_div(change * 100.0, current, 0.0), 2),
            confidence: round_to(confidence(accuracy, horizon), 1),
            horizon,
            historical,
            predictions,
            model_type: model.meta.desc.kind.to_string(),
            generated_at: Utc::now(),
            message: format!(
                "{} forecast for {} over {} trading day(s)",
                model.meta.desc.kind, ticker, horizon
            ),
        };
        info!(
            %ticker,
            horizon,
            current = forecast.current_price,
            predicted = forecast.predicted_price,
            "made forecast"
        );
        Ok(forecast)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::fake::SyntheticProvider;
    use crate::util::is_weekday;

    fn service() -> PredictionService<SyntheticProvider> {
        let mut config = Config::close_only();
        config.data.start_date = NaiveDate::from_ymd_opt(2020, 1, 1);
        config.data.end_date = Some(NaiveDate::from_ymd_opt(2020, 12, 31).unwrap());
        config.model.lookback = 10;
        config.model.hidden = 4;
        config.model.layers = 1;
        config.model.dense = Some(4);
        config.training.epochs = 1;
        PredictionService::new(SyntheticProvider::default(), config, Device::Cpu)
    }

    #[test]
    fn confidence_is_penalised_and_clamped() {
        assert_eq!(confidence(None, 1), 85.0);
        assert_eq!(confidence(None, 5), 77.0);
        assert_eq!(confidence(None, 11), 65.0);
        assert_eq!(confidence(None, 30), 65.0);
        assert_eq!(confidence(Some(100.0), 1), 99.0);
        assert_eq!(confidence(Some(50.0), 3), 60.0);
        assert_eq!(confidence(Some(f64::NAN), 1), 85.0);
    }

    #[test]
    fn forecasts_step_over_weekends() {
        let mut service = service();
        let forecast = service.predict(&PredictRequest::new("aapl", 7)).unwrap();
        assert_eq!(forecast.ticker, "AAPL");
        assert_eq!(forecast.horizon, 7);
        assert_eq!(forecast.predictions.len(), 7);
        assert_eq!(forecast.historical.len(), HISTORY_POINTS);
        assert_eq!(forecast.model_type, "LSTM");
        assert_eq!(forecast.confidence, 73.0);
        assert!(forecast.message.contains("AAPL"));
        let current: Vec<_> = forecast.historical.iter().filter(|p| p.is_current).collect();
        assert_eq!(current.len(), 1);
        assert!(forecast.historical.last().unwrap().is_current);
        let last = forecast.historical.last().unwrap().date;
        assert!(forecast.predictions[0].date > last);
        for (i, point) in forecast.predictions.iter().enumerate() {
            assert_eq!(point.day, i + 1);
            assert!(is_weekday(point.date));
        }
        assert_eq!(forecast.predicted_price, forecast.predictions[6].price);
    }

    #[test]
    fn models_are_cached_per_horizon() {
        let mut service = service();
        service.predict(&PredictRequest::new("MSFT", 1)).unwrap();
        service.predict(&PredictRequest::new("msft", 1)).unwrap();
        assert_eq!(service.cached_models(), 1);
        service.predict(&PredictRequest::new("MSFT", 2)).unwrap();
        assert_eq!(service.cached_models(), 2);
        let first = service.model("MSFT", 1).unwrap().meta.trained_at;
        let retrain = PredictRequest {
            retrain: true,
            ..PredictRequest::new("MSFT", 1)
        };
        service.predict(&retrain).unwrap();
        assert!(service.model("MSFT", 1).unwrap().meta.trained_at >= first);
        assert_eq!(service.cached_models(), 2);
        service.clear_cache();
        assert_eq!(service.cached_models(), 0);
    }

    #[test]
    fn confidence_ignores_accuracy_unless_asked() {
        let mut fixed = service();
        let forecast = fixed.predict(&PredictRequest::new("IBM", 1)).unwrap();
        assert_eq!(forecast.confidence, 85.0);

        let mut scored = service();
        scored.config.forecast.accuracy_confidence = true;
        let forecast = scored.predict(&PredictRequest::new("IBM", 1)).unwrap();
        let accuracy = scored
            .model("IBM", 1)
            .and_then(|model| model.meta.holdout)
            .map(|metrics| metrics.directional_accuracy);
        assert!(accuracy.is_some());
        assert_eq!(forecast.confidence, round_to(confidence(accuracy, 1), 1));
    }

    #[test]
    fn bad_requests_are_rejected() {
        let mut service = service();
        assert!(matches!(
            service.predict(&PredictRequest::new("AAPL", 0)),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            service.predict(&PredictRequest::new("AAPL", 31)),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            service.predict(&PredictRequest::new("no spaces", 1)),
            Err(Error::InvalidTicker(_))
        ));
    }
}
