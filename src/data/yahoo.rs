/*!
[Yahoo Finance](https://finance.yahoo.com/) daily bars, via the v8 chart API

Yahoo has no official API and its format changes without notice; the CSV provider is the
fallback when it is unavailable.
*/
use super::{Bar, DataProvider};
use crate::error::{DataError, Error, Result};
use chrono::NaiveDate;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: ChartResult,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    result: Option<Vec<ChartData>>,
    error: Option<ChartError>,
}

#[derive(Debug, Deserialize)]
struct ChartError {
    code: String,
    description: String,
}

#[derive(Debug, Deserialize)]
struct ChartData {
    timestamp: Option<Vec<i64>>,
    indicators: Indicators,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    quote: Vec<QuoteData>,
    adjclose: Option<Vec<AdjCloseData>>,
}

#[derive(Debug, Deserialize)]
struct QuoteData {
    open: Vec<Option<f64>>,
    high: Vec<Option<f64>>,
    low: Vec<Option<f64>>,
    close: Vec<Option<f64>>,
    volume: Vec<Option<f64>>,
}

#[derive(Debug, Deserialize)]
struct AdjCloseData {
    adjclose: Vec<Option<f64>>,
}

/// How failed requests are retried
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// How many times to retry a failed request
    pub max_retries: u32,
    /// The delay before the first retry; doubled on every further retry
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

/// The result of one request
#[derive(Debug)]
pub enum Attempt<T> {
    /// Stop, with this result
    Done(Result<T>),
    /// Try again after a delay, remembering the error in case this was the last try
    Retry(DataError),
}

impl RetryPolicy {
    /// The delay before retry number `attempt`, counting from one
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
    /// Call `send` until it is done or the retries run out
    pub fn run<T>(&self, ticker: &str, mut send: impl FnMut() -> Attempt<T>) -> Result<T> {
        let mut last_error = None;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = self.delay(attempt);
                debug!(ticker, attempt, ?delay, "retrying chart request");
                std::thread::sleep(delay);
            }
            match send() {
                Attempt::Done(result) => return result,
                Attempt::Retry(err) => last_error = Some(err),
            }
        }
        Err(last_error
            .unwrap_or_else(|| DataError::Other("max retries exceeded".into()))
            .into())
    }
}

/// What an HTTP status means for a chart request
///
/// Returns `None` when the body should be parsed. `retry_after` is the raw `Retry-After` header.
pub fn status_attempt(
    ticker: &str,
    status: StatusCode,
    retry_after: Option<&str>,
) -> Option<Attempt<Vec<Bar>>> {
    if status == StatusCode::NOT_FOUND {
        return Some(Attempt::Done(Err(Error::SymbolNotFound(ticker.to_string()))));
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after_secs = retry_after
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(60);
        warn!(ticker, retry_after_secs, "rate limited by Yahoo Finance");
        return Some(Attempt::Retry(DataError::RateLimited { retry_after_secs }));
    }
    if status.is_server_error() {
        return Some(Attempt::Retry(DataError::Other(format!(
            "HTTP {} for {}",
            status, ticker
        ))));
    }
    if !status.is_success() {
        return Some(Attempt::Done(Err(DataError::Other(format!(
            "HTTP {} for {}",
            status, ticker
        ))
        .into())));
    }
    None
}

/// Fetches daily bars from Yahoo Finance
#[derive(Debug, Clone)]
pub struct YahooProvider {
    client: reqwest::blocking::Client,
    /// How failed requests are retried
    pub retry: RetryPolicy,
}

impl YahooProvider {
    /// Create a provider with a 30 second timeout and three retries
    pub fn new() -> Result<YahooProvider> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36")
            .build()?;
        Ok(YahooProvider {
            client,
            retry: RetryPolicy::default(),
        })
    }

    /// Build the chart API URL for a symbol and date range
    pub fn chart_url(ticker: &str, start: NaiveDate, end: NaiveDate) -> String {
        let start_ts = start.and_hms_opt(0, 0, 0).map_or(0, |dt| dt.and_utc().timestamp());
        let end_ts = end
            .and_hms_opt(23, 59, 59)
            .map_or(0, |dt| dt.and_utc().timestamp());
        format!(
            "https://query2.finance.yahoo.com/v8/finance/chart/{ticker}\
             ?period1={start_ts}&period2={end_ts}&interval=1d\
             &includeAdjustedClose=true&events=div%2Csplit"
        )
    }

    /// Parse a chart API response body into bars
    pub fn parse_chart(ticker: &str, body: &str) -> Result<Vec<Bar>> {
        let response: ChartResponse = serde_json::from_str(body).map_err(|err| {
            DataError::ResponseFormatChanged(format!("unparseable chart for {}: {}", ticker, err))
        })?;
        Self::parse_response(ticker, response)
    }

    fn parse_response(ticker: &str, response: ChartResponse) -> Result<Vec<Bar>> {
        let result = match (response.chart.result, response.chart.error) {
            (Some(result), _) => result,
            (None, Some(err)) if err.code == "Not Found" => {
                return Err(Error::SymbolNotFound(ticker.to_string()))
            }
            (None, Some(err)) => {
                return Err(DataError::ResponseFormatChanged(format!(
                    "{}: {}",
                    err.code, err.description
                ))
                .into())
            }
            (None, None) => {
                return Err(
                    DataError::ResponseFormatChanged("empty result with no error".into()).into(),
                )
            }
        };
        let data = result
            .into_iter()
            .next()
            .ok_or_else(|| DataError::ResponseFormatChanged("result array is empty".into()))?;
        // Symbols with no trading history come back without timestamps
        let timestamps = match data.timestamp {
            Some(timestamps) => timestamps,
            None => return Err(Error::SymbolNotFound(ticker.to_string())),
        };
        let quote = data
            .indicators
            .quote
            .into_iter()
            .next()
            .ok_or_else(|| DataError::ResponseFormatChanged("no quote data".into()))?;
        let adj_closes = data
            .indicators
            .adjclose
            .and_then(|v| v.into_iter().next())
            .map(|a| a.adjclose);

        let mut bars = Vec::with_capacity(timestamps.len());
        for (i, &ts) in timestamps.iter().enumerate() {
            let date = chrono::DateTime::from_timestamp(ts, 0)
                .map(|dt| dt.naive_utc().date())
                .ok_or_else(|| {
                    DataError::ResponseFormatChanged(format!("invalid timestamp: {}", ts))
                })?;
            let field = |column: &Vec<Option<f64>>| column.get(i).copied().flatten();
            let (open, high, low, close, volume) = (
                field(&quote.open),
                field(&quote.high),
                field(&quote.low),
                field(&quote.close),
                field(&quote.volume),
            );
            // Holidays and halted days come through with every field missing
            if open.is_none() && high.is_none() && low.is_none() && close.is_none() && volume.is_none()
            {
                continue;
            }
            let close = close.unwrap_or(f64::NAN);
            bars.push(Bar {
                date,
                open: open.unwrap_or(f64::NAN),
                high: high.unwrap_or(f64::NAN),
                low: low.unwrap_or(f64::NAN),
                close,
                adj_close: adj_closes.as_ref().and_then(field).unwrap_or(close),
                volume: volume.unwrap_or(0.0),
            });
        }
        if bars.is_empty() {
            return Err(Error::SymbolNotFound(ticker.to_string()));
        }
        Ok(bars)
    }

    fn send(&self, ticker: &str, url: &str) -> Attempt<Vec<Bar>> {
        let response = match self.client.get(url).send() {
            Ok(response) => response,
            Err(err) if err.is_connect() || err.is_timeout() => {
                return Attempt::Retry(DataError::NetworkUnreachable(err.to_string()))
            }
            Err(err) => {
                return Attempt::Done(Err(DataError::NetworkUnreachable(err.to_string()).into()))
            }
        };
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok());
        if let Some(attempt) = status_attempt(ticker, response.status(), retry_after) {
            return attempt;
        }
        Attempt::Done(
            response
                .text()
                .map_err(Error::from)
                .and_then(|body| Self::parse_chart(ticker, &body)),
        )
    }

    fn fetch_with_retry(&self, ticker: &str, start: NaiveDate, end: NaiveDate) -> Result<Vec<Bar>> {
        let url = Self::chart_url(ticker, start, end);
        self.retry.run(ticker, || self.send(ticker, &url))
    }
}

impl DataProvider for YahooProvider {
    fn name(&self) -> &str {
        "yahoo_finance"
    }
    fn fetch(&self, ticker: &str, start: NaiveDate, end: NaiveDate) -> Result<Vec<Bar>> {
        info!(ticker, %start, %end, "downloading daily bars");
        let bars = self.fetch_with_retry(ticker, start, end)?;
        info!(ticker, bars = bars.len(), "downloaded daily bars");
        Ok(bars)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHART: &str = r#"{
        "chart": {
            "result": [{
                "timestamp": [1704205800, 1704292200, 1704378600],
                "indicators": {
                    "quote": [{
                        "open": [187.15, null, 182.15],
                        "high": [188.44, null, 183.09],
                        "low": [183.89, null, 180.88],
                        "close": [185.64, null, 181.91],
                        "volume": [82488700, null, 71983600]
                    }],
                    "adjclose": [{"adjclose": [184.29, null, 180.59]}]
                }
            }],
            "error": null
        }
    }"#;

    #[test]
    fn parses_chart_and_skips_empty_days() {
        let bars = YahooProvider::parse_chart("AAPL", CHART).unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].date, NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
        assert_eq!(bars[0].close, 185.64);
        assert_eq!(bars[0].adj_close, 184.29);
        assert_eq!(bars[1].volume, 71983600.0);
    }

    #[test]
    fn not_found_maps_to_symbol_not_found() {
        let body = r#"{"chart":{"result":null,"error":{"code":"Not Found","description":"No data found, symbol may be delisted"}}}"#;
        match YahooProvider::parse_chart("ZZZZ", body) {
            Err(Error::SymbolNotFound(symbol)) => assert_eq!(symbol, "ZZZZ"),
            other => panic!("expected SymbolNotFound, got {:?}", other),
        }
    }

    #[test]
    fn garbage_is_a_format_change() {
        match YahooProvider::parse_chart("AAPL", "<html>") {
            Err(Error::Data(DataError::ResponseFormatChanged(_))) => (),
            other => panic!("expected ResponseFormatChanged, got {:?}", other),
        }
    }

    #[test]
    fn chart_url_covers_the_whole_range() {
        let url = YahooProvider::chart_url(
            "MSFT",
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
        );
        assert!(url.contains("/chart/MSFT?"));
        assert!(url.contains("period1=1704067200"));
        assert!(url.contains("period2=1704239999"));
    }

    fn instant() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            base_delay: Duration::ZERO,
        }
    }

    #[test]
    fn statuses_map_to_attempts() {
        match status_attempt("ZZZZ", StatusCode::NOT_FOUND, None) {
            Some(Attempt::Done(Err(Error::SymbolNotFound(symbol)))) => assert_eq!(symbol, "ZZZZ"),
            other => panic!("expected SymbolNotFound, got {:?}", other),
        }
        match status_attempt("AAPL", StatusCode::TOO_MANY_REQUESTS, Some("5")) {
            Some(Attempt::Retry(DataError::RateLimited { retry_after_secs })) => {
                assert_eq!(retry_after_secs, 5)
            }
            other => panic!("expected RateLimited, got {:?}", other),
        }
        match status_attempt("AAPL", StatusCode::TOO_MANY_REQUESTS, None) {
            Some(Attempt::Retry(DataError::RateLimited { retry_after_secs })) => {
                assert_eq!(retry_after_secs, 60)
            }
            other => panic!("expected RateLimited, got {:?}", other),
        }
        assert!(matches!(
            status_attempt("AAPL", StatusCode::SERVICE_UNAVAILABLE, None),
            Some(Attempt::Retry(DataError::Other(_)))
        ));
        assert!(matches!(
            status_attempt("AAPL", StatusCode::FORBIDDEN, None),
            Some(Attempt::Done(Err(Error::Data(DataError::Other(_)))))
        ));
        assert!(status_attempt("AAPL", StatusCode::OK, None).is_none());
    }

    #[test]
    fn backoff_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_millis(500));
        assert_eq!(policy.delay(2), Duration::from_millis(1000));
        assert_eq!(policy.delay(3), Duration::from_millis(2000));
    }

    #[test]
    fn transient_failures_are_retried() {
        let mut calls = 0;
        let result = instant().run("AAPL", || {
            calls += 1;
            if calls < 3 {
                Attempt::Retry(DataError::NetworkUnreachable("timed out".into()))
            } else {
                Attempt::Done(Ok(calls))
            }
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn retries_give_up_with_the_last_error() {
        let mut calls = 0;
        let result: Result<()> = instant().run("AAPL", || {
            calls += 1;
            Attempt::Retry(DataError::RateLimited {
                retry_after_secs: calls,
            })
        });
        assert_eq!(calls, 3);
        match result {
            Err(Error::Data(DataError::RateLimited { retry_after_secs })) => {
                assert_eq!(retry_after_secs, 3)
            }
            other => panic!("expected RateLimited, got {:?}", other),
        }
    }

    #[test]
    fn missing_symbols_are_not_retried() {
        let mut calls = 0;
        let result: Result<()> = instant().run("ZZZZ", || {
            calls += 1;
            match status_attempt("ZZZZ", StatusCode::NOT_FOUND, None) {
                Some(Attempt::Done(Err(err))) => Attempt::Done(Err(err)),
                other => panic!("expected a final error, got {:?}", other),
            }
        });
        assert_eq!(calls, 1);
        assert!(matches!(result, Err(Error::SymbolNotFound(_))));
    }
}
