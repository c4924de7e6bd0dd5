/*!
Plain-text and JSON summaries of training runs over several tickers
*/
use crate::error::{Error, Result};
use crate::metrics::{mean, Metrics};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// The outcome of training a model for one ticker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TickerResult {
    /// A model was trained and evaluated
    Trained {
        /// The ticker symbol
        ticker: String,
        /// Rows in the feature table
        rows: usize,
        /// Feature columns
        features: usize,
        /// First and last feature row dates
        date_range: (NaiveDate, NaiveDate),
        /// In-sample metrics
        train: Metrics,
        /// Holdout metrics
        test: Metrics,
        /// The epoch whose weights were kept
        best_epoch: usize,
        /// Where the weights were saved, if they were
        model_path: Option<PathBuf>,
    },
    /// Something went wrong
    Failed {
        /// The ticker symbol
        ticker: String,
        /// What went wrong
        error: String,
        /// Whether the provider had no data for the ticker
        not_found: bool,
    },
}

impl TickerResult {
    /// Record a failure
    pub fn failed(ticker: impl Into<String>, error: &Error) -> TickerResult {
        TickerResult::Failed {
            ticker: ticker.into(),
            error: error.to_string(),
            not_found: matches!(error, Error::SymbolNotFound(_)),
        }
    }
    /// The ticker symbol
    pub fn ticker(&self) -> &str {
        match self {
            TickerResult::Trained { ticker, .. } | TickerResult::Failed { ticker, .. } => ticker,
        }
    }
    /// The holdout metrics, if a model was trained
    pub fn test_metrics(&self) -> Option<&Metrics> {
        match self {
            TickerResult::Trained { test, .. } => Some(test),
            TickerResult::Failed { .. } => None,
        }
    }
}

const RULE: &str = "================================================================================";
const SECTION: &str = "----------------------------------------";

/// Render a summary of a set of results
pub fn summary_report(results: &[TickerResult], now: DateTime<Utc>) -> String {
    let mut out = String::new();
    if let Err(err) = write_summary(&mut out, results, now) {
        warn!(%err, "summary report is incomplete");
    }
    out
}

fn write_summary(
    out: &mut String,
    results: &[TickerResult],
    now: DateTime<Utc>,
) -> std::fmt::Result {
    writeln!(out, "{}", RULE)?;
    writeln!(out, "STOCK PRICE FORECASTING SUMMARY REPORT")?;
    writeln!(out, "{}", RULE)?;
    writeln!(out, "Generated: {}", now.format("%Y-%m-%d %H:%M:%S"))?;
    writeln!(out)?;

    writeln!(out, "MODEL TRAINING SUMMARY")?;
    writeln!(out, "{}", SECTION)?;
    for result in results {
        match result {
            TickerResult::Trained {
                ticker,
                rows,
                features,
                date_range,
                test,
                best_epoch,
                model_path,
                ..
            } => {
                writeln!(out, "{}:", ticker)?;
                writeln!(out, "  Status: trained")?;
                writeln!(out, "  Rows: {} x {} features", rows, features)?;
                writeln!(out, "  Date range: {} to {}", date_range.0, date_range.1)?;
                writeln!(out, "  Best epoch: {}", best_epoch)?;
                writeln!(out, "  Test R2: {:.4}", test.r2)?;
                writeln!(out, "  Test RMSE: {:.6}", test.rmse)?;
                writeln!(out, "  Test MAPE: {:.2}%", test.mape)?;
                writeln!(out, "  Direction accuracy: {:.2}%", test.directional_accuracy)?;
                if let Some(path) = model_path {
                    writeln!(out, "  Model saved: {}", path.display())?;
                }
            }
            TickerResult::Failed {
                ticker,
                error,
                not_found,
            } => {
                writeln!(out, "{}:", ticker)?;
                if *not_found {
                    writeln!(out, "  Status: data not found")?;
                } else {
                    writeln!(out, "  Status: error - {}", error)?;
                }
            }
        }
        writeln!(out)?;
    }

    let tested: Vec<Metrics> = results.iter().filter_map(|r| r.test_metrics()).copied().collect();
    writeln!(out, "OVERALL SUMMARY")?;
    writeln!(out, "{}", SECTION)?;
    writeln!(out, "Tickers processed: {}", results.len())?;
    writeln!(out, "Models trained: {}/{}", tested.len(), results.len())?;
    let rate = if results.is_empty() {
        0.0
    } else {
        tested.len() as f64 * 100.0 / results.len() as f64
    };
    writeln!(out, "Success rate: {:.1}%", rate)?;

    if let Some(avg) = mean(&tested) {
        writeln!(out)?;
        writeln!(out, "AVERAGE PERFORMANCE ACROSS ALL MODELS")?;
        writeln!(out, "{}", SECTION)?;
        writeln!(out, "Average test R2: {:.4}", avg.r2)?;
        writeln!(out, "Average test MAPE: {:.2}%", avg.mape)?;
        writeln!(out, "Average direction accuracy: {:.2}%", avg.directional_accuracy)?;
    }
    Ok(())
}

/// Write results as pretty-printed JSON
pub fn write_json<W: Write>(wtr: W, results: &[TickerResult]) -> Result<()> {
    serde_json::to_writer_pretty(wtr, results)?;
    Ok(())
}

/// Write `summary_report.txt` and `metrics.json` into a directory, returning their paths
pub fn save_reports(
    dir: &Path,
    results: &[TickerResult],
    now: DateTime<Utc>,
) -> Result<(PathBuf, PathBuf)> {
    std::fs::create_dir_all(dir)?;
    let text = dir.join("summary_report.txt");
    std::fs::write(&text, summary_report(results, now))?;
    let json = dir.join("metrics.json");
    let mut wtr = BufWriter::new(File::create(&json)?);
    write_json(&mut wtr, results)?;
    wtr.flush()?;
    Ok((text, json))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn metrics(r2: f64, directional_accuracy: f64) -> Metrics {
        Metrics {
            mse: 4.0,
            rmse: 2.0,
            mae: 1.5,
            r2,
            mape: 3.0,
            directional_accuracy,
            samples: 50,
        }
    }

    fn results() -> Vec<TickerResult> {
        let date = |m| NaiveDate::from_ymd_opt(2024, m, 1).unwrap();
        vec![
            TickerResult::Trained {
                ticker: "AAPL".into(),
                rows: 500,
                features: 46,
                date_range: (date(1), date(6)),
                train: metrics(0.9, 60.0),
                test: metrics(0.5, 55.0),
                best_epoch: 12,
                model_path: Some(PathBuf::from("models/rnn_model_AAPL.ot")),
            },
            TickerResult::Trained {
                ticker: "MSFT".into(),
                rows: 500,
                features: 46,
                date_range: (date(1), date(6)),
                train: metrics(0.8, 58.0),
                test: metrics(0.3, 45.0),
                best_epoch: 7,
                model_path: None,
            },
            TickerResult::failed("ZZZZ", &Error::SymbolNotFound("ZZZZ".into())),
        ]
    }

    #[test]
    fn summary_lists_every_ticker_and_averages() {
        let now = Utc.with_ymd_and_hms(2025, 3, 4, 5, 6, 7).unwrap();
        let report = summary_report(&results(), now);
        assert!(report.contains("Generated: 2025-03-04 05:06:07"));
        assert!(report.contains("AAPL:"));
        assert!(report.contains("Model saved: models/rnn_model_AAPL.ot"));
        assert!(report.contains("ZZZZ:\n  Status: data not found"));
        assert!(report.contains("Models trained: 2/3"));
        assert!(report.contains("Success rate: 66.7%"));
        assert!(report.contains("Average test R2: 0.4000"));
        assert!(report.contains("Average direction accuracy: 50.00%"));
    }

    #[test]
    fn empty_reports_have_no_averages() {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let report = summary_report(&[], now);
        assert!(report.contains("Success rate: 0.0%"));
        assert!(!report.contains("AVERAGE PERFORMANCE"));
    }

    #[test]
    fn json_is_tagged_by_status() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let (text, json) = save_reports(dir.path(), &results(), now).unwrap();
        assert!(text.exists());
        let parsed: Vec<TickerResult> =
            serde_json::from_reader(File::open(&json).unwrap()).unwrap();
        assert_eq!(parsed, results());
        let raw = std::fs::read_to_string(json).unwrap();
        assert!(raw.contains("\"status\": \"failed\""));
    }
}
