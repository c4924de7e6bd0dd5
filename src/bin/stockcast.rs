/*!
Fetch stock data, train recurrent models on it, and forecast closing prices
*/
use anyhow::{format_err, Context};
use chrono::{Duration, NaiveDate, Utc};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use io_enum::{Read, Write};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::fs::File;
use std::io::{stdin, stdout, Stdin, Stdout};
use std::path::{Path, PathBuf};
use stockcast::config::{Config, ProviderKind};
use stockcast::data::fake::SyntheticProvider;
use stockcast::data::store::{read_bars, write_bars};
use stockcast::data::{clean_bars, save_bars, validate_ticker, DataProvider};
use stockcast::experiment::{Experiment, TrainedModel};
use stockcast::features::{engineer, FeatureSet};
use stockcast::forecast::{Forecast, PredictRequest, PredictionService};
use stockcast::report::{save_reports, summary_report, TickerResult};
use stockcast::train::{EpochObserver, EpochStats, TrainHistory};
use stockcast::walk_forward;
use tch::Device;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Read)]
enum IoSources {
    Stdin(Stdin),
    File(File),
}

#[derive(Debug, Write)]
enum IoSinks {
    Stdout(Stdout),
    File(File),
}

fn open_input(path: Option<&Path>) -> anyhow::Result<IoSources> {
    Ok(match path {
        Some(path) => IoSources::File(
            File::open(path).with_context(|| format!("failed to open {}", path.display()))?,
        ),
        None => IoSources::Stdin(stdin()),
    })
}

fn open_output(path: Option<&Path>) -> anyhow::Result<IoSinks> {
    Ok(match path {
        Some(path) => IoSinks::File(
            File::create(path).with_context(|| format!("failed to create {}", path.display()))?,
        ),
        None => IoSinks::Stdout(stdout()),
    })
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
enum DeviceArg {
    Cpu,
    Cuda,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
enum ProviderArg {
    Yahoo,
    Csv,
    Synthetic,
}

impl From<ProviderArg> for ProviderKind {
    fn from(arg: ProviderArg) -> ProviderKind {
        match arg {
            ProviderArg::Yahoo => ProviderKind::Yahoo,
            ProviderArg::Csv => ProviderKind::Csv,
            ProviderArg::Synthetic => ProviderKind::Synthetic,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "stockcast", version)]
#[command(author = "Jad Ghalayini <jad.ghalayini@hotmail.com>")]
#[command(about = "Recurrent networks which attempt to forecast stock closing prices")]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbosity level; repeat for more
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Device to train on
    #[arg(short, long, value_enum, default_value_t = DeviceArg::Cuda, global = true)]
    device: DeviceArg,

    /// Where to fetch bars from, overriding the configuration
    #[arg(short, long, value_enum, global = true)]
    provider: Option<ProviderArg>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Download daily bars into the data directory
    Fetch {
        /// Ticker symbols
        #[arg(required = true)]
        tickers: Vec<String>,
        /// First date to fetch (defaults to five years ago)
        #[arg(long)]
        start: Option<NaiveDate>,
        /// Last date to fetch (defaults to today)
        #[arg(long)]
        end: Option<NaiveDate>,
    },
    /// Engineer a feature table from a bar CSV file (or standard input)
    Features {
        /// Input bars
        input: Option<PathBuf>,
        /// Days of targets per row
        #[arg(long)]
        horizon: Option<usize>,
        /// Use the last close as the only feature
        #[arg(long)]
        close_only: bool,
        /// Output file (defaults to standard output)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Train, evaluate and save a model per ticker, then write a summary report
    Train {
        /// Ticker symbols
        #[arg(required = true)]
        tickers: Vec<String>,
        /// Override the number of epochs
        #[arg(short, long)]
        epochs: Option<usize>,
        /// Do not save models
        #[arg(long)]
        no_save: bool,
    },
    /// Run walk-forward validation for a ticker
    WalkForward {
        /// Ticker symbol
        ticker: String,
        /// Override the number of folds
        #[arg(long)]
        folds: Option<usize>,
        /// Override the number of epochs
        #[arg(short, long)]
        epochs: Option<usize>,
        /// Write the full report as JSON
        #[arg(long)]
        json: Option<PathBuf>,
    },
    /// Forecast the next trading days of a ticker
    Predict {
        /// Ticker symbol
        ticker: String,
        /// Trading days to forecast
        #[arg(long, default_value_t = 1)]
        horizon: usize,
        /// Train a fresh model even if a saved one exists
        #[arg(long)]
        retrain: bool,
        /// Override the number of epochs
        #[arg(short, long)]
        epochs: Option<usize>,
        /// Print the forecast as JSON
        #[arg(long)]
        json: bool,
    },
    /// Generate synthetic bars as CSV
    Synth {
        /// Ticker symbol, which seeds the walk together with `--seed`
        #[arg(default_value = "SYNTH")]
        ticker: String,
        /// Number of trading days
        #[arg(long, default_value_t = 500)]
        days: usize,
        /// Base seed
        #[arg(long, default_value_t = 42)]
        seed: u64,
        /// First date
        #[arg(long)]
        start: Option<NaiveDate>,
        /// Output file (defaults to standard output)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Prompt for tickers and train them one at a time
    Interactive,
}

/// Drives an `indicatif` progress bar from training progress
struct ProgressObserver {
    bar: ProgressBar,
}

impl ProgressObserver {
    fn new(label: &str) -> anyhow::Result<ProgressObserver> {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{prefix:>8} {wide_bar} {pos:>4}/{len:4} {msg}")?,
        );
        bar.set_prefix(label.to_string());
        Ok(ProgressObserver { bar })
    }
}

impl EpochObserver for ProgressObserver {
    fn on_start(&mut self, epochs: usize) {
        self.bar.reset();
        self.bar.set_length(epochs as u64);
        self.bar.set_message("no loss");
    }
    fn on_epoch(&mut self, stats: &EpochStats) {
        self.bar.inc(1);
        match stats.validation_loss {
            Some(validation) => self.bar.set_message(format!(
                "loss = {:.5}, validation = {:.5}",
                stats.train_loss, validation
            )),
            None => self
                .bar
                .set_message(format!("loss = {:.5}", stats.train_loss)),
        }
    }
    fn on_finish(&mut self, history: &TrainHistory) {
        self.bar.finish_and_clear();
        if history.stopped_early {
            info!(
                epochs = history.epochs.len(),
                best_epoch = history.best_epoch,
                "stopped early"
            );
        }
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn fetch_range(config: &Config) -> (NaiveDate, NaiveDate) {
    config.data.range(Utc::now().date_naive())
}

/// Fetch, train, evaluate and optionally save a model for one ticker
fn train_ticker(
    config: &Config,
    provider: &dyn DataProvider,
    ticker: &str,
    device: Device,
    save: bool,
) -> stockcast::Result<TickerResult> {
    let ticker = validate_ticker(ticker)?;
    let (start, end) = fetch_range(config);
    let bars = clean_bars(provider.fetch(&ticker, start, end)?);
    let table = engineer(&bars, config.features.set, config.features.horizon)?;
    let observer = ProgressObserver::new(&ticker)
        .map_err(|err| stockcast::Error::InvalidConfig(err.to_string()))?;
    let outcome = Experiment::new(config.clone(), device).run_table(&table, observer)?;
    let model_path = if save {
        Some(outcome.model.save(&config.paths.models_dir, &ticker)?)
    } else {
        None
    };
    let date_range = table
        .date_range()
        .ok_or_else(|| stockcast::Error::InsufficientData("empty feature table".into()))?;
    Ok(TickerResult::Trained {
        ticker,
        rows: table.len(),
        features: table.width(),
        date_range,
        train: outcome.train.metrics,
        test: outcome.test.metrics,
        best_epoch: outcome.history.best_epoch,
        model_path,
    })
}

fn print_result(result: &TickerResult) {
    match result {
        TickerResult::Trained {
            ticker,
            test,
            model_path,
            ..
        } => {
            println!("{}: {}", ticker, test);
            if let Some(path) = model_path {
                println!("  model saved to {}", path.display());
            }
        }
        TickerResult::Failed { ticker, error, .. } => println!("{}: failed: {}", ticker, error),
    }
}

fn print_forecast(forecast: &Forecast) {
    println!(
        "{}: {:.2} -> {:.2} ({:+.2}, {:+.2}%) over {} trading day(s), confidence {:.1}% [{}]",
        forecast.ticker,
        forecast.current_price,
        forecast.predicted_price,
        forecast.change,
        forecast.change_percent,
        forecast.horizon,
        forecast.confidence,
        forecast.model_type
    );
    for point in &forecast.predictions {
        println!("  day {:>2} {} {:.2}", point.day, point.date, point.price);
    }
}

fn run_train(
    config: &Config,
    tickers: &[String],
    device: Device,
    save: bool,
) -> anyhow::Result<()> {
    let provider = config.provider()?;
    let mut results = Vec::with_capacity(tickers.len());
    for ticker in tickers {
        let result = match train_ticker(config, provider.as_ref(), ticker, device, save) {
            Ok(result) => result,
            Err(err) => {
                warn!(%ticker, %err, "training failed");
                TickerResult::failed(ticker.trim().to_uppercase(), &err)
            }
        };
        print_result(&result);
        results.push(result);
    }
    let (text, json) = save_reports(&config.paths.reports_dir, &results, Utc::now())?;
    info!(report = %text.display(), metrics = %json.display(), "wrote reports");
    print!("{}", summary_report(&results, Utc::now()));
    Ok(())
}

fn run_interactive(config: &Config, device: Device) -> anyhow::Result<()> {
    let provider = config.provider()?;
    let mut rl = DefaultEditor::new()?;
    println!("Stock price forecasting with recurrent networks");
    loop {
        let ticker = loop {
            match rl.readline("Enter a stock ticker (e.g. AAPL, MSFT, GOOGL): ") {
                Ok(line) => match validate_ticker(&line) {
                    Ok(ticker) => break ticker,
                    Err(_) => eprintln!("Please enter a valid ticker symbol."),
                },
                Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => return Ok(()),
                Err(err) => return Err(err.into()),
            }
        };
        let result = train_ticker(config, provider.as_ref(), &ticker, device, true)
            .unwrap_or_else(|err| TickerResult::failed(ticker.clone(), &err));
        print_result(&result);
        let another = loop {
            match rl.readline("Would you like to process another ticker? (y/n): ") {
                Ok(line) => match line.trim().to_lowercase().as_str() {
                    "y" | "yes" => break true,
                    "n" | "no" => break false,
                    _ => eprintln!("Please enter 'y' or 'n'."),
                },
                Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break false,
                Err(err) => return Err(err.into()),
            }
        };
        if !another {
            return Ok(());
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let device = match cli.device {
        DeviceArg::Cuda => Device::cuda_if_available(),
        DeviceArg::Cpu => Device::Cpu,
    };
    info!(?device, "selected device");

    let mut config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(provider) = cli.provider {
        config.data.provider = provider.into();
    }

    match cli.command {
        Command::Fetch { tickers, start, end } => {
            let (default_start, default_end) =
                stockcast::data::default_range(Utc::now().date_naive());
            let start = start.unwrap_or(default_start);
            let end = end.unwrap_or(default_end);
            if end < start {
                return Err(format_err!("end date {} is before start date {}", end, start));
            }
            let provider = config.provider()?;
            for ticker in &tickers {
                let ticker = validate_ticker(ticker)?;
                let bars = clean_bars(provider.fetch(&ticker, start, end)?);
                let path = config.paths.data_dir.join(format!("{}.csv", ticker));
                let written = save_bars(&path, &bars)?;
                println!("{}: wrote {} bars to {}", ticker, written, path.display());
            }
        }
        Command::Features {
            input,
            horizon,
            close_only,
            output,
        } => {
            let bars = clean_bars(read_bars(open_input(input.as_deref())?)?);
            if bars.is_empty() {
                return Err(format_err!("no bars could be read"));
            }
            let set = if close_only {
                FeatureSet::CloseOnly
            } else {
                config.features.set
            };
            let table = engineer(&bars, set, horizon.unwrap_or(config.features.horizon))?;
            let rows = table.write_csv(open_output(output.as_deref())?)?;
            info!(rows, features = table.width(), "wrote feature table");
        }
        Command::Train {
            tickers,
            epochs,
            no_save,
        } => {
            if let Some(epochs) = epochs {
                config.training.epochs = epochs;
            }
            config.validate()?;
            run_train(&config, &tickers, device, !no_save)?;
        }
        Command::WalkForward {
            ticker,
            folds,
            epochs,
            json,
        } => {
            if let Some(folds) = folds {
                config.walk_forward.folds = folds;
            }
            if let Some(epochs) = epochs {
                config.training.epochs = epochs;
            }
            config.validate()?;
            let ticker = validate_ticker(&ticker)?;
            let (start, end) = fetch_range(&config);
            let bars = clean_bars(config.provider()?.fetch(&ticker, start, end)?);
            let table = engineer(&bars, config.features.set, config.features.horizon)?;
            let observer = ProgressObserver::new(&ticker)?;
            let report = walk_forward::run(&config, &table, device, observer)?;
            for fold in &report.folds {
                println!(
                    "fold {} ({} to {}): {}",
                    fold.fold.index, fold.test_dates.0, fold.test_dates.1, fold.test
                );
            }
            println!("mean:   {}", report.mean);
            println!("pooled: {}", report.pooled);
            if let Some(path) = json {
                serde_json::to_writer_pretty(File::create(&path)?, &report)?;
                info!(path = %path.display(), "wrote walk-forward report");
            }
        }
        Command::Predict {
            ticker,
            horizon,
            retrain,
            epochs,
            json,
        } => {
            // Without a configuration file the service uses the lightweight close-only setup
            if cli.config.is_none() {
                let provider = config.data.provider;
                config = Config::close_only();
                config.data.provider = provider;
            }
            let ticker = validate_ticker(&ticker)?;
            let models_dir = config.paths.models_dir.clone();
            let mut service = PredictionService::new(config.provider()?, config, device);
            if !retrain {
                match TrainedModel::load(&models_dir, &ticker, device) {
                    Ok(model) if model.meta.horizon == horizon => {
                        info!(%ticker, "using saved model");
                        service.insert_model(&ticker, model)?;
                    }
                    Ok(_) => info!(%ticker, "saved model has a different horizon"),
                    Err(err) => info!(%ticker, %err, "no usable saved model"),
                }
            }
            let forecast = service.predict(&PredictRequest {
                ticker,
                horizon,
                retrain,
                epochs,
            })?;
            if json {
                println!("{}", serde_json::to_string_pretty(&forecast)?);
            } else {
                print_forecast(&forecast);
            }
        }
        Command::Synth {
            ticker,
            days,
            seed,
            start,
            output,
        } => {
            let ticker = validate_ticker(&ticker)?;
            let start = start.unwrap_or_else(|| {
                Utc::now().date_naive() - Duration::days(days as i64 * 7 / 5 + 7)
            });
            let provider = SyntheticProvider {
                seed,
                ..SyntheticProvider::default()
            };
            let end = start + Duration::days(days as i64 * 2 + 7);
            let mut bars = provider.fetch(&ticker, start, end)?;
            bars.truncate(days);
            let written = write_bars(open_output(output.as_deref())?, bars.into_iter())?;
            info!(%ticker, written, "generated synthetic bars");
        }
        Command::Interactive => {
            config.validate()?;
            run_interactive(&config, device)?;
        }
    }
    Ok(())
}
