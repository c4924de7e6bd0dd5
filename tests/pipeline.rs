/*!
Run the whole pipeline on synthetic data with a tiny network
*/
use chrono::{NaiveDate, Utc};
use stockcast::config::{Config, ProviderKind};
use stockcast::data::{clean_bars, DataProvider};
use stockcast::experiment::{Experiment, TrainedModel};
use stockcast::features::{engineer, FeatureSet};
use stockcast::forecast::{PredictRequest, PredictionService};
use stockcast::report::{summary_report, TickerResult};
use stockcast::rnn::RnnKind;
use stockcast::sequence::SplitRule;
use stockcast::train::NoObserver;
use tch::Device;

fn tiny_config() -> Config {
    let mut config = Config::default();
    config.data.provider = ProviderKind::Synthetic;
    config.data.start_date = NaiveDate::from_ymd_opt(2020, 1, 1);
    config.data.end_date = Some(NaiveDate::from_ymd_opt(2021, 12, 31).unwrap());
    config.features.horizon = 3;
    config.split.rule = SplitRule::Date(NaiveDate::from_ymd_opt(2021, 9, 1).unwrap());
    config.model.lookback = 15;
    config.model.hidden = 8;
    config.model.kind = RnnKind::Gru;
    config.training.epochs = 3;
    config.training.batch_size = 16;
    config
}

#[test]
fn technical_pipeline_trains_saves_and_forecasts() {
    let config = tiny_config();
    let provider = config.provider().unwrap();
    let (start, end) = config.data.range(NaiveDate::from_ymd_opt(2030, 1, 1).unwrap());
    let bars = clean_bars(provider.fetch("ACME", start, end).unwrap());

    let outcome = Experiment::new(config.clone(), Device::Cpu)
        .run(&bars, NoObserver)
        .unwrap();
    let cut = NaiveDate::from_ymd_opt(2021, 9, 1).unwrap();
    assert!(outcome.model.meta.trained_through < cut);
    assert!(outcome.test.predictions.iter().all(|p| p.date >= cut));
    assert!(outcome.train.predictions.iter().all(|p| p.date < cut));
    assert_eq!(outcome.model.meta.feature_set, FeatureSet::Technical);

    let dir = tempfile::tempdir().unwrap();
    outcome.model.save(dir.path(), "ACME").unwrap();
    let loaded = TrainedModel::load(dir.path(), "ACME", Device::Cpu).unwrap();
    assert_eq!(loaded.meta.desc.kind, RnnKind::Gru);

    let mut service = PredictionService::new(provider, config, Device::Cpu);
    service.insert_model("acme", loaded).unwrap();
    let forecast = service.predict(&PredictRequest::new("ACME", 3)).unwrap();
    assert_eq!(service.cached_models(), 1);
    assert_eq!(forecast.predictions.len(), 3);
    assert_eq!(forecast.model_type, "GRU");
    assert_eq!(forecast.current_price, (bars.last().unwrap().close * 100.0).round() / 100.0);

    let table = engineer(&bars, FeatureSet::Technical, 3).unwrap();
    let result = TickerResult::Trained {
        ticker: "ACME".into(),
        rows: table.len(),
        features: table.width(),
        date_range: table.date_range().unwrap(),
        train: outcome.train.metrics,
        test: outcome.test.metrics,
        best_epoch: outcome.history.best_epoch,
        model_path: None,
    };
    let report = summary_report(&[result], Utc::now());
    assert!(report.contains("ACME:"));
    assert!(report.contains("Models trained: 1/1"));
}
