/*!
Run configuration, read from and written to TOML
*/
use crate::data::fake::SyntheticProvider;
use crate::data::yahoo::YahooProvider;
use crate::data::{default_range, CsvProvider, DataProvider};
use crate::error::{Error, Result};
use crate::features::FeatureSet;
use crate::rnn::{LossKind, RnnKind, StockRnnDesc};
use crate::sequence::SplitRule;
use crate::train::TrainConfig;
use crate::walk_forward::WalkForwardConfig;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Where bars come from
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// The Yahoo Finance chart API
    Yahoo,
    /// `{TICKER}.csv` files in the data directory
    Csv,
    /// Seeded random walks
    Synthetic,
}

/// Data source settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// The provider to fetch bars from
    pub provider: ProviderKind,
    /// The first date to fetch, defaulting to five years before the end date
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_date: Option<NaiveDate>,
    /// The last date to fetch, defaulting to today
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_date: Option<NaiveDate>,
    /// The seed of the synthetic provider
    pub seed: u64,
}

impl Default for DataConfig {
    fn default() -> DataConfig {
        DataConfig {
            provider: ProviderKind::Yahoo,
            start_date: None,
            end_date: None,
            seed: 42,
        }
    }
}

impl DataConfig {
    /// The dates to fetch, given today's date
    pub fn range(&self, today: NaiveDate) -> (NaiveDate, NaiveDate) {
        let (rolling_start, end) = default_range(self.end_date.unwrap_or(today));
        (self.start_date.unwrap_or(rolling_start), end)
    }
}

/// Feature engineering settings
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    /// The feature set to engineer
    pub set: FeatureSet,
    /// The number of trading days predicted
    pub horizon: usize,
}

impl Default for FeatureConfig {
    fn default() -> FeatureConfig {
        FeatureConfig {
            set: FeatureSet::Technical,
            horizon: 1,
        }
    }
}

/// Holdout split settings
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitConfig {
    /// Fraction of training rows held back for early stopping
    pub validation_fraction: f64,
    /// How test rows are chosen
    pub rule: SplitRule,
}

impl Default for SplitConfig {
    fn default() -> SplitConfig {
        SplitConfig {
            validation_fraction: 0.1,
            rule: SplitRule::Date(NaiveDate::from_ymd_opt(2025, 1, 1).unwrap_or_default()),
        }
    }
}

/// Network shape settings
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Rows per lookback window
    pub lookback: usize,
    /// The recurrent cell
    pub kind: RnnKind,
    /// Hidden units per recurrent layer
    pub hidden: usize,
    /// Stacked recurrent layers
    pub layers: usize,
    /// Dropout probability
    pub dropout: f64,
    /// Whether dropout is also applied to the pooled recurrent state
    pub pool_dropout: bool,
    /// Whether to pool time steps with attention
    pub attention: bool,
    /// Width of an optional dense layer before the head
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dense: Option<usize>,
}

impl Default for ModelConfig {
    fn default() -> ModelConfig {
        ModelConfig {
            lookback: 60,
            kind: RnnKind::Lstm,
            hidden: 64,
            layers: 1,
            dropout: 0.5,
            pool_dropout: true,
            attention: true,
            dense: None,
        }
    }
}

impl ModelConfig {
    /// The model descriptor for a number of input features and predicted days
    pub fn desc(&self, inputs: usize, outputs: usize) -> StockRnnDesc {
        StockRnnDesc {
            inputs,
            hidden: self.hidden,
            layers: self.layers,
            dropout: self.dropout,
            pool_dropout: self.pool_dropout,
            kind: self.kind,
            attention: self.attention,
            dense: self.dense,
            outputs,
        }
    }
}

/// Output locations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathConfig {
    /// Where bar CSV files are read and written
    pub data_dir: PathBuf,
    /// Where model weights and metadata are written
    pub models_dir: PathBuf,
    /// Where reports are written
    pub reports_dir: PathBuf,
}

impl Default for PathConfig {
    fn default() -> PathConfig {
        PathConfig {
            data_dir: PathBuf::from("data"),
            models_dir: PathBuf::from("models"),
            reports_dir: PathBuf::from("reports"),
        }
    }
}

/// Forecast service settings
#[derive(Debug, Copy, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForecastConfig {
    /// Start confidence from the holdout directional accuracy instead of a fixed base
    pub accuracy_confidence: bool,
}

/// The complete configuration of a run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data source settings
    pub data: DataConfig,
    /// Feature engineering settings
    pub features: FeatureConfig,
    /// Holdout split settings
    pub split: SplitConfig,
    /// Network shape settings
    pub model: ModelConfig,
    /// Optimisation settings
    pub training: TrainConfig,
    /// Walk-forward settings
    pub walk_forward: WalkForwardConfig,
    /// Forecast service settings
    pub forecast: ForecastConfig,
    /// Output locations
    pub paths: PathConfig,
}

impl Config {
    /// The lightweight close-price-only setup used by the prediction service
    ///
    /// Fetches the last five years, trains for every epoch with plain Adam and no validation
    /// set, and only applies dropout after the dense layer.
    pub fn close_only() -> Config {
        Config {
            features: FeatureConfig {
                set: FeatureSet::CloseOnly,
                horizon: 1,
            },
            split: SplitConfig {
                validation_fraction: 0.0,
                rule: SplitRule::Ratio(0.9),
            },
            model: ModelConfig {
                lookback: 100,
                kind: RnnKind::Lstm,
                hidden: 64,
                layers: 2,
                dropout: 0.5,
                pool_dropout: false,
                attention: false,
                dense: Some(128),
            },
            training: TrainConfig {
                epochs: 50,
                weight_decay: 0.0,
                patience: 0,
                gradient_clip: 0.0,
                loss: LossKind::Mae,
                ..TrainConfig::default()
            },
            ..Config::default()
        }
    }
    /// Parse a configuration from TOML
    pub fn from_toml(text: &str) -> Result<Config> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }
    /// Load a configuration file
    pub fn load(path: &Path) -> Result<Config> {
        Config::from_toml(&std::fs::read_to_string(path)?)
    }
    /// Write this configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }
    /// Check that every setting is usable
    pub fn validate(&self) -> Result<()> {
        if self.features.horizon == 0 {
            return Err(Error::InvalidConfig("horizon must be at least one day".into()));
        }
        if self.model.lookback == 0 {
            return Err(Error::InvalidConfig("lookback must be at least one row".into()));
        }
        if self.model.hidden == 0 || self.model.layers == 0 {
            return Err(Error::InvalidConfig(
                "models need at least one layer of at least one unit".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.model.dropout) {
            return Err(Error::InvalidConfig(format!(
                "dropout {} is not in [0, 1)",
                self.model.dropout
            )));
        }
        if !(0.0..1.0).contains(&self.split.validation_fraction) {
            return Err(Error::InvalidConfig(format!(
                "validation fraction {} is not in [0, 1)",
                self.split.validation_fraction
            )));
        }
        if let (Some(start), Some(end)) = (self.data.start_date, self.data.end_date) {
            if end < start {
                return Err(Error::InvalidConfig(format!(
                    "end date {} is before start date {}",
                    end, start
                )));
            }
        }
        self.training.validate()?;
        self.walk_forward.validate()
    }
    /// The provider this configuration fetches bars from
    pub fn provider(&self) -> Result<Box<dyn DataProvider>> {
        Ok(match self.data.provider {
            ProviderKind::Yahoo => Box::new(YahooProvider::new()?),
            ProviderKind::Csv => Box::new(CsvProvider::new(&self.paths.data_dir)),
            ProviderKind::Synthetic => Box::new(SyntheticProvider {
                seed: self.data.seed,
                ..SyntheticProvider::default()
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.model.lookback, 60);
        assert_eq!(config.model.hidden, 64);
        assert_eq!(config.model.layers, 1);
        assert_eq!(config.model.dropout, 0.5);
        assert!(config.model.attention);
        assert_eq!(config.training.epochs, 100);
        assert_eq!(config.training.patience, 7);
        assert_eq!(
            config.split.rule,
            SplitRule::Date(NaiveDate::from_ymd_opt(2025, 1, 1).unwrap())
        );
        config.validate().unwrap();
        Config::close_only().validate().unwrap();
    }

    #[test]
    fn close_only_trains_like_the_service() {
        let config = Config::close_only();
        assert_eq!(config.features.set, FeatureSet::CloseOnly);
        assert_eq!(config.data.start_date, None);
        assert_eq!(config.split.validation_fraction, 0.0);
        assert_eq!(config.training.epochs, 50);
        assert_eq!(config.training.patience, 0);
        assert_eq!(config.training.weight_decay, 0.0);
        assert_eq!(config.training.gradient_clip, 0.0);
        assert_eq!(config.training.loss, LossKind::Mae);
        assert_eq!(config.model.dense, Some(128));
        assert!(!config.model.pool_dropout);
        assert!(!config.model.desc(1, 1).pool_dropout);
        assert!(!config.forecast.accuracy_confidence);
    }

    #[test]
    fn fetch_ranges_default_to_five_years() {
        let today = NaiveDate::from_ymd_opt(2025, 6, 30).unwrap();
        let rolling = Config::close_only().data;
        assert_eq!(
            rolling.range(today),
            (NaiveDate::from_ymd_opt(2020, 6, 30).unwrap(), today)
        );
        let fixed = DataConfig {
            start_date: NaiveDate::from_ymd_opt(2020, 1, 1),
            end_date: NaiveDate::from_ymd_opt(2024, 12, 31),
            ..DataConfig::default()
        };
        assert_eq!(
            fixed.range(today),
            (
                NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
                NaiveDate::from_ymd_opt(2024, 12, 31).unwrap()
            )
        );
    }

    #[test]
    fn partial_files_fill_in_defaults() {
        let config = Config::from_toml(
            r#"
            [model]
            kind = "gru"
            hidden = 32

            [split]
            rule = { ratio = 0.8 }

            [training]
            loss = "mae"
            "#,
        )
        .unwrap();
        assert_eq!(config.model.kind, RnnKind::Gru);
        assert_eq!(config.model.hidden, 32);
        assert_eq!(config.model.lookback, 60);
        assert_eq!(config.split.rule, SplitRule::Ratio(0.8));
        assert_eq!(config.training.loss, LossKind::Mae);
        assert_eq!(config.training.batch_size, 32);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(Config::from_toml("[features]\nhorizon = 0").is_err());
        assert!(Config::from_toml("[model]\ndropout = 1.5").is_err());
        assert!(Config::from_toml("[training]\nbatch_size = 0").is_err());
        assert!(Config::from_toml("[model\n").is_err());
    }

    #[test]
    fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("stockcast.toml");
        let config = Config::close_only();
        config.save(&path).unwrap();
        assert_eq!(Config::load(&path).unwrap(), config);
    }
}
