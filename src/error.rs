/*!
Error types for `stockcast`
*/
use thiserror::Error;

/// Errors raised while fetching data for a symbol
#[derive(Debug, Error)]
pub enum DataError {
    /// The network could not be reached, or the request timed out
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),
    /// The provider asked us to back off
    #[error("rate limited by provider (retry after {retry_after_secs}s)")]
    RateLimited {
        /// Seconds the provider asked us to wait
        retry_after_secs: u64,
    },
    /// The provider answered with something we could not parse
    #[error("response format changed: {0}")]
    ResponseFormatChanged(String),
    /// Anything else
    #[error("data error: {0}")]
    Other(String),
}

/// The error type for `stockcast` operations
#[derive(Debug, Error)]
pub enum Error {
    /// An IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// A CSV (de)serialization error
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    /// A JSON (de)serialization error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    /// A TOML parse error
    #[error("config parse error: {0}")]
    TomlDe(#[from] toml::de::Error),
    /// A TOML serialization error
    #[error("config write error: {0}")]
    TomlSer(#[from] toml::ser::Error),
    /// An HTTP client error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    /// An error from libtorch
    #[error("torch error: {0}")]
    Torch(#[from] tch::TchError),
    /// A data provider error
    #[error(transparent)]
    Data(#[from] DataError),
    /// The provider has no data for this symbol
    #[error("symbol not found: {0}")]
    SymbolNotFound(String),
    /// A malformed ticker symbol
    #[error("invalid ticker {0:?}")]
    InvalidTicker(String),
    /// An invalid configuration value
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Training produced a non-finite loss or metric
    #[error("training diverged: {0}")]
    Diverged(String),
    /// Not enough data to carry out an operation
    #[error("insufficient data: {0}")]
    InsufficientData(String),
}

/// A `Result` alias using `stockcast`'s error type
pub type Result<T, E = Error> = std::result::Result<T, E>;
