/// Invalid or missing settings. Raised at construction time and never retried.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("must provide either local lat/lon or a local grid id")]
    MissingLocation,
    #[error("unsupported carbon intensity provider '{0}': only 'ElectricityMaps' is supported")]
    UnsupportedProvider(String),
    #[error("unknown device type '{0}'")]
    UnknownDeviceType(String),
    #[error("missing configuration value: {0}")]
    Missing(&'static str),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// A third-party endpoint (plug, switch controller, carbon API) could not be
/// used.
#[derive(thiserror::Error, Debug)]
pub enum RemoteAccessError {
    #[error("{endpoint} returned {status}: {body}")]
    Status {
        endpoint: String,
        status: u16,
        body: String,
    },
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("device i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("{endpoint} rejected the request with errorCode {code}: {message}")]
    Rejected {
        endpoint: String,
        code: i64,
        message: String,
    },
    #[error("malformed response from {endpoint}: {message}")]
    Malformed { endpoint: String, message: String },
    #[error("authentication failed: {0}")]
    Authentication(String),
}

impl RemoteAccessError {
    pub fn malformed(endpoint: impl Into<String>, message: impl ToString) -> Self {
        Self::Malformed {
            endpoint: endpoint.into(),
            message: message.to_string(),
        }
    }

    /// Only exhausted authentication fallback stops a running monitor.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Authentication(_))
    }
}

/// Failure at the `UsageSink` boundary.
#[derive(thiserror::Error, Debug)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("file i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("sink is closed")]
    Closed,
}

/// Why a sampling loop stopped before its timeout.
#[derive(thiserror::Error, Debug)]
pub enum LoopError {
    #[error("sampling stopped: {0}")]
    Fatal(#[source] RemoteAccessError),
    #[error("sampling task failed: {0}")]
    Task(String),
}
