use thiserror::Error;

/// Classified failure of an exchange call
///
/// The classification decides what the caller does next: transient errors are
/// retried, rejections drop the decision, and auth/protocol failures end the
/// run so the supervisor can restart it.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExchangeError {
    /// Timeouts, connection resets, 5xx and rate-limit responses
    #[error("transient network error: {0}")]
    Transient(String),
    /// Exchange refused the request (insufficient balance, invalid size, ...)
    #[error("order rejected: {0}")]
    Rejected(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("not found: {0}")]
    NotFound(String),
    /// Payload the connector could not make sense of
    #[error("protocol error: {0}")]
    Protocol(String),
}

pub type ExchangeResult<T> = Result<T, ExchangeError>;

impl ExchangeError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ExchangeError::Transient(_))
    }

    /// Errors that retrying within this run cannot fix
    pub fn is_fatal(&self) -> bool {
        matches!(self, ExchangeError::Auth(_) | ExchangeError::Protocol(_))
    }

    /// Map an HTTP status and body into the taxonomy
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            401 | 403 => ExchangeError::Auth(format!("HTTP {}: {}", status, body)),
            404 => ExchangeError::NotFound(format!("HTTP {}: {}", status, body)),
            408 | 429 => ExchangeError::Transient(format!("HTTP {}: {}", status, body)),
            s if s >= 500 => ExchangeError::Transient(format!("HTTP {}: {}", status, body)),
            _ => ExchangeError::Rejected(format!("HTTP {}: {}", status, body)),
        }
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            ExchangeError::Transient(err.to_string())
        } else if err.is_decode() || err.is_body() {
            ExchangeError::Protocol(err.to_string())
        } else if let Some(status) = err.status() {
            ExchangeError::from_status(status.as_u16(), &err.to_string())
        } else {
            ExchangeError::Transient(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ExchangeError {
    fn from(err: serde_json::Error) -> Self {
        ExchangeError::Protocol(err.to_string())
    }
}

/// Order state machine violations
#[derive(Debug, Clone, Error, PartialEq)]
pub enum OrderError {
    #[error("invalid order transition {from:?} -> {to:?} for {client_id}")]
    InvalidTransition {
        client_id: String,
        from: crate::execution::OrderState,
        to: crate::execution::OrderState,
    },
    #[error("filled size went backwards for {client_id}: {previous} -> {reported}")]
    FillRegression {
        client_id: String,
        previous: f64,
        reported: f64,
    },
}

/// Failures that end the current engine run
#[derive(Debug, Error)]
pub enum EngineError {
    /// Programming error, corrupted state or an unrecoverable exchange failure
    #[error("fatal: {0}")]
    Fatal(String),
    #[error(transparent)]
    Order(#[from] OrderError),
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
    #[error("restart budget exhausted: {restarts} restarts within {window_secs}s")]
    RestartBudgetExhausted { restarts: usize, window_secs: u64 },
}

impl From<ExchangeError> for EngineError {
    fn from(err: ExchangeError) -> Self {
        EngineError::Fatal(format!("exchange: {}", err))
    }
}
