use thiserror::Error;

use crate::types::ScanResult;

pub type Result<T> = std::result::Result<T, ScanError>;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unable to resolve host: {0}")]
    UnresolvableHost(String),

    #[error("External tool unavailable: {0}")]
    ToolUnavailable(String),

    #[error("{tool} did not finish within {seconds}s")]
    SubprocessTimeout { tool: String, seconds: u64 },

    #[error("{tool} exited with status {code:?}: {message}")]
    ToolFailed {
        tool: String,
        code: Option<i32>,
        message: String,
    },

    #[error("External API failure ({api}): {message}")]
    ExternalApi { api: String, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Scan cancelled: {reason}")]
    Cancelled {
        reason: String,
        partial: Option<Box<ScanResult>>,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Reporting error: {0}")]
    Reporting(String),
}

impl ScanError {
    pub fn external_api(api: &str, message: impl Into<String>) -> Self {
        ScanError::ExternalApi {
            api: api.to_string(),
            message: message.into(),
        }
    }

    /// Errors that end a scan instead of degrading it to a warning.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ScanError::UnresolvableHost(_) | ScanError::Cancelled { .. }
        )
    }

    /// Partial result carried by a cancellation, if any.
    pub fn into_partial(self) -> Option<ScanResult> {
        match self {
            ScanError::Cancelled { partial, .. } => partial.map(|p| *p),
            _ => None,
        }
    }
}
