use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{provider} returned HTTP {status}: {message}")]
    Provider {
        provider: String,
        status: u16,
        message: String,
    },

    #[error("Malformed payload from {provider}: {message}")]
    Malformed { provider: String, message: String },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Database error: {0}")]
    AsyncDatabase(#[from] tokio_rusqlite::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Relevance filter error: {0}")]
    Relevance(String),

    #[error("Job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: i64,
        from: String,
        to: String,
    },

    #[error("Hard time limit of {0:?} exceeded")]
    TimeLimit(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;

/// Where an error sits in the pipeline's failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Timeouts, connection failures, 429 and 5xx. Retried.
    Transient,
    /// Bad JSON or missing fields. Degrades to a partial item list.
    Malformed,
    /// A write failed. Aborts that write only.
    Persistence,
    /// Missing credentials or disabled sources. Fatal for the run.
    Configuration,
    /// Relevance filter failed. Never fatal.
    Relevance,
    Other,
}

impl AppError {
    pub fn malformed(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Malformed {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Http(e) => {
                if e.is_timeout() || e.is_connect() || e.is_request() {
                    ErrorKind::Transient
                } else if e.is_decode() {
                    ErrorKind::Malformed
                } else {
                    match e.status() {
                        Some(s) if s.as_u16() == 429 || s.is_server_error() => {
                            ErrorKind::Transient
                        }
                        _ => ErrorKind::Other,
                    }
                }
            }
            AppError::Provider { status, .. } => {
                if *status == 429 || (500..600).contains(status) {
                    ErrorKind::Transient
                } else {
                    ErrorKind::Other
                }
            }
            AppError::Malformed { .. } | AppError::Json(_) => ErrorKind::Malformed,
            AppError::Database(_) | AppError::AsyncDatabase(_) => ErrorKind::Persistence,
            AppError::Config(_) | AppError::Toml(_) => ErrorKind::Configuration,
            AppError::Relevance(_) => ErrorKind::Relevance,
            _ => ErrorKind::Other,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(status: u16) -> AppError {
        AppError::Provider {
            provider: "newsapi".to_string(),
            status,
            message: "boom".to_string(),
        }
    }

    #[test]
    fn server_errors_and_rate_limits_are_retryable() {
        assert!(provider(500).is_retryable());
        assert!(provider(503).is_retryable());
        assert!(provider(429).is_retryable());
        assert!(!provider(401).is_retryable());
        assert!(!provider(404).is_retryable());
    }

    #[test]
    fn taxonomy_mapping() {
        assert_eq!(
            AppError::malformed("perplexity", "no choices").kind(),
            ErrorKind::Malformed
        );
        assert_eq!(
            AppError::Config("missing key".into()).kind(),
            ErrorKind::Configuration
        );
        assert_eq!(
            AppError::Database(rusqlite::Error::InvalidQuery).kind(),
            ErrorKind::Persistence
        );
        assert!(!AppError::Relevance("bad".into()).is_retryable());
    }

    #[test]
    fn provider_error_display() {
        assert_eq!(provider(502).to_string(), "newsapi returned HTTP 502: boom");
    }
}
