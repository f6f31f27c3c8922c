//! Error types for the Quotagate dispatcher.

use std::time::Duration;
use thiserror::Error;

/// Main error type for Quotagate operations.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// Upstream kept throttling after every retry was spent
    #[error("Rate limit exhausted for {url} after {attempts} attempts")]
    RateLimitExhausted { url: String, attempts: u32 },

    /// Non-success status other than 429, or a network-level failure (`status` is `None`)
    #[error("Transport error ({}): {message}", status_label(.status))]
    Transport { status: Option<u16>, message: String },

    /// Response body was not the expected structured data
    #[error("Decode error: {0}")]
    Decode(String),

    /// The URL could not be parsed or credentials could not be applied to it
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// The caller's deadline elapsed before a result was available
    #[error("Request to {url} timed out after {after:?}")]
    TimedOut { url: String, after: Duration },

    /// The call was abandoned (dispatcher shut down or backoff cancelled)
    #[error("Request cancelled")]
    Cancelled,

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),
}

impl DispatchError {
    /// Build a transport error from a response status and its description.
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        DispatchError::Transport {
            status: Some(status),
            message: message.into(),
        }
    }

    /// Build a transport error for a failure that never produced a response.
    pub fn network(message: impl Into<String>) -> Self {
        DispatchError::Transport {
            status: None,
            message: message.into(),
        }
    }
}

fn status_label(status: &Option<u16>) -> String {
    match status {
        Some(code) => code.to_string(),
        None => "network".to_string(),
    }
}

impl From<serde_json::Error> for DispatchError {
    fn from(err: serde_json::Error) -> Self {
        DispatchError::Decode(err.to_string())
    }
}

impl From<config::ConfigError> for DispatchError {
    fn from(err: config::ConfigError) -> Self {
        DispatchError::Config(err.to_string())
    }
}

/// Result type alias for Quotagate operations.
pub type Result<T> = std::result::Result<T, DispatchError>;
