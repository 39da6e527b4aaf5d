//! Panel error types

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum PanelError {
    #[error("Credential not found: {0}")]
    NotFound(String),

    #[error("Duplicate credential identifier: {0}")]
    Duplicate(String),

    #[error("Panel unreachable: {0}")]
    Unreachable(String),

    #[error("Panel request timed out")]
    Timeout,

    #[error("Panel API error: {0}")]
    Api(String),
}

impl PanelError {
    /// Classify a failure message returned inside a panel response envelope
    pub fn from_message(msg: &str) -> Self {
        let lower = msg.to_ascii_lowercase();
        if lower.contains("not found") || lower.contains("no client") {
            Self::NotFound(msg.to_string())
        } else if lower.contains("duplicate") {
            Self::Duplicate(msg.to_string())
        } else {
            Self::Api(msg.to_string())
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate(_))
    }
}

impl From<reqwest::Error> for PanelError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_connect() || e.is_request() {
            Self::Unreachable(e.to_string())
        } else {
            Self::Api(e.to_string())
        }
    }
}

pub type PanelResult<T> = Result<T, PanelError>;
