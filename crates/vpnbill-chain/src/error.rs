//! Chain error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Blockchain API error: {0}")]
    ApiError(String),

    #[error("Network error: {0}")]
    NetworkError(String),
}

pub type ChainResult<T> = Result<T, ChainError>;
