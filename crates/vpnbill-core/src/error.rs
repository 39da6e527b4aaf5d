//! Core error types

use thiserror::Error;
use uuid::Uuid;
use vpnbill_chain::ChainError;
use vpnbill_panel::PanelError;
use vpnbill_store::{StoreError, UserId};

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Insufficient funds: need {needed}, have {available}")]
    InsufficientFunds { needed: i64, available: i64 },

    #[error("Payment {0} already completed")]
    AlreadyComplete(Uuid),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("User {0} has no active subscription")]
    NoActiveSubscription(UserId),

    #[error("User {0} already has an active subscription")]
    SubscriptionActive(UserId),

    #[error("User {0} already used the trial")]
    TrialAlreadyUsed(UserId),

    #[error("No servers available")]
    NoServersAvailable,

    #[error("{0} not found")]
    NotFound(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid referral: {0}")]
    InvalidReferral(String),

    #[error("Notification failed: {0}")]
    Notify(String),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Provisioning error: {0}")]
    Panel(#[from] PanelError),

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),
}

impl CoreError {
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Store(e) => e.is_not_found(),
            _ => false,
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
