//! Error types for the refill monitor

use thiserror::Error;

/// Main error type for the refill monitor
#[derive(Error, Debug)]
pub enum RefillError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Chain connection error for chain {chain_id}: {message}")]
    ChainConnection { chain_id: u64, message: String },

    #[error("Contract call failed: {0}")]
    Contract(String),

    #[error("Transaction rejected: {0}")]
    SubmissionRejected(String),

    #[error("Transaction reverted: {0}")]
    SubmissionReverted(String),

    #[error("Insufficient funds to submit transaction: {0}")]
    InsufficientFunds(String),

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Action requires the faucet owner")]
    Unauthorized,

    #[error("Unknown asset: {0}")]
    UnknownAsset(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Rate limited on chain {chain_id}")]
    RateLimited { chain_id: u64 },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RefillError {
    /// Check if error is a transient remote-call failure
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RefillError::ChainConnection { .. }
                | RefillError::Timeout { .. }
                | RefillError::RateLimited { .. }
        )
    }

    /// Check if error came from submitting a transaction
    pub fn is_submission_failure(&self) -> bool {
        matches!(
            self,
            RefillError::SubmissionRejected(_)
                | RefillError::SubmissionReverted(_)
                | RefillError::InsufficientFunds(_)
                | RefillError::Wallet(_)
        )
    }
}

/// Result type for refill operations
pub type RefillResult<T> = Result<T, RefillError>;
