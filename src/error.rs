//! Error types for the Sponsor Relayer

use ethers::types::Address;
use thiserror::Error;

/// Main error type for the relayer
#[derive(Error, Debug)]
pub enum RelayerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Network error: {0}")]
    Network(String),

    #[error("No lockable signer available: {0}")]
    PoolExhausted(String),

    #[error("Nonce conflict for {address:?} at nonce {nonce}: {message}")]
    NonceConflict {
        address: Address,
        nonce: u64,
        message: String,
    },

    #[error("Gas estimation error: {0}")]
    GasEstimation(String),

    #[error("Transaction submission failed: {0}")]
    SubmissionFailed(String),

    #[error("Transaction reverted: {tx_hash}")]
    Reverted { tx_hash: String },

    #[error("Lock store error: {0}")]
    LockStore(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Daily top-up limit reached for {address:?}")]
    DailyLimitReached { address: Address },

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Insufficient balance for {address:?}: {message}")]
    InsufficientBalance { address: Address, message: String },

    #[error("Task error: {0}")]
    Task(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayerError {
    /// Check if error is retryable by the caller
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayerError::Network(_)
                | RelayerError::Timeout { .. }
                | RelayerError::PoolExhausted(_)
        )
    }

    /// Check if the network rejected a transaction because of its nonce
    pub fn is_nonce_conflict(&self) -> bool {
        matches!(self, RelayerError::NonceConflict { .. })
    }

    /// Check if error should trigger an alert
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            RelayerError::InsufficientBalance { .. }
                | RelayerError::InvariantViolation(_)
                | RelayerError::Wallet(_)
        )
    }

    /// Classify a broadcast error message reported by a node.
    pub fn from_broadcast(address: Address, nonce: u64, message: String) -> Self {
        if is_nonce_error(&message) {
            RelayerError::NonceConflict {
                address,
                nonce,
                message,
            }
        } else if message.to_lowercase().contains("insufficient funds") {
            RelayerError::InsufficientBalance { address, message }
        } else {
            RelayerError::Network(message)
        }
    }
}

const NONCE_ERROR_PATTERNS: &[&str] = &[
    "nonce too low",
    "nonce too high",
    "invalid nonce",
    "already known",
    "known transaction",
    "replacement transaction underpriced",
    "same hash",
];

/// Whether a node error message reports a stale or reused nonce
pub fn is_nonce_error(message: &str) -> bool {
    let message = message.to_lowercase();
    NONCE_ERROR_PATTERNS.iter().any(|p| message.contains(p))
}

/// Result type for relayer operations
pub type RelayerResult<T> = Result<T, RelayerError>;
