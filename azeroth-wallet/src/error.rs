//! Error taxonomy.
//!
//! [`WalletError`] is what library functions return. Foreground transfers do not surface it
//! directly: they classify every failure into a [`TransferFailure`] and hand that to a callback.

use azeroth_crypto::CryptoError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WalletError {
    /// Invalid cryptographic input: never retried.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("invalid transfer amount: recomputed ledger balance is negative")]
    InvalidTransferAmount,

    /// The transport gave up after its own retries.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("{operation} timed out after {secs}s")]
    Timeout { operation: String, secs: u64 },

    #[error("local store error: {0}")]
    Store(String),

    #[error("proving service error: {0}")]
    Prover(String),

    #[error("proof verification failed")]
    VerificationFailed,

    #[error("ena not registered")]
    EnaNotRegistered,

    #[error("missing data: {0}")]
    MissingData(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("background task failed: {0}")]
    Task(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WalletError {
    /// Transport failures and timeouts mean "try again later", never "does not exist".
    pub fn is_retryable(&self) -> bool {
        matches!(self, WalletError::Transport(_) | WalletError::Timeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, WalletError>;

/// The three failure kinds a foreground transfer can report.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferFailureKind {
    ReceiverEnaUnregistered,
    InsufficientBalance,
    Internal,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferFailure {
    pub kind: TransferFailureKind,
    pub reason: Option<String>,
}

impl std::fmt::Display for TransferFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.reason {
            Some(reason) => write!(f, "{:?}: {}", self.kind, reason),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl std::error::Error for TransferFailure {}

impl TransferFailure {
    pub fn internal(reason: impl Into<String>) -> Self {
        Self {
            kind: TransferFailureKind::Internal,
            reason: Some(reason.into()),
        }
    }

    pub fn insufficient_balance() -> Self {
        Self {
            kind: TransferFailureKind::InsufficientBalance,
            reason: None,
        }
    }

    pub fn receiver_unregistered(reason: impl Into<String>) -> Self {
        Self {
            kind: TransferFailureKind::ReceiverEnaUnregistered,
            reason: Some(reason.into()),
        }
    }
}

impl From<WalletError> for TransferFailure {
    fn from(err: WalletError) -> Self {
        match err {
            WalletError::InvalidTransferAmount => Self::insufficient_balance(),
            other => Self::internal(other.to_string()),
        }
    }
}
