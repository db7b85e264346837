//! Error types for the wallet ledger
//!
//! Variants fall in two groups. Domain outcomes (authentication, ownership,
//! funds, limits) are ordinary results of a request and carry no fault.
//! Infrastructure failures come from adapters and are passed through
//! untouched; the engine never retries them.

use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// API key does not resolve to a user
    #[error("Unauthenticated")]
    Unauthenticated,

    /// Caller is authenticated but does not own the resource
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// No wallet at the given address
    #[error("Wallet not found: {0}")]
    WalletNotFound(String),

    /// Transfer source wallet does not exist
    #[error("Sender wallet not found: {0}")]
    SenderNotFound(String),

    /// Transfer destination wallet does not exist
    #[error("Receiver wallet not found: {0}")]
    ReceiverNotFound(String),

    /// Balance is lower than the requested amount
    #[error("Insufficient funds in wallet {0}")]
    InsufficientFunds(String),

    /// User already owns the maximum number of wallets
    #[error("Wallet limit of {0} exceeded")]
    WalletLimitExceeded(usize),

    /// Username is taken
    #[error("User already registered: {0}")]
    AlreadyRegistered(String),

    /// Transfer source and destination are the same address
    #[error("Cannot transfer to the same wallet: {0}")]
    SameWallet(String),

    /// Negative amount
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// Exchange rate unusable for conversion
    #[error("Invalid exchange rate: {0}")]
    InvalidRate(String),

    /// Storage error (RocksDB or adapter)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Concurrency error (actor mailbox closed, etc.)
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for adapter and runtime failures, false for business outcomes
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Error::InvalidRate(_)
                | Error::Storage(_)
                | Error::Serialization(_)
                | Error::Concurrency(_)
                | Error::Config(_)
                | Error::Io(_)
        )
    }

    /// Short label used for the rejection metric
    pub fn reason(&self) -> &'static str {
        match self {
            Error::Unauthenticated => "unauthenticated",
            Error::Forbidden(_) => "forbidden",
            Error::WalletNotFound(_) => "wallet_not_found",
            Error::SenderNotFound(_) => "sender_not_found",
            Error::ReceiverNotFound(_) => "receiver_not_found",
            Error::InsufficientFunds(_) => "insufficient_funds",
            Error::WalletLimitExceeded(_) => "wallet_limit_exceeded",
            Error::AlreadyRegistered(_) => "already_registered",
            Error::SameWallet(_) => "same_wallet",
            Error::InvalidAmount(_) => "invalid_amount",
            _ => "infrastructure",
        }
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}
