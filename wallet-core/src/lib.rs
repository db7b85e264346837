//! Wallet Ledger Core
//!
//! Custodial BTC wallet ledger: users authenticate with API keys, own up to
//! a fixed number of wallets, and move funds through deposits, withdrawals
//! and transfers that are recorded in an append-only transaction log.
//!
//! # Architecture
//!
//! - **Engine**: [`WalletLedger`] validates requests and applies fee rules
//! - **Stores**: traits in [`store`] with in-memory and RocksDB adapters
//! - **Policies**: fee schedule, currency conversion, hashing and ID generation
//! - **Actor**: optional single-task front serializing all operations
//!
//! # Invariants
//!
//! - Balances never go negative
//! - A posting updates balances and the log together or not at all
//! - Platform profit equals the sum of recorded fees

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod actor;
pub mod config;
pub mod error;
pub mod ledger;
pub mod metrics;
pub mod policy;
pub mod storage;
pub mod store;
pub mod types;

// Re-exports
pub use actor::{spawn_ledger_actor, LedgerHandle};
pub use config::Config;
pub use error::{Error, Result};
pub use ledger::WalletLedger;
pub use metrics::Metrics;
pub use storage::Storage;
pub use types::{
    Party, Registration, Statistics, Transaction, TransactionKind, User, UserId, Wallet,
    WalletView,
};
