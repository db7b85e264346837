//! Core types for the wallet ledger
//!
//! All types are designed for:
//! - Deterministic serialization (bincode)
//! - Exact arithmetic (Decimal for BTC and fiat amounts)
//! - Explicit optionality instead of sentinel ids

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Counterpart address recorded for deposits
pub const DEPOSIT_ADDRESS: &str = "DEPOSIT";

/// Counterpart address recorded for withdrawals
pub const WITHDRAW_ADDRESS: &str = "WITHDRAW";

/// Upper bound on any single amount or wallet balance, in BTC
pub const MAX_SUPPLY_BTC: Decimal = Decimal::from_parts(21_000_000, 0, 0, false, 0);

/// User identifier assigned by the identity store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(u64);

impl UserId {
    /// Create new user ID
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw value
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One side of a money movement as seen by the fee policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Party {
    /// A registered user
    User(UserId),
    /// Funds entering or leaving the platform (deposit / withdrawal)
    External,
}

/// Registered user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// User ID
    pub id: UserId,

    /// Unique username
    pub username: String,

    /// Opaque password hash
    pub password_hash: String,

    /// Registration timestamp
    pub registered_at: DateTime<Utc>,
}

/// Result of a successful registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    /// Newly assigned user ID
    pub user_id: UserId,

    /// Bearer credential for all later calls
    pub api_key: String,
}

/// Stored wallet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    /// Owning user
    pub owner_id: UserId,

    /// Unique wallet address
    pub address: String,

    /// Balance in BTC, never negative
    pub balance_btc: Decimal,
}

impl Wallet {
    /// Create new wallet
    pub fn new(owner_id: UserId, address: impl Into<String>, balance_btc: Decimal) -> Self {
        Self {
            owner_id,
            address: address.into(),
            balance_btc,
        }
    }
}

/// Wallet enriched with its fiat equivalent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletView {
    /// Wallet address
    pub address: String,

    /// Owning user
    pub owner_id: UserId,

    /// Balance in BTC
    pub balance_btc: Decimal,

    /// Balance in the reference fiat currency at the current rate
    pub balance_fiat: Decimal,
}

/// Append-only transfer record
///
/// Equality is structural over all four fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Source address (or [`DEPOSIT_ADDRESS`])
    pub from_address: String,

    /// Destination address (or [`WITHDRAW_ADDRESS`])
    pub to_address: String,

    /// Gross amount moved, in BTC
    pub amount_btc: Decimal,

    /// Fee retained by the platform, in BTC
    pub fee_btc: Decimal,
}

impl Transaction {
    /// Create new transaction record
    pub fn new(
        from_address: impl Into<String>,
        to_address: impl Into<String>,
        amount_btc: Decimal,
        fee_btc: Decimal,
    ) -> Self {
        Self {
            from_address: from_address.into(),
            to_address: to_address.into(),
            amount_btc,
            fee_btc,
        }
    }

    /// Whether this record touches the given address
    pub fn involves(&self, address: &str) -> bool {
        self.from_address == address || self.to_address == address
    }

    /// Kind of ledger operation that produced this record
    pub fn kind(&self) -> TransactionKind {
        if self.from_address == DEPOSIT_ADDRESS {
            TransactionKind::Deposit
        } else if self.to_address == WITHDRAW_ADDRESS {
            TransactionKind::Withdrawal
        } else {
            TransactionKind::Transfer
        }
    }
}

/// Ledger operation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionKind {
    /// Funds entering a wallet from outside
    Deposit,
    /// Funds leaving a wallet to outside
    Withdrawal,
    /// Wallet-to-wallet transfer
    Transfer,
}

impl TransactionKind {
    /// Label used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Deposit => "deposit",
            TransactionKind::Withdrawal => "withdrawal",
            TransactionKind::Transfer => "transfer",
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Balance change applied to a single wallet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Movement {
    /// Wallet address
    pub address: String,

    /// Non-negative BTC amount
    pub amount: Decimal,
}

/// Unit of work written atomically by a [`crate::store::LedgerBook`]
///
/// The transaction record, the optional debit and the optional credit are
/// applied together or not at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Posting {
    /// Record appended to the transaction log
    pub transaction: Transaction,

    /// Amount removed from a wallet
    pub debit: Option<Movement>,

    /// Amount added to a wallet
    pub credit: Option<Movement>,
}

impl Posting {
    /// External funds credited net of fee
    pub fn deposit(address: &str, amount_btc: Decimal, fee_btc: Decimal) -> Self {
        Self {
            transaction: Transaction::new(DEPOSIT_ADDRESS, address, amount_btc, fee_btc),
            debit: None,
            credit: Some(Movement {
                address: address.to_string(),
                amount: amount_btc - fee_btc,
            }),
        }
    }

    /// Funds paid out; the wallet is debited net of fee
    pub fn withdrawal(address: &str, amount_btc: Decimal, fee_btc: Decimal) -> Self {
        Self {
            transaction: Transaction::new(address, WITHDRAW_ADDRESS, amount_btc, fee_btc),
            debit: Some(Movement {
                address: address.to_string(),
                amount: amount_btc - fee_btc,
            }),
            credit: None,
        }
    }

    /// Sender pays the full amount, receiver gets the amount net of fee
    pub fn transfer(from: &str, to: &str, amount_btc: Decimal, fee_btc: Decimal) -> Self {
        Self {
            transaction: Transaction::new(from, to, amount_btc, fee_btc),
            debit: Some(Movement {
                address: from.to_string(),
                amount: amount_btc,
            }),
            credit: Some(Movement {
                address: to.to_string(),
                amount: amount_btc - fee_btc,
            }),
        }
    }

    /// Kind of the underlying record
    pub fn kind(&self) -> TransactionKind {
        self.transaction.kind()
    }

    /// Addresses touched, sorted and deduplicated (lock acquisition order)
    pub fn addresses(&self) -> Vec<&str> {
        let mut addresses: Vec<&str> = self
            .debit
            .iter()
            .chain(self.credit.iter())
            .map(|m| m.address.as_str())
            .collect();
        addresses.sort_unstable();
        addresses.dedup();
        addresses
    }
}

/// Platform statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    /// Number of recorded transactions
    pub total_transactions: u64,

    /// Sum of all recorded fees, in BTC
    pub profit_btc: Decimal,

    /// Profit converted to fiat at the current rate
    pub profit_fiat: Decimal,

    /// Currency code of `profit_fiat`
    pub fiat_currency: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_structural_equality() {
        let a = Transaction::new("w1", "w2", Decimal::ONE, Decimal::ZERO);
        let b = Transaction::new("w1", "w2", Decimal::ONE, Decimal::ZERO);
        let c = Transaction::new("w1", "w2", Decimal::ONE, Decimal::new(1, 2));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_transaction_kind() {
        let deposit = Transaction::new(DEPOSIT_ADDRESS, "w1", Decimal::ONE, Decimal::ZERO);
        let withdrawal = Transaction::new("w1", WITHDRAW_ADDRESS, Decimal::ONE, Decimal::ZERO);
        let transfer = Transaction::new("w1", "w2", Decimal::ONE, Decimal::ZERO);

        assert_eq!(deposit.kind(), TransactionKind::Deposit);
        assert_eq!(withdrawal.kind(), TransactionKind::Withdrawal);
        assert_eq!(transfer.kind(), TransactionKind::Transfer);
        assert!(transfer.involves("w2"));
        assert!(!transfer.involves("w3"));
    }

    #[test]
    fn test_transfer_posting_amounts() {
        let fee = Decimal::new(15, 3);
        let posting = Posting::transfer("b", "a", Decimal::ONE, fee);

        assert_eq!(posting.debit.as_ref().unwrap().amount, Decimal::ONE);
        assert_eq!(posting.credit.as_ref().unwrap().amount, Decimal::ONE - fee);
        assert_eq!(posting.addresses(), vec!["a", "b"]);
    }

    #[test]
    fn test_withdrawal_posting_debits_net_of_fee() {
        let fee = Decimal::new(1, 2);
        let posting = Posting::withdrawal("w1", Decimal::ONE, fee);

        assert!(posting.credit.is_none());
        assert_eq!(posting.debit.unwrap().amount, Decimal::ONE - fee);
        assert_eq!(posting.transaction.to_address, WITHDRAW_ADDRESS);
    }
}
