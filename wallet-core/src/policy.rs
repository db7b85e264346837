//! Pluggable policies used by the ledger engine
//!
//! Each policy is a small trait with one method group so that deployments
//! can swap implementations at construction time:
//! - [`FeePolicy`] - fee rate per sender/receiver relationship
//! - [`RateProvider`] and [`CurrencyConverter`] - BTC <-> fiat conversion
//! - [`Hasher`] - one-way transform for passwords and derived API keys
//! - [`IdGenerator`] - collision-resistant wallet addresses and API keys

use crate::{
    config::FeeSchedule,
    types::Party,
    Error, Result,
};
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Fee rates applied to a transferred BTC amount
pub trait FeePolicy: Send + Sync {
    /// Transfer between wallets of different owners
    fn different_owners_rate(&self) -> Decimal;

    /// Transfer between two wallets of the same owner
    fn same_owner_rate(&self) -> Decimal;

    /// Deposit from outside
    fn deposit_rate(&self) -> Decimal;

    /// Withdrawal to outside
    fn withdraw_rate(&self) -> Decimal;

    /// Rate for a movement between `sender` and `receiver`
    fn rate_for(&self, sender: Party, receiver: Party) -> Decimal {
        match (sender, receiver) {
            (a, b) if a == b => self.same_owner_rate(),
            (Party::External, _) => self.deposit_rate(),
            (_, Party::External) => self.withdraw_rate(),
            _ => self.different_owners_rate(),
        }
    }

    /// Fee owed on `amount`
    fn fee(&self, sender: Party, receiver: Party, amount: Decimal) -> Decimal {
        amount * self.rate_for(sender, receiver)
    }
}

impl FeePolicy for FeeSchedule {
    fn different_owners_rate(&self) -> Decimal {
        self.different_owners
    }

    fn same_owner_rate(&self) -> Decimal {
        self.same_owner
    }

    fn deposit_rate(&self) -> Decimal {
        self.deposit
    }

    fn withdraw_rate(&self) -> Decimal {
        self.withdraw
    }
}

/// Source of the BTC exchange rate (fiat units per BTC)
pub trait RateProvider: Send + Sync {
    /// Current rate
    fn rate(&self) -> Result<Decimal>;
}

/// Constant exchange rate
#[derive(Debug, Clone, Copy)]
pub struct FixedRate(Decimal);

impl FixedRate {
    /// Create provider, rejecting non-positive rates
    pub fn new(rate: Decimal) -> Result<Self> {
        if rate <= Decimal::ZERO {
            return Err(Error::InvalidRate(format!("rate must be positive, got {}", rate)));
        }
        Ok(Self(rate))
    }
}

impl RateProvider for FixedRate {
    fn rate(&self) -> Result<Decimal> {
        Ok(self.0)
    }
}

/// Conversion between BTC and the reference fiat currency
pub trait CurrencyConverter: Send + Sync {
    /// BTC -> fiat
    fn to_fiat(&self, btc: Decimal) -> Result<Decimal>;

    /// Fiat -> BTC
    fn to_btc(&self, fiat: Decimal) -> Result<Decimal>;
}

/// Converter that reads the point-in-time rate from a [`RateProvider`]
#[derive(Clone)]
pub struct RateConverter {
    provider: Arc<dyn RateProvider>,
}

impl RateConverter {
    /// Create converter over a provider
    pub fn new(provider: Arc<dyn RateProvider>) -> Self {
        Self { provider }
    }

    /// Converter with a constant rate
    pub fn fixed(rate: Decimal) -> Result<Self> {
        Ok(Self::new(Arc::new(FixedRate::new(rate)?)))
    }

    fn current_rate(&self) -> Result<Decimal> {
        let rate = self.provider.rate()?;
        if rate <= Decimal::ZERO {
            return Err(Error::InvalidRate(format!("provider returned {}", rate)));
        }
        Ok(rate)
    }
}

impl CurrencyConverter for RateConverter {
    fn to_fiat(&self, btc: Decimal) -> Result<Decimal> {
        let rate = self.current_rate()?;
        btc.checked_mul(rate)
            .ok_or_else(|| Error::InvalidRate(format!("{} BTC overflows at rate {}", btc, rate)))
    }

    fn to_btc(&self, fiat: Decimal) -> Result<Decimal> {
        let rate = self.current_rate()?;
        fiat.checked_div(rate)
            .ok_or_else(|| Error::InvalidRate(format!("{} fiat overflows at rate {}", fiat, rate)))
    }
}

/// One-way hash of one or more byte strings
pub trait Hasher: Send + Sync {
    /// Hash the concatenation of `parts` into an opaque string
    fn hash(&self, parts: &[&[u8]]) -> String;
}

/// SHA-256 over length-prefixed parts, hex encoded
///
/// Each part is preceded by its length so that `("ab", "c")` and
/// `("a", "bc")` hash differently.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Hasher;

impl Hasher for Sha256Hasher {
    fn hash(&self, parts: &[&[u8]]) -> String {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update((part.len() as u64).to_be_bytes());
            hasher.update(part);
        }
        format!("{:x}", hasher.finalize())
    }
}

/// Unique value generator for addresses and keys
pub trait IdGenerator: Send + Sync {
    /// Fresh wallet address
    fn new_wallet_address(&self) -> String;

    /// Fresh API key
    fn new_api_key(&self) -> String;
}

/// Random UUIDv4 values with optional prefixes
#[derive(Debug, Clone, Default)]
pub struct UuidGenerator {
    wallet_prefix: String,
    api_key_prefix: String,
}

impl UuidGenerator {
    /// Create generator with prefixes
    pub fn new(wallet_prefix: impl Into<String>, api_key_prefix: impl Into<String>) -> Self {
        Self {
            wallet_prefix: wallet_prefix.into(),
            api_key_prefix: api_key_prefix.into(),
        }
    }
}

impl IdGenerator for UuidGenerator {
    fn new_wallet_address(&self) -> String {
        format!("{}{}", self.wallet_prefix, uuid::Uuid::new_v4())
    }

    fn new_api_key(&self) -> String {
        format!("{}{}", self.api_key_prefix, uuid::Uuid::new_v4())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UserId;

    #[test]
    fn test_fee_rate_selection() {
        let fees = FeeSchedule {
            different_owners: Decimal::new(15, 3),
            same_owner: Decimal::new(1, 3),
            deposit: Decimal::new(2, 3),
            withdraw: Decimal::new(3, 3),
        };
        let alice = Party::User(UserId::new(1));
        let bob = Party::User(UserId::new(2));

        assert_eq!(fees.rate_for(alice, alice), Decimal::new(1, 3));
        assert_eq!(fees.rate_for(Party::External, alice), Decimal::new(2, 3));
        assert_eq!(fees.rate_for(alice, Party::External), Decimal::new(3, 3));
        assert_eq!(fees.rate_for(alice, bob), Decimal::new(15, 3));
    }

    #[test]
    fn test_fee_amount() {
        let fees = FeeSchedule::default();
        let fee = fees.fee(
            Party::User(UserId::new(1)),
            Party::User(UserId::new(2)),
            Decimal::from(2),
        );
        assert_eq!(fee, Decimal::new(3, 2)); // 2 * 0.015
    }

    #[test]
    fn test_converter_round_trip() {
        let converter = RateConverter::fixed(Decimal::new(2_000_011, 2)).unwrap();
        let btc = Decimal::new(123_456_789, 8);

        let back = converter.to_btc(converter.to_fiat(btc).unwrap()).unwrap();
        let diff = (back - btc).abs();
        assert!(diff < Decimal::new(1, 18), "diff = {}", diff);
    }

    #[test]
    fn test_fixed_rate_rejects_zero() {
        assert!(matches!(FixedRate::new(Decimal::ZERO), Err(Error::InvalidRate(_))));
    }

    #[test]
    fn test_hash_deterministic_and_framed() {
        let hasher = Sha256Hasher;
        let h1 = hasher.hash(&[b"ab".as_slice(), b"c".as_slice()]);
        let h2 = hasher.hash(&[b"ab".as_slice(), b"c".as_slice()]);
        let h3 = hasher.hash(&[b"a".as_slice(), b"bc".as_slice()]);

        assert_eq!(h1, h2);
        assert_ne!(h1, h3);
        assert_eq!(h1.len(), 64);
    }

    #[test]
    fn test_uuid_generator_unique_with_prefix() {
        let ids = UuidGenerator::new("bc_", "key_");
        let a = ids.new_wallet_address();
        let b = ids.new_wallet_address();

        assert_ne!(a, b);
        assert!(a.starts_with("bc_"));
        assert!(ids.new_api_key().starts_with("key_"));
    }
}
