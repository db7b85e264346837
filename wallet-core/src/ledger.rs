//! Main ledger orchestration layer
//!
//! This module ties together the stores and policies into the high-level
//! wallet API: registration, wallets, deposits, withdrawals, transfers and
//! platform statistics.
//!
//! # Example
//!
//! ```
//! use rust_decimal::Decimal;
//! use wallet_core::{Config, WalletLedger};
//!
//! fn main() -> wallet_core::Result<()> {
//!     let ledger = WalletLedger::in_memory(Config::default())?;
//!
//!     let registration = ledger.register("alice", "secret")?;
//!     let wallet = ledger.create_wallet(&registration.api_key)?;
//!     assert_eq!(wallet.balance_btc, Decimal::ONE);
//!
//!     ledger.deposit(&registration.api_key, &wallet.address, Decimal::from(1000))?;
//!     Ok(())
//! }
//! ```

use crate::{
    config::ApiKeyScheme,
    metrics::Metrics,
    policy::{CurrencyConverter, FeePolicy, Hasher, IdGenerator, RateConverter, Sha256Hasher, UuidGenerator},
    storage::Storage,
    store::{ApiKeyStore, LedgerBook, MemoryApiKeyStore, MemoryBook, MemoryUserStore, UserStore},
    types::{
        Party, Posting, Registration, Statistics, Transaction, User, UserId, Wallet, WalletView,
        MAX_SUPPLY_BTC,
    },
    Config, Error, Result,
};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::sync::Arc;
use subtle::ConstantTimeEq;

/// Persistence adapters used by the engine
#[derive(Clone)]
pub struct Stores {
    /// Users
    pub users: Arc<dyn UserStore>,
    /// API key bindings
    pub api_keys: Arc<dyn ApiKeyStore>,
    /// Wallets and transaction log
    pub book: Arc<dyn LedgerBook>,
}

impl Stores {
    /// Fresh in-memory stores
    pub fn in_memory() -> Self {
        Self {
            users: Arc::new(MemoryUserStore::new()),
            api_keys: Arc::new(MemoryApiKeyStore::new()),
            book: Arc::new(MemoryBook::new()),
        }
    }

    /// All contracts served by one RocksDB instance
    pub fn rocksdb(storage: Arc<Storage>) -> Self {
        Self {
            users: storage.clone(),
            api_keys: storage.clone(),
            book: storage,
        }
    }
}

/// Pluggable policies used by the engine
#[derive(Clone)]
pub struct Policies {
    /// Fee rates
    pub fees: Arc<dyn FeePolicy>,
    /// BTC <-> fiat conversion
    pub converter: Arc<dyn CurrencyConverter>,
    /// Password and derived-key hashing
    pub hasher: Arc<dyn Hasher>,
    /// Wallet address and API key generation
    pub ids: Arc<dyn IdGenerator>,
}

impl Policies {
    /// Default policies parameterised by configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            fees: Arc::new(config.fees.clone()),
            converter: Arc::new(RateConverter::fixed(config.exchange_rate)?),
            hasher: Arc::new(Sha256Hasher),
            ids: Arc::new(UuidGenerator::new(
                config.wallet_address_prefix.clone(),
                config.api_keys.prefix.clone(),
            )),
        })
    }
}

/// Wallet ledger engine
pub struct WalletLedger {
    users: Arc<dyn UserStore>,
    api_keys: Arc<dyn ApiKeyStore>,
    book: Arc<dyn LedgerBook>,
    fees: Arc<dyn FeePolicy>,
    converter: Arc<dyn CurrencyConverter>,
    hasher: Arc<dyn Hasher>,
    ids: Arc<dyn IdGenerator>,

    /// Serializes count-then-insert in `create_wallet`
    wallet_creation: Mutex<()>,

    /// Metrics (optional)
    metrics: Option<Metrics>,

    /// Configuration
    config: Config,
}

impl WalletLedger {
    /// Create engine from explicit stores and policies
    pub fn new(config: Config, stores: Stores, policies: Policies) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            users: stores.users,
            api_keys: stores.api_keys,
            book: stores.book,
            fees: policies.fees,
            converter: policies.converter,
            hasher: policies.hasher,
            ids: policies.ids,
            wallet_creation: Mutex::new(()),
            metrics: None,
            config,
        })
    }

    /// Engine over fresh in-memory stores
    pub fn in_memory(config: Config) -> Result<Self> {
        let policies = Policies::from_config(&config)?;
        Self::new(config, Stores::in_memory(), policies)
    }

    /// Engine over RocksDB at `config.data_dir`
    pub fn open(config: Config) -> Result<Self> {
        let storage = Arc::new(Storage::open(&config)?);
        let policies = Policies::from_config(&config)?;
        Self::new(config, Stores::rocksdb(storage), policies)
    }

    /// Attach metrics collector
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Active configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    // Identity

    /// Register a user and issue an API key.
    ///
    /// Fails with [`Error::AlreadyRegistered`] when the username is taken;
    /// no key is issued in that case.
    pub fn register(&self, username: &str, password: &str) -> Result<Registration> {
        self.track(self.register_inner(username, password))
    }

    fn register_inner(&self, username: &str, password: &str) -> Result<Registration> {
        let password_hash = self.hasher.hash(&[password.as_bytes()]);

        let user = self
            .users
            .add_user(username, &password_hash)?
            .ok_or_else(|| Error::AlreadyRegistered(username.to_string()))?;

        let api_key = match self.config.api_keys.scheme {
            ApiKeyScheme::Random => self.ids.new_api_key(),
            ApiKeyScheme::Derived => format!(
                "{}{}",
                self.config.api_keys.prefix,
                self.hasher.hash(&[username.as_bytes(), password.as_bytes()])
            ),
        };
        if let Err(err) = self.api_keys.bind(&api_key, user.id) {
            // No key was issued, so release the username for a retry
            tracing::error!(user_id = %user.id, error = %err, "API key binding failed");
            self.users.remove_user(user.id)?;
            return Err(err);
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_registration();
        }
        tracing::info!(user_id = %user.id, "User registered");

        Ok(Registration {
            user_id: user.id,
            api_key,
        })
    }

    /// Resolve an API key to its user
    pub fn resolve_api_key(&self, api_key: &str) -> Result<UserId> {
        self.api_keys
            .resolve(api_key)?
            .ok_or(Error::Unauthenticated)
    }

    /// Whether the key belongs to a registered user
    pub fn is_valid_api_key(&self, api_key: &str) -> Result<bool> {
        Ok(self.api_keys.resolve(api_key)?.is_some())
    }

    /// Look up a user by username
    pub fn get_user(&self, username: &str) -> Result<Option<User>> {
        self.users.find_by_username(username)
    }

    // Wallets

    /// Open a new wallet seeded with the starting balance
    pub fn create_wallet(&self, api_key: &str) -> Result<WalletView> {
        self.track(self.create_wallet_inner(api_key))
    }

    fn create_wallet_inner(&self, api_key: &str) -> Result<WalletView> {
        let user_id = self.resolve_api_key(api_key)?;

        let wallet = {
            let _guard = self.wallet_creation.lock();

            let owned = self.book.count_by_owner(user_id)?;
            if owned >= self.config.max_wallets_per_user {
                return Err(Error::WalletLimitExceeded(self.config.max_wallets_per_user));
            }

            let wallet = Wallet::new(
                user_id,
                self.ids.new_wallet_address(),
                self.config.starting_balance_btc,
            );
            self.book.add_wallet(&wallet)?;
            wallet
        };

        if let Some(metrics) = &self.metrics {
            metrics.record_wallet_created();
        }
        tracing::info!(user_id = %user_id, address = %wallet.address, "Wallet created");

        self.view(wallet)
    }

    /// Wallet owned by the caller
    pub fn get_wallet(&self, api_key: &str, address: &str) -> Result<WalletView> {
        self.track(self.get_wallet_inner(api_key, address))
    }

    fn get_wallet_inner(&self, api_key: &str, address: &str) -> Result<WalletView> {
        let user_id = self.resolve_api_key(api_key)?;
        let wallet = self.owned_wallet(user_id, address)?;
        self.view(wallet)
    }

    /// All wallets of the caller
    pub fn list_wallets(&self, api_key: &str) -> Result<Vec<WalletView>> {
        self.track(self.list_wallets_inner(api_key))
    }

    fn list_wallets_inner(&self, api_key: &str) -> Result<Vec<WalletView>> {
        let user_id = self.resolve_api_key(api_key)?;
        self.book
            .list_by_owner(user_id)?
            .into_iter()
            .map(|wallet| self.view(wallet))
            .collect()
    }

    /// Transactions touching a wallet owned by the caller, in insertion order
    pub fn get_wallet_transactions(&self, api_key: &str, address: &str) -> Result<Vec<Transaction>> {
        self.track(self.get_wallet_transactions_inner(api_key, address))
    }

    fn get_wallet_transactions_inner(
        &self,
        api_key: &str,
        address: &str,
    ) -> Result<Vec<Transaction>> {
        let user_id = self.resolve_api_key(api_key)?;
        self.owned_wallet(user_id, address)?;
        self.book.find_by_address(address)
    }

    // Money movement

    /// Credit a wallet with a fiat amount converted to BTC, net of the deposit fee
    pub fn deposit(&self, api_key: &str, address: &str, amount_fiat: Decimal) -> Result<WalletView> {
        self.track(self.deposit_inner(api_key, address, amount_fiat))
    }

    fn deposit_inner(&self, api_key: &str, address: &str, amount_fiat: Decimal) -> Result<WalletView> {
        let user_id = self.resolve_api_key(api_key)?;
        check_amount(amount_fiat)?;
        let amount_btc = self.converter.to_btc(amount_fiat)?;
        check_supply(amount_btc)?;

        let wallet = self.owned_wallet(user_id, address)?;
        let fee = self
            .fees
            .fee(Party::External, Party::User(wallet.owner_id), amount_btc);
        check_headroom(&wallet, amount_btc - fee)?;

        let posting = Posting::deposit(address, amount_btc, fee);
        if !self.book.post(&posting)? {
            return Err(Error::WalletNotFound(address.to_string()));
        }
        self.record_posting(&posting);

        self.reload(address)
    }

    /// Debit a wallet by a fiat amount converted to BTC.
    ///
    /// The recorded transaction carries the gross amount; the wallet is
    /// debited by the amount net of the withdrawal fee.
    pub fn withdraw(&self, api_key: &str, address: &str, amount_fiat: Decimal) -> Result<WalletView> {
        self.track(self.withdraw_inner(api_key, address, amount_fiat))
    }

    fn withdraw_inner(&self, api_key: &str, address: &str, amount_fiat: Decimal) -> Result<WalletView> {
        let user_id = self.resolve_api_key(api_key)?;
        check_amount(amount_fiat)?;
        let amount_btc = self.converter.to_btc(amount_fiat)?;

        let wallet = self.owned_wallet(user_id, address)?;
        if wallet.balance_btc < amount_btc {
            return Err(Error::InsufficientFunds(address.to_string()));
        }

        let fee = self
            .fees
            .fee(Party::User(wallet.owner_id), Party::External, amount_btc);

        // The store re-checks the balance under its own lock
        let posting = Posting::withdrawal(address, amount_btc, fee);
        if !self.book.post(&posting)? {
            return Err(Error::InsufficientFunds(address.to_string()));
        }
        self.record_posting(&posting);

        self.reload(address)
    }

    /// Move BTC between two wallets; the caller must own the sender.
    ///
    /// Checks run in order and the first failure wins: authentication,
    /// sender exists, sender ownership, sender funds, receiver exists,
    /// distinct addresses. A credit that would push the receiver past
    /// [`MAX_SUPPLY_BTC`] is refused last, with [`Error::InvalidAmount`].
    pub fn transfer(
        &self,
        api_key: &str,
        from_address: &str,
        to_address: &str,
        amount_btc: Decimal,
    ) -> Result<Transaction> {
        self.track(self.transfer_inner(api_key, from_address, to_address, amount_btc))
    }

    fn transfer_inner(
        &self,
        api_key: &str,
        from_address: &str,
        to_address: &str,
        amount_btc: Decimal,
    ) -> Result<Transaction> {
        let user_id = self.resolve_api_key(api_key)?;
        check_amount(amount_btc)?;

        let sender = self
            .book
            .find(from_address)?
            .ok_or_else(|| Error::SenderNotFound(from_address.to_string()))?;
        if sender.owner_id != user_id {
            tracing::warn!(user_id = %user_id, address = %from_address, "Transfer from foreign wallet");
            return Err(Error::Forbidden(from_address.to_string()));
        }
        if sender.balance_btc < amount_btc {
            return Err(Error::InsufficientFunds(from_address.to_string()));
        }

        let receiver = self
            .book
            .find(to_address)?
            .ok_or_else(|| Error::ReceiverNotFound(to_address.to_string()))?;
        if from_address == to_address {
            return Err(Error::SameWallet(from_address.to_string()));
        }

        let fee = self.fees.fee(
            Party::User(sender.owner_id),
            Party::User(receiver.owner_id),
            amount_btc,
        );
        check_headroom(&receiver, amount_btc - fee)?;

        let posting = Posting::transfer(from_address, to_address, amount_btc, fee);
        if !self.book.post(&posting)? {
            return Err(Error::InsufficientFunds(from_address.to_string()));
        }
        self.record_posting(&posting);

        Ok(posting.transaction)
    }

    // Statistics

    /// Transaction count and platform profit; requires the admin key
    pub fn get_statistics(&self, admin_api_key: &str) -> Result<Statistics> {
        self.track(self.get_statistics_inner(admin_api_key))
    }

    fn get_statistics_inner(&self, admin_api_key: &str) -> Result<Statistics> {
        let authorized: bool = admin_api_key
            .as_bytes()
            .ct_eq(self.config.admin_api_key.as_bytes())
            .into();
        if !authorized {
            tracing::warn!("Statistics requested with invalid admin key");
            return Err(Error::Forbidden("statistics".to_string()));
        }

        let transactions = self.book.all()?;
        let profit_btc: Decimal = transactions.iter().map(|tx| tx.fee_btc).sum();

        Ok(Statistics {
            total_transactions: transactions.len() as u64,
            profit_btc,
            profit_fiat: self.converter.to_fiat(profit_btc)?,
            fiat_currency: self.config.fiat_currency.clone(),
        })
    }

    // Helpers

    /// Wallet at `address`, provided `user_id` owns it
    fn owned_wallet(&self, user_id: UserId, address: &str) -> Result<Wallet> {
        let wallet = self
            .book
            .find(address)?
            .ok_or_else(|| Error::WalletNotFound(address.to_string()))?;

        if wallet.owner_id != user_id {
            tracing::warn!(user_id = %user_id, address = %address, "Access to foreign wallet");
            return Err(Error::Forbidden(address.to_string()));
        }

        Ok(wallet)
    }

    fn reload(&self, address: &str) -> Result<WalletView> {
        let wallet = self
            .book
            .find(address)?
            .ok_or_else(|| Error::WalletNotFound(address.to_string()))?;
        self.view(wallet)
    }

    fn view(&self, wallet: Wallet) -> Result<WalletView> {
        Ok(WalletView {
            balance_fiat: self.converter.to_fiat(wallet.balance_btc)?,
            balance_btc: wallet.balance_btc,
            owner_id: wallet.owner_id,
            address: wallet.address,
        })
    }

    fn record_posting(&self, posting: &Posting) {
        let tx = &posting.transaction;
        if let Some(metrics) = &self.metrics {
            metrics.record_posting(posting.kind());
        }
        tracing::info!(
            kind = %posting.kind(),
            from = %tx.from_address,
            to = %tx.to_address,
            amount_btc = %tx.amount_btc,
            fee_btc = %tx.fee_btc,
            "Transaction recorded"
        );
    }

    /// Count domain rejections; infrastructure errors pass through untouched
    fn track<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            if err.is_infrastructure() {
                tracing::error!(error = %err, "Ledger operation failed");
            } else if let Some(metrics) = &self.metrics {
                metrics.record_rejection(err.reason());
            }
        }
        result
    }
}

fn check_amount(amount: Decimal) -> Result<()> {
    if amount < Decimal::ZERO {
        return Err(Error::InvalidAmount(format!("amount must not be negative, got {}", amount)));
    }
    Ok(())
}

fn check_supply(amount_btc: Decimal) -> Result<()> {
    if amount_btc > MAX_SUPPLY_BTC {
        return Err(Error::InvalidAmount(format!(
            "{} BTC exceeds the {} BTC supply",
            amount_btc, MAX_SUPPLY_BTC
        )));
    }
    Ok(())
}

/// Early reject for credits the store would refuse
fn check_headroom(wallet: &Wallet, credit: Decimal) -> Result<()> {
    match wallet.balance_btc.checked_add(credit) {
        Some(total) if total <= MAX_SUPPLY_BTC => Ok(()),
        _ => Err(Error::InvalidAmount(format!(
            "wallet {} cannot hold more than {} BTC",
            wallet.address, MAX_SUPPLY_BTC
        ))),
    }
}
