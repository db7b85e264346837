//! Repository contracts and in-memory adapters
//!
//! The engine only talks to these traits. Two adapter families exist:
//! the in-memory stores below (tests, single-process deployments) and the
//! RocksDB-backed [`crate::storage::Storage`].
//!
//! # Atomicity
//!
//! Balance changes go through [`LedgerBook::post`], which appends the
//! transaction record and applies the debit and credit as one unit. Wallet
//! locks are taken in lexicographic address order so that two transfers
//! crossing in opposite directions cannot deadlock.

use crate::{
    types::{Posting, Transaction, User, UserId, Wallet, MAX_SUPPLY_BTC},
    Error, Result,
};
use chrono::Utc;
use dashmap::{mapref::entry::Entry, DashMap};
use parking_lot::{Mutex, MutexGuard, RwLock};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;

/// Persists users and assigns user IDs
pub trait UserStore: Send + Sync {
    /// Add a user; `None` when the username is taken
    fn add_user(&self, username: &str, password_hash: &str) -> Result<Option<User>>;

    /// Look up by username
    fn find_by_username(&self, username: &str) -> Result<Option<User>>;

    /// Look up by ID
    fn find_by_id(&self, id: UserId) -> Result<Option<User>>;

    /// ID the next successful `add_user` will assign
    fn next_id(&self) -> Result<UserId>;

    /// Delete a user, freeing the username. IDs are not reused.
    fn remove_user(&self, id: UserId) -> Result<()>;
}

/// Maps issued API keys to users
pub trait ApiKeyStore: Send + Sync {
    /// Bind a key to a user. Keys are never rebound.
    fn bind(&self, api_key: &str, user_id: UserId) -> Result<()>;

    /// Resolve a key; `None` for unknown keys
    fn resolve(&self, api_key: &str) -> Result<Option<UserId>>;
}

/// Persists wallets and their balances
pub trait WalletStore: Send + Sync {
    /// Insert a new wallet. Fails if the address exists.
    fn add_wallet(&self, wallet: &Wallet) -> Result<()>;

    /// Look up by address
    fn find(&self, address: &str) -> Result<Option<Wallet>>;

    /// Atomically credit `amount`; `false` if the wallet does not exist.
    /// Fails with `InvalidAmount` if the balance would exceed the supply cap.
    fn deposit(&self, address: &str, amount: Decimal) -> Result<bool>;

    /// Atomically debit `amount`; `false` if missing or the balance is short
    fn withdraw(&self, address: &str, amount: Decimal) -> Result<bool>;

    /// Number of wallets owned by a user
    fn count_by_owner(&self, owner_id: UserId) -> Result<usize>;

    /// All wallets owned by a user
    fn list_by_owner(&self, owner_id: UserId) -> Result<Vec<Wallet>>;
}

/// Append-only transaction log
pub trait TransactionStore: Send + Sync {
    /// Append a record
    fn append(&self, transaction: &Transaction) -> Result<()>;

    /// Records whose source or destination is `address`, in insertion order
    fn find_by_address(&self, address: &str) -> Result<Vec<Transaction>>;

    /// Every record, in insertion order
    fn all(&self) -> Result<Vec<Transaction>>;
}

/// Wallets plus transaction log with atomic postings
pub trait LedgerBook: WalletStore + TransactionStore {
    /// Apply a posting as one unit.
    ///
    /// Returns `false` and writes nothing when a wallet is missing or the
    /// debit would drive a balance negative. A credit past the supply cap
    /// fails with `InvalidAmount`, also without writing anything.
    fn post(&self, posting: &Posting) -> Result<bool>;
}

/// `balance + amount`; `InvalidAmount` when the result exceeds [`MAX_SUPPLY_BTC`]
pub(crate) fn credit_balance(address: &str, balance: Decimal, amount: Decimal) -> Result<Decimal> {
    match balance.checked_add(amount) {
        Some(total) if total <= MAX_SUPPLY_BTC => Ok(total),
        _ => Err(Error::InvalidAmount(format!(
            "credit of {} would push wallet {} past {} BTC",
            amount, address, MAX_SUPPLY_BTC
        ))),
    }
}

/// `balance - amount`; `None` when the balance is short
pub(crate) fn debit_balance(address: &str, balance: Decimal, amount: Decimal) -> Result<Option<Decimal>> {
    if balance < amount {
        return Ok(None);
    }
    balance.checked_sub(amount).map(Some).ok_or_else(|| {
        Error::InvalidAmount(format!("debit of {} overflows wallet {}", amount, address))
    })
}

// In-memory users

#[derive(Default)]
struct UserTable {
    by_id: HashMap<UserId, User>,
    by_name: HashMap<String, UserId>,
    last_id: u64,
}

/// In-memory [`UserStore`]; IDs start at 1
#[derive(Default)]
pub struct MemoryUserStore {
    table: RwLock<UserTable>,
}

impl MemoryUserStore {
    /// Create empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl UserStore for MemoryUserStore {
    fn add_user(&self, username: &str, password_hash: &str) -> Result<Option<User>> {
        let mut table = self.table.write();
        if table.by_name.contains_key(username) {
            return Ok(None);
        }

        table.last_id += 1;
        let user = User {
            id: UserId::new(table.last_id),
            username: username.to_string(),
            password_hash: password_hash.to_string(),
            registered_at: Utc::now(),
        };
        table.by_name.insert(user.username.clone(), user.id);
        table.by_id.insert(user.id, user.clone());

        Ok(Some(user))
    }

    fn find_by_username(&self, username: &str) -> Result<Option<User>> {
        let table = self.table.read();
        Ok(table
            .by_name
            .get(username)
            .and_then(|id| table.by_id.get(id))
            .cloned())
    }

    fn find_by_id(&self, id: UserId) -> Result<Option<User>> {
        Ok(self.table.read().by_id.get(&id).cloned())
    }

    fn next_id(&self) -> Result<UserId> {
        Ok(UserId::new(self.table.read().last_id + 1))
    }

    fn remove_user(&self, id: UserId) -> Result<()> {
        let mut table = self.table.write();
        if let Some(user) = table.by_id.remove(&id) {
            table.by_name.remove(&user.username);
        }
        Ok(())
    }
}

// In-memory API keys

/// In-memory [`ApiKeyStore`]
#[derive(Default)]
pub struct MemoryApiKeyStore {
    keys: DashMap<String, UserId>,
}

impl MemoryApiKeyStore {
    /// Create empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl ApiKeyStore for MemoryApiKeyStore {
    fn bind(&self, api_key: &str, user_id: UserId) -> Result<()> {
        match self.keys.entry(api_key.to_string()) {
            Entry::Occupied(_) => Err(Error::Storage("API key already bound".to_string())),
            Entry::Vacant(slot) => {
                slot.insert(user_id);
                Ok(())
            }
        }
    }

    fn resolve(&self, api_key: &str) -> Result<Option<UserId>> {
        Ok(self.keys.get(api_key).map(|entry| *entry.value()))
    }
}

// In-memory wallets + transaction log

struct WalletSlot {
    owner_id: UserId,
    balance: Mutex<Decimal>,
}

/// In-memory [`LedgerBook`]
///
/// Each wallet balance sits behind its own mutex; the address map is only
/// write-locked when a wallet is added.
#[derive(Default)]
pub struct MemoryBook {
    wallets: RwLock<HashMap<String, Arc<WalletSlot>>>,
    log: Mutex<Vec<Transaction>>,
}

impl MemoryBook {
    /// Create empty book
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, address: &str) -> Option<Arc<WalletSlot>> {
        self.wallets.read().get(address).cloned()
    }
}

fn balance_of<'a>(
    guards: &'a mut [(&str, MutexGuard<'_, Decimal>)],
    address: &str,
) -> Result<&'a mut Decimal> {
    guards
        .iter_mut()
        .find(|(locked, _)| *locked == address)
        .map(|(_, guard)| &mut **guard)
        .ok_or_else(|| Error::Storage(format!("wallet {} not locked for posting", address)))
}

impl WalletStore for MemoryBook {
    fn add_wallet(&self, wallet: &Wallet) -> Result<()> {
        let mut wallets = self.wallets.write();
        if wallets.contains_key(&wallet.address) {
            return Err(Error::Storage(format!(
                "wallet address {} already exists",
                wallet.address
            )));
        }

        wallets.insert(
            wallet.address.clone(),
            Arc::new(WalletSlot {
                owner_id: wallet.owner_id,
                balance: Mutex::new(wallet.balance_btc),
            }),
        );

        Ok(())
    }

    fn find(&self, address: &str) -> Result<Option<Wallet>> {
        Ok(self.slot(address).map(|slot| {
            let balance = *slot.balance.lock();
            Wallet::new(slot.owner_id, address, balance)
        }))
    }

    fn deposit(&self, address: &str, amount: Decimal) -> Result<bool> {
        let Some(slot) = self.slot(address) else {
            return Ok(false);
        };
        let mut balance = slot.balance.lock();
        *balance = credit_balance(address, *balance, amount)?;
        Ok(true)
    }

    fn withdraw(&self, address: &str, amount: Decimal) -> Result<bool> {
        let Some(slot) = self.slot(address) else {
            return Ok(false);
        };

        let mut balance = slot.balance.lock();
        match debit_balance(address, *balance, amount)? {
            Some(remaining) => {
                *balance = remaining;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn count_by_owner(&self, owner_id: UserId) -> Result<usize> {
        Ok(self
            .wallets
            .read()
            .values()
            .filter(|slot| slot.owner_id == owner_id)
            .count())
    }

    fn list_by_owner(&self, owner_id: UserId) -> Result<Vec<Wallet>> {
        let wallets = self.wallets.read();
        let mut owned: Vec<Wallet> = wallets
            .iter()
            .filter(|(_, slot)| slot.owner_id == owner_id)
            .map(|(address, slot)| Wallet::new(owner_id, address.clone(), *slot.balance.lock()))
            .collect();
        owned.sort_by(|a, b| a.address.cmp(&b.address));
        Ok(owned)
    }
}

impl TransactionStore for MemoryBook {
    fn append(&self, transaction: &Transaction) -> Result<()> {
        self.log.lock().push(transaction.clone());
        Ok(())
    }

    fn find_by_address(&self, address: &str) -> Result<Vec<Transaction>> {
        Ok(self
            .log
            .lock()
            .iter()
            .filter(|tx| tx.involves(address))
            .cloned()
            .collect())
    }

    fn all(&self) -> Result<Vec<Transaction>> {
        Ok(self.log.lock().clone())
    }
}

impl LedgerBook for MemoryBook {
    fn post(&self, posting: &Posting) -> Result<bool> {
        // Addresses come back sorted, which fixes the lock order
        let mut slots = Vec::new();
        {
            let wallets = self.wallets.read();
            for address in posting.addresses() {
                match wallets.get(address) {
                    Some(slot) => slots.push((address, slot.clone())),
                    None => return Ok(false),
                }
            }
        }

        let mut guards: Vec<(&str, MutexGuard<'_, Decimal>)> = slots
            .iter()
            .map(|(address, slot)| (*address, slot.balance.lock()))
            .collect();

        // Compute every new balance before anything is written
        let mut updates: Vec<(&str, Decimal)> = Vec::with_capacity(2);
        if let Some(debit) = &posting.debit {
            let balance = *balance_of(&mut guards, &debit.address)?;
            match debit_balance(&debit.address, balance, debit.amount)? {
                Some(balance) => updates.push((debit.address.as_str(), balance)),
                None => return Ok(false),
            }
        }
        if let Some(credit) = &posting.credit {
            let balance = match updates.iter().find(|(address, _)| *address == credit.address) {
                Some((_, pending)) => *pending,
                None => *balance_of(&mut guards, &credit.address)?,
            };
            let balance = credit_balance(&credit.address, balance, credit.amount)?;
            updates.retain(|(address, _)| *address != credit.address);
            updates.push((credit.address.as_str(), balance));
        }

        self.log.lock().push(posting.transaction.clone());
        for (address, balance) in updates {
            *balance_of(&mut guards, address)? = balance;
        }

        tracing::debug!(
            kind = %posting.kind(),
            from = %posting.transaction.from_address,
            to = %posting.transaction.to_address,
            "Posting applied"
        );

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DEPOSIT_ADDRESS, WITHDRAW_ADDRESS};
    use std::thread;

    fn book_with(wallets: &[(&str, u64, i64)]) -> MemoryBook {
        let book = MemoryBook::new();
        for (address, owner, balance) in wallets {
            book.add_wallet(&Wallet::new(UserId::new(*owner), *address, Decimal::from(*balance)))
                .unwrap();
        }
        book
    }

    #[test]
    fn test_user_store_rejects_duplicate_username() {
        let users = MemoryUserStore::new();
        assert_eq!(users.next_id().unwrap(), UserId::new(1));

        let alice = users.add_user("alice", "h1").unwrap().unwrap();
        assert_eq!(alice.id, UserId::new(1));
        assert!(users.add_user("alice", "h2").unwrap().is_none());

        let found = users.find_by_username("alice").unwrap().unwrap();
        assert_eq!(found.password_hash, "h1");
        assert_eq!(users.find_by_id(alice.id).unwrap().unwrap().username, "alice");
        assert_eq!(users.next_id().unwrap(), UserId::new(2));
    }

    #[test]
    fn test_removed_user_frees_username() {
        let users = MemoryUserStore::new();
        let alice = users.add_user("alice", "h1").unwrap().unwrap();
        users.remove_user(alice.id).unwrap();

        assert!(users.find_by_username("alice").unwrap().is_none());
        assert!(users.find_by_id(alice.id).unwrap().is_none());

        let again = users.add_user("alice", "h2").unwrap().unwrap();
        assert_eq!(again.id, UserId::new(2));
    }

    #[test]
    fn test_api_key_bind_and_resolve() {
        let keys = MemoryApiKeyStore::new();
        keys.bind("k1", UserId::new(7)).unwrap();

        assert_eq!(keys.resolve("k1").unwrap(), Some(UserId::new(7)));
        assert_eq!(keys.resolve("missing").unwrap(), None);
        assert!(keys.bind("k1", UserId::new(8)).is_err());
        assert_eq!(keys.resolve("k1").unwrap(), Some(UserId::new(7)));
    }

    #[test]
    fn test_wallet_deposit_withdraw() {
        let book = book_with(&[("w1", 1, 1)]);

        assert!(book.deposit("w1", Decimal::from(2)).unwrap());
        assert!(book.withdraw("w1", Decimal::from(3)).unwrap());
        assert!(!book.withdraw("w1", Decimal::ONE).unwrap());
        assert!(!book.deposit("nope", Decimal::ONE).unwrap());
        assert_eq!(book.find("w1").unwrap().unwrap().balance_btc, Decimal::ZERO);
    }

    #[test]
    fn test_duplicate_address_rejected() {
        let book = book_with(&[("w1", 1, 1)]);
        let result = book.add_wallet(&Wallet::new(UserId::new(2), "w1", Decimal::ONE));
        assert!(matches!(result, Err(Error::Storage(_))));
    }

    #[test]
    fn test_count_and_list_by_owner() {
        let book = book_with(&[("b", 1, 1), ("a", 1, 2), ("c", 2, 3)]);

        assert_eq!(book.count_by_owner(UserId::new(1)).unwrap(), 2);
        assert_eq!(book.count_by_owner(UserId::new(3)).unwrap(), 0);

        let owned = book.list_by_owner(UserId::new(1)).unwrap();
        let addresses: Vec<_> = owned.iter().map(|w| w.address.as_str()).collect();
        assert_eq!(addresses, vec!["a", "b"]);
    }

    #[test]
    fn test_post_transfer_is_all_or_nothing() {
        let book = book_with(&[("w1", 1, 1), ("w2", 2, 0)]);

        let too_much = Posting::transfer("w1", "w2", Decimal::from(2), Decimal::ZERO);
        assert!(!book.post(&too_much).unwrap());
        assert!(book.all().unwrap().is_empty());
        assert_eq!(book.find("w1").unwrap().unwrap().balance_btc, Decimal::ONE);

        let fee = Decimal::new(15, 3);
        let ok = Posting::transfer("w1", "w2", Decimal::ONE, fee);
        assert!(book.post(&ok).unwrap());
        assert_eq!(book.find("w1").unwrap().unwrap().balance_btc, Decimal::ZERO);
        assert_eq!(book.find("w2").unwrap().unwrap().balance_btc, Decimal::ONE - fee);
        assert_eq!(book.all().unwrap(), vec![ok.transaction]);
    }

    #[test]
    fn test_post_overflow_writes_nothing() {
        let book = MemoryBook::new();
        book.add_wallet(&Wallet::new(UserId::new(1), "w1", Decimal::ONE))
            .unwrap();
        book.add_wallet(&Wallet::new(UserId::new(2), "full", Decimal::MAX))
            .unwrap();

        let credit = book.post(&Posting::deposit("full", Decimal::ONE, Decimal::ZERO));
        assert!(matches!(credit, Err(Error::InvalidAmount(_))));
        let transfer = book.post(&Posting::transfer("w1", "full", Decimal::ONE, Decimal::ZERO));
        assert!(matches!(transfer, Err(Error::InvalidAmount(_))));
        assert!(matches!(book.deposit("full", Decimal::ONE), Err(Error::InvalidAmount(_))));

        assert!(book.all().unwrap().is_empty());
        assert_eq!(book.find("w1").unwrap().unwrap().balance_btc, Decimal::ONE);
        assert_eq!(book.find("full").unwrap().unwrap().balance_btc, Decimal::MAX);
    }

    #[test]
    fn test_post_missing_wallet_writes_nothing() {
        let book = book_with(&[("w1", 1, 1)]);
        let posting = Posting::transfer("w1", "ghost", Decimal::ONE, Decimal::ZERO);

        assert!(!book.post(&posting).unwrap());
        assert!(book.all().unwrap().is_empty());
    }

    #[test]
    fn test_find_by_address_keeps_insertion_order() {
        let book = book_with(&[("w1", 1, 5), ("w2", 2, 0)]);
        book.post(&Posting::deposit("w1", Decimal::ONE, Decimal::ZERO)).unwrap();
        book.post(&Posting::transfer("w1", "w2", Decimal::ONE, Decimal::ZERO)).unwrap();
        book.post(&Posting::withdrawal("w1", Decimal::ONE, Decimal::ZERO)).unwrap();

        let history = book.find_by_address("w1").unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].from_address, DEPOSIT_ADDRESS);
        assert_eq!(history[1].to_address, "w2");
        assert_eq!(history[2].to_address, WITHDRAW_ADDRESS);
        assert_eq!(book.find_by_address("w2").unwrap().len(), 1);
    }

    #[test]
    fn test_concurrent_withdrawals_never_overdraw() {
        let book = Arc::new(book_with(&[("w1", 1, 10)]));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let book = book.clone();
                thread::spawn(move || {
                    (0..5)
                        .filter(|_| {
                            book.post(&Posting::withdrawal("w1", Decimal::ONE, Decimal::ZERO))
                                .unwrap()
                        })
                        .count()
                })
            })
            .collect();

        let succeeded: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(succeeded, 10);
        assert_eq!(book.find("w1").unwrap().unwrap().balance_btc, Decimal::ZERO);
        assert_eq!(book.all().unwrap().len(), 10);
    }

    #[test]
    fn test_crossing_transfers_do_not_deadlock() {
        let book = Arc::new(book_with(&[("a", 1, 100), ("b", 2, 100)]));

        let forward = {
            let book = book.clone();
            thread::spawn(move || {
                for _ in 0..200 {
                    book.post(&Posting::transfer("a", "b", Decimal::ONE, Decimal::ZERO)).unwrap();
                }
            })
        };
        let backward = {
            let book = book.clone();
            thread::spawn(move || {
                for _ in 0..200 {
                    book.post(&Posting::transfer("b", "a", Decimal::ONE, Decimal::ZERO)).unwrap();
                }
            })
        };
        forward.join().unwrap();
        backward.join().unwrap();

        let total = book.find("a").unwrap().unwrap().balance_btc
            + book.find("b").unwrap().unwrap().balance_btc;
        assert_eq!(total, Decimal::from(200));
    }
}
