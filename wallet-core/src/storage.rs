//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `users` - Registered users (key: user_id)
//! - `usernames` - Username index (key: username -> user_id)
//! - `api_keys` - Issued API keys (key: api_key -> user_id)
//! - `wallets` - Wallets with balances (key: address)
//! - `owner_wallets` - Owner index (key: user_id || address)
//! - `transactions` - Append-only transaction log (key: sequence)
//! - `address_transactions` - Address index (key: address || sequence)
//! - `meta` - Counters (next user id, next sequence)
//!
//! Every read-modify-write runs under a single writer lock and commits as
//! one `WriteBatch`, so a posting's log append and balance changes land
//! together or not at all.

use crate::{
    store::{
        credit_balance, debit_balance, ApiKeyStore, LedgerBook, TransactionStore, UserStore,
        WalletStore,
    },
    types::{Posting, Transaction, User, UserId, Wallet},
    Config, Error, Result,
};
use chrono::Utc;
use parking_lot::Mutex;
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB,
};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Column family names
const CF_USERS: &str = "users";
const CF_USERNAMES: &str = "usernames";
const CF_API_KEYS: &str = "api_keys";
const CF_WALLETS: &str = "wallets";
const CF_OWNER_WALLETS: &str = "owner_wallets";
const CF_TRANSACTIONS: &str = "transactions";
const CF_ADDRESS_TRANSACTIONS: &str = "address_transactions";
const CF_META: &str = "meta";

const COLUMN_FAMILIES: [&str; 8] = [
    CF_USERS,
    CF_USERNAMES,
    CF_API_KEYS,
    CF_WALLETS,
    CF_OWNER_WALLETS,
    CF_TRANSACTIONS,
    CF_ADDRESS_TRANSACTIONS,
    CF_META,
];

/// Meta keys
const META_LAST_USER_ID: &[u8] = b"last_user_id";
const META_NEXT_SEQUENCE: &[u8] = b"next_sequence";

/// Storage wrapper for RocksDB
pub struct Storage {
    db: Arc<DB>,
    write_lock: Mutex<()>,
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        // Create directory if not exists
        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        // Tuning from config
        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name)))
            .collect::<Vec<_>>();

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!(
            path = ?path,
            column_families = COLUMN_FAMILIES.len(),
            "Opened RocksDB"
        );

        Ok(Self {
            db: Arc::new(db),
            write_lock: Mutex::new(()),
        })
    }

    fn cf_options(name: &str) -> Options {
        let mut opts = Options::default();
        match name {
            // Log is written once and scanned rarely
            CF_TRANSACTIONS => {
                opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
            }
            CF_OWNER_WALLETS | CF_ADDRESS_TRANSACTIONS | CF_USERNAMES | CF_API_KEYS => {
                let mut block_opts = rocksdb::BlockBasedOptions::default();
                block_opts.set_bloom_filter(10.0, false);
                opts.set_block_based_table_factory(&block_opts);
                opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
            }
            _ => {
                opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
            }
        }
        opts
    }

    fn cf_handle(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    fn get_u64(&self, cf_name: &str, key: &[u8]) -> Result<Option<u64>> {
        let cf = self.cf_handle(cf_name)?;
        match self.db.get_cf(&cf, key)? {
            Some(bytes) => Ok(Some(decode_u64(&bytes)?)),
            None => Ok(None),
        }
    }

    fn load_wallet(&self, address: &str) -> Result<Option<Wallet>> {
        let cf = self.cf_handle(CF_WALLETS)?;
        match self.db.get_cf(&cf, address.as_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    fn load_transaction(&self, sequence: u64) -> Result<Transaction> {
        let cf = self.cf_handle(CF_TRANSACTIONS)?;
        let value = self
            .db
            .get_cf(&cf, sequence.to_be_bytes())?
            .ok_or_else(|| Error::Storage(format!("Transaction {} missing from log", sequence)))?;
        Ok(bincode::deserialize(&value)?)
    }

    /// Stage a wallet write
    fn stage_wallet(&self, batch: &mut WriteBatch, wallet: &Wallet) -> Result<()> {
        let cf = self.cf_handle(CF_WALLETS)?;
        batch.put_cf(&cf, wallet.address.as_bytes(), bincode::serialize(wallet)?);
        Ok(())
    }

    /// Stage a log append plus its address index entries. Caller holds the writer lock.
    fn stage_transaction(&self, batch: &mut WriteBatch, transaction: &Transaction) -> Result<()> {
        let sequence = self.get_u64(CF_META, META_NEXT_SEQUENCE)?.unwrap_or(0);

        let cf_log = self.cf_handle(CF_TRANSACTIONS)?;
        batch.put_cf(&cf_log, sequence.to_be_bytes(), bincode::serialize(transaction)?);

        let cf_index = self.cf_handle(CF_ADDRESS_TRANSACTIONS)?;
        batch.put_cf(
            &cf_index,
            index_key(transaction.from_address.as_bytes(), sequence),
            b"",
        );
        if transaction.to_address != transaction.from_address {
            batch.put_cf(
                &cf_index,
                index_key(transaction.to_address.as_bytes(), sequence),
                b"",
            );
        }

        let cf_meta = self.cf_handle(CF_META)?;
        batch.put_cf(&cf_meta, META_NEXT_SEQUENCE, (sequence + 1).to_be_bytes());

        Ok(())
    }

    /// Keys in `cf_name` that start with `prefix`, in key order
    fn scan_prefix(&self, cf_name: &str, prefix: &[u8]) -> Result<Vec<Box<[u8]>>> {
        let cf = self.cf_handle(cf_name)?;
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward));

        let mut keys = Vec::new();
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            keys.push(key);
        }
        Ok(keys)
    }

    /// Close database (graceful shutdown)
    pub fn close(self) -> Result<()> {
        drop(self.db);
        tracing::info!("RocksDB closed gracefully");
        Ok(())
    }
}

// Key helpers

fn decode_u64(bytes: &[u8]) -> Result<u64> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| Error::Storage(format!("Expected 8-byte integer, got {} bytes", bytes.len())))?;
    Ok(u64::from_be_bytes(raw))
}

fn index_key(prefix: &[u8], sequence: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + 9);
    key.extend_from_slice(prefix);
    key.push(b'|');
    key.extend_from_slice(&sequence.to_be_bytes());
    key
}

fn address_prefix(address: &str) -> Vec<u8> {
    let mut prefix = address.as_bytes().to_vec();
    prefix.push(b'|');
    prefix
}

fn owner_key(owner_id: UserId, address: &str) -> Vec<u8> {
    let mut key = owner_id.get().to_be_bytes().to_vec();
    key.extend_from_slice(address.as_bytes());
    key
}

impl UserStore for Storage {
    fn add_user(&self, username: &str, password_hash: &str) -> Result<Option<User>> {
        let _guard = self.write_lock.lock();

        let cf_names = self.cf_handle(CF_USERNAMES)?;
        if self.db.get_cf(&cf_names, username.as_bytes())?.is_some() {
            return Ok(None);
        }

        let id = self.get_u64(CF_META, META_LAST_USER_ID)?.unwrap_or(0) + 1;
        let user = User {
            id: UserId::new(id),
            username: username.to_string(),
            password_hash: password_hash.to_string(),
            registered_at: Utc::now(),
        };

        let mut batch = WriteBatch::default();
        let cf_users = self.cf_handle(CF_USERS)?;
        batch.put_cf(&cf_users, id.to_be_bytes(), bincode::serialize(&user)?);
        batch.put_cf(&cf_names, username.as_bytes(), id.to_be_bytes());
        let cf_meta = self.cf_handle(CF_META)?;
        batch.put_cf(&cf_meta, META_LAST_USER_ID, id.to_be_bytes());
        self.db.write(batch)?;

        tracing::debug!(user_id = id, "User stored");

        Ok(Some(user))
    }

    fn find_by_username(&self, username: &str) -> Result<Option<User>> {
        match self.get_u64(CF_USERNAMES, username.as_bytes())? {
            Some(id) => self.find_by_id(UserId::new(id)),
            None => Ok(None),
        }
    }

    fn find_by_id(&self, id: UserId) -> Result<Option<User>> {
        let cf = self.cf_handle(CF_USERS)?;
        match self.db.get_cf(&cf, id.get().to_be_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    fn next_id(&self) -> Result<UserId> {
        let last = self.get_u64(CF_META, META_LAST_USER_ID)?.unwrap_or(0);
        Ok(UserId::new(last + 1))
    }

    fn remove_user(&self, id: UserId) -> Result<()> {
        let _guard = self.write_lock.lock();

        let Some(user) = self.find_by_id(id)? else {
            return Ok(());
        };

        let mut batch = WriteBatch::default();
        let cf_users = self.cf_handle(CF_USERS)?;
        batch.delete_cf(&cf_users, id.get().to_be_bytes());
        let cf_names = self.cf_handle(CF_USERNAMES)?;
        batch.delete_cf(&cf_names, user.username.as_bytes());
        self.db.write(batch)?;

        tracing::debug!(user_id = %id, "User removed");
        Ok(())
    }
}

impl ApiKeyStore for Storage {
    fn bind(&self, api_key: &str, user_id: UserId) -> Result<()> {
        let _guard = self.write_lock.lock();

        let cf = self.cf_handle(CF_API_KEYS)?;
        if self.db.get_cf(&cf, api_key.as_bytes())?.is_some() {
            return Err(Error::Storage("API key already bound".to_string()));
        }
        self.db.put_cf(&cf, api_key.as_bytes(), user_id.get().to_be_bytes())?;
        Ok(())
    }

    fn resolve(&self, api_key: &str) -> Result<Option<UserId>> {
        Ok(self
            .get_u64(CF_API_KEYS, api_key.as_bytes())?
            .map(UserId::new))
    }
}

impl WalletStore for Storage {
    fn add_wallet(&self, wallet: &Wallet) -> Result<()> {
        let _guard = self.write_lock.lock();

        if self.load_wallet(&wallet.address)?.is_some() {
            return Err(Error::Storage(format!(
                "wallet address {} already exists",
                wallet.address
            )));
        }

        let mut batch = WriteBatch::default();
        self.stage_wallet(&mut batch, wallet)?;
        let cf_owner = self.cf_handle(CF_OWNER_WALLETS)?;
        batch.put_cf(&cf_owner, owner_key(wallet.owner_id, &wallet.address), b"");
        self.db.write(batch)?;

        tracing::debug!(
            owner_id = %wallet.owner_id,
            address = %wallet.address,
            "Wallet stored"
        );

        Ok(())
    }

    fn find(&self, address: &str) -> Result<Option<Wallet>> {
        self.load_wallet(address)
    }

    fn deposit(&self, address: &str, amount: Decimal) -> Result<bool> {
        let _guard = self.write_lock.lock();

        let Some(mut wallet) = self.load_wallet(address)? else {
            return Ok(false);
        };
        wallet.balance_btc = credit_balance(address, wallet.balance_btc, amount)?;

        let mut batch = WriteBatch::default();
        self.stage_wallet(&mut batch, &wallet)?;
        self.db.write(batch)?;
        Ok(true)
    }

    fn withdraw(&self, address: &str, amount: Decimal) -> Result<bool> {
        let _guard = self.write_lock.lock();

        let Some(mut wallet) = self.load_wallet(address)? else {
            return Ok(false);
        };
        wallet.balance_btc = match debit_balance(address, wallet.balance_btc, amount)? {
            Some(remaining) => remaining,
            None => return Ok(false),
        };

        let mut batch = WriteBatch::default();
        self.stage_wallet(&mut batch, &wallet)?;
        self.db.write(batch)?;
        Ok(true)
    }

    fn count_by_owner(&self, owner_id: UserId) -> Result<usize> {
        let prefix = owner_id.get().to_be_bytes();
        Ok(self.scan_prefix(CF_OWNER_WALLETS, &prefix)?.len())
    }

    fn list_by_owner(&self, owner_id: UserId) -> Result<Vec<Wallet>> {
        let prefix = owner_id.get().to_be_bytes();
        let mut wallets = Vec::new();
        for key in self.scan_prefix(CF_OWNER_WALLETS, &prefix)? {
            let address = std::str::from_utf8(&key[prefix.len()..])
                .map_err(|e| Error::Storage(format!("Corrupt owner index key: {}", e)))?;
            if let Some(wallet) = self.load_wallet(address)? {
                wallets.push(wallet);
            }
        }
        Ok(wallets)
    }
}

impl TransactionStore for Storage {
    fn append(&self, transaction: &Transaction) -> Result<()> {
        let _guard = self.write_lock.lock();

        let mut batch = WriteBatch::default();
        self.stage_transaction(&mut batch, transaction)?;
        self.db.write(batch)?;
        Ok(())
    }

    fn find_by_address(&self, address: &str) -> Result<Vec<Transaction>> {
        let prefix = address_prefix(address);
        let mut transactions = Vec::new();
        for key in self.scan_prefix(CF_ADDRESS_TRANSACTIONS, &prefix)? {
            // Longer addresses sharing this prefix have a different key length
            if key.len() != prefix.len() + 8 {
                continue;
            }
            let sequence = decode_u64(&key[prefix.len()..])?;
            transactions.push(self.load_transaction(sequence)?);
        }
        Ok(transactions)
    }

    fn all(&self) -> Result<Vec<Transaction>> {
        let cf = self.cf_handle(CF_TRANSACTIONS)?;
        let mut transactions = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item?;
            transactions.push(bincode::deserialize(&value)?);
        }
        Ok(transactions)
    }
}

impl LedgerBook for Storage {
    fn post(&self, posting: &Posting) -> Result<bool> {
        let _guard = self.write_lock.lock();

        let mut wallets = BTreeMap::new();
        for address in posting.addresses() {
            match self.load_wallet(address)? {
                Some(wallet) => {
                    wallets.insert(address.to_string(), wallet);
                }
                None => return Ok(false),
            }
        }

        if let Some(debit) = &posting.debit {
            let wallet = wallets
                .get_mut(&debit.address)
                .ok_or_else(|| Error::Storage(format!("wallet {} not loaded", debit.address)))?;
            wallet.balance_btc = match debit_balance(&debit.address, wallet.balance_btc, debit.amount)? {
                Some(remaining) => remaining,
                None => return Ok(false),
            };
        }

        if let Some(credit) = &posting.credit {
            let wallet = wallets
                .get_mut(&credit.address)
                .ok_or_else(|| Error::Storage(format!("wallet {} not loaded", credit.address)))?;
            wallet.balance_btc = credit_balance(&credit.address, wallet.balance_btc, credit.amount)?;
        }

        let mut batch = WriteBatch::default();
        self.stage_transaction(&mut batch, &posting.transaction)?;
        for wallet in wallets.values() {
            self.stage_wallet(&mut batch, wallet)?;
        }

        // Atomic commit
        self.db.write(batch)?;

        tracing::debug!(
            kind = %posting.kind(),
            from = %posting.transaction.from_address,
            to = %posting.transaction.to_address,
            "Posting committed"
        );

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DEPOSIT_ADDRESS;
    use tempfile::TempDir;

    fn test_storage() -> (Storage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        (Storage::open(&config).unwrap(), temp_dir)
    }

    #[test]
    fn test_storage_open() {
        let (storage, _temp) = test_storage();
        for name in COLUMN_FAMILIES {
            assert!(storage.db.cf_handle(name).is_some());
        }
    }

    #[test]
    fn test_users_and_keys() {
        let (storage, _temp) = test_storage();

        let alice = storage.add_user("alice", "hash").unwrap().unwrap();
        assert_eq!(alice.id, UserId::new(1));
        assert!(storage.add_user("alice", "other").unwrap().is_none());
        assert_eq!(storage.next_id().unwrap(), UserId::new(2));
        assert_eq!(
            storage.find_by_username("alice").unwrap().unwrap().id,
            alice.id
        );

        storage.bind("key-1", alice.id).unwrap();
        assert_eq!(storage.resolve("key-1").unwrap(), Some(alice.id));
        assert_eq!(storage.resolve("key-2").unwrap(), None);
        assert!(storage.bind("key-1", UserId::new(9)).is_err());
    }

    #[test]
    fn test_wallet_owner_index() {
        let (storage, _temp) = test_storage();
        let owner = UserId::new(1);

        storage.add_wallet(&Wallet::new(owner, "w1", Decimal::ONE)).unwrap();
        storage.add_wallet(&Wallet::new(owner, "w2", Decimal::ONE)).unwrap();
        storage
            .add_wallet(&Wallet::new(UserId::new(2), "w3", Decimal::ONE))
            .unwrap();
        assert!(storage.add_wallet(&Wallet::new(owner, "w1", Decimal::ONE)).is_err());

        assert_eq!(storage.count_by_owner(owner).unwrap(), 2);
        let listed = storage.list_by_owner(owner).unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|w| w.owner_id == owner));
    }

    #[test]
    fn test_atomic_posting() {
        let (storage, _temp) = test_storage();
        storage
            .add_wallet(&Wallet::new(UserId::new(1), "w1", Decimal::ONE))
            .unwrap();
        storage
            .add_wallet(&Wallet::new(UserId::new(2), "w2", Decimal::ZERO))
            .unwrap();

        let rejected = Posting::transfer("w1", "w2", Decimal::from(5), Decimal::ZERO);
        assert!(!storage.post(&rejected).unwrap());
        assert!(storage.all().unwrap().is_empty());

        let fee = Decimal::new(15, 3);
        let accepted = Posting::transfer("w1", "w2", Decimal::ONE, fee);
        assert!(storage.post(&accepted).unwrap());

        assert_eq!(storage.find("w1").unwrap().unwrap().balance_btc, Decimal::ZERO);
        assert_eq!(storage.find("w2").unwrap().unwrap().balance_btc, Decimal::ONE - fee);
        assert_eq!(storage.all().unwrap(), vec![accepted.transaction.clone()]);
        assert_eq!(storage.find_by_address("w2").unwrap(), vec![accepted.transaction]);
    }

    #[test]
    fn test_posting_overflow_writes_nothing() {
        let (storage, _temp) = test_storage();
        storage
            .add_wallet(&Wallet::new(UserId::new(1), "w1", Decimal::ONE))
            .unwrap();
        storage
            .add_wallet(&Wallet::new(UserId::new(2), "full", Decimal::MAX))
            .unwrap();

        let result = storage.post(&Posting::transfer("w1", "full", Decimal::ONE, Decimal::ZERO));
        assert!(matches!(result, Err(Error::InvalidAmount(_))));
        assert!(matches!(
            storage.deposit("full", Decimal::ONE),
            Err(Error::InvalidAmount(_))
        ));

        assert!(storage.all().unwrap().is_empty());
        assert_eq!(storage.find("w1").unwrap().unwrap().balance_btc, Decimal::ONE);
        assert_eq!(storage.find("full").unwrap().unwrap().balance_btc, Decimal::MAX);
    }

    #[test]
    fn test_remove_user_frees_username() {
        let (storage, _temp) = test_storage();
        let alice = storage.add_user("alice", "hash").unwrap().unwrap();
        storage.remove_user(alice.id).unwrap();

        assert!(storage.find_by_username("alice").unwrap().is_none());
        let again = storage.add_user("alice", "hash").unwrap().unwrap();
        assert_eq!(again.id, UserId::new(2));
    }

    #[test]
    fn test_address_index_ignores_longer_addresses() {
        let (storage, _temp) = test_storage();
        storage
            .add_wallet(&Wallet::new(UserId::new(1), "w1", Decimal::ZERO))
            .unwrap();
        storage
            .add_wallet(&Wallet::new(UserId::new(1), "w1|x", Decimal::ZERO))
            .unwrap();

        storage.post(&Posting::deposit("w1", Decimal::ONE, Decimal::ZERO)).unwrap();
        storage.post(&Posting::deposit("w1|x", Decimal::ONE, Decimal::ZERO)).unwrap();

        let history = storage.find_by_address("w1").unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].from_address, DEPOSIT_ADDRESS);
        assert_eq!(history[0].to_address, "w1");
    }

    #[test]
    fn test_reopen_preserves_state() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();

        {
            let storage = Storage::open(&config).unwrap();
            storage.add_user("alice", "hash").unwrap();
            storage
                .add_wallet(&Wallet::new(UserId::new(1), "w1", Decimal::ONE))
                .unwrap();
            storage.post(&Posting::deposit("w1", Decimal::ONE, Decimal::ZERO)).unwrap();
            storage.close().unwrap();
        }

        let storage = Storage::open(&config).unwrap();
        assert_eq!(storage.next_id().unwrap(), UserId::new(2));
        assert_eq!(storage.find("w1").unwrap().unwrap().balance_btc, Decimal::from(2));
        assert_eq!(storage.all().unwrap().len(), 1);

        // Sequence continues after reopen
        storage.append(&Transaction::new("w1", "w9", Decimal::ONE, Decimal::ZERO)).unwrap();
        assert_eq!(storage.find_by_address("w1").unwrap().len(), 2);
    }
}
