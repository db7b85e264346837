//! Configuration for the wallet ledger

use crate::types::MAX_SUPPLY_BTC;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// Maximum number of wallets a single user may own
    pub max_wallets_per_user: usize,

    /// Balance credited to every new wallet (BTC)
    pub starting_balance_btc: Decimal,

    /// Static credential for the statistics endpoint
    pub admin_api_key: String,

    /// Fiat units per BTC used by the fixed-rate provider
    pub exchange_rate: Decimal,

    /// Reference fiat currency code
    pub fiat_currency: String,

    /// Prefix prepended to generated wallet addresses
    pub wallet_address_prefix: String,

    /// Fee rates
    pub fees: FeeSchedule,

    /// API key issuance
    pub api_keys: ApiKeyConfig,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/wallet"),
            service_name: "wallet-core".to_string(),
            max_wallets_per_user: 3,
            starting_balance_btc: Decimal::ONE,
            admin_api_key: "admin_api_key".to_string(),
            exchange_rate: Decimal::new(2_000_011, 2), // 20000.11
            fiat_currency: "USD".to_string(),
            wallet_address_prefix: String::new(),
            fees: FeeSchedule::default(),
            api_keys: ApiKeyConfig::default(),
            rocksdb: RocksDBConfig::default(),
        }
    }
}

/// Fee rates per transaction kind, each a fraction in [0, 1]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeeSchedule {
    /// Transfer between wallets of different owners
    pub different_owners: Decimal,

    /// Transfer between two wallets of the same owner
    pub same_owner: Decimal,

    /// Deposit from outside the platform
    pub deposit: Decimal,

    /// Withdrawal to outside the platform
    pub withdraw: Decimal,
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            different_owners: Decimal::new(15, 3), // 1.5%
            same_owner: Decimal::ZERO,
            deposit: Decimal::ZERO,
            withdraw: Decimal::ZERO,
        }
    }
}

/// How API keys are produced at registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiKeyScheme {
    /// Fresh random value from the unique value generator
    Random,
    /// Prefix plus hash of (username, password)
    Derived,
}

/// API key configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiKeyConfig {
    /// Issuance scheme
    pub scheme: ApiKeyScheme,

    /// Fixed tag prepended to every key
    pub prefix: String,
}

impl Default for ApiKeyConfig {
    fn default() -> Self {
        Self {
            scheme: ApiKeyScheme::Random,
            prefix: "api_key_".to_string(),
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Enable statistics
    pub enable_statistics: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 3,
            max_background_jobs: 2,
            enable_statistics: false,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(data_dir) = std::env::var("WALLET_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(key) = std::env::var("WALLET_ADMIN_API_KEY") {
            config.admin_api_key = key;
        }

        if let Ok(rate) = std::env::var("WALLET_EXCHANGE_RATE") {
            config.exchange_rate = Decimal::from_str(&rate).map_err(|e| {
                crate::Error::Config(format!("WALLET_EXCHANGE_RATE is not a decimal: {}", e))
            })?;
        }

        if let Ok(max) = std::env::var("WALLET_MAX_WALLETS") {
            config.max_wallets_per_user = max.parse().map_err(|e| {
                crate::Error::Config(format!("WALLET_MAX_WALLETS is not an integer: {}", e))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    pub fn validate(&self) -> crate::Result<()> {
        if self.max_wallets_per_user == 0 {
            return Err(crate::Error::Config(
                "max_wallets_per_user must be at least 1".to_string(),
            ));
        }

        if self.starting_balance_btc < Decimal::ZERO {
            return Err(crate::Error::Config(
                "starting_balance_btc must not be negative".to_string(),
            ));
        }

        if self.exchange_rate <= Decimal::ZERO {
            return Err(crate::Error::Config(
                "exchange_rate must be positive".to_string(),
            ));
        }

        if self.starting_balance_btc > MAX_SUPPLY_BTC {
            return Err(crate::Error::Config(format!(
                "starting_balance_btc must not exceed {}",
                MAX_SUPPLY_BTC
            )));
        }

        // Every reachable balance must have a fiat value
        if MAX_SUPPLY_BTC.checked_mul(self.exchange_rate).is_none() {
            return Err(crate::Error::Config(format!(
                "exchange_rate {} overflows fiat values",
                self.exchange_rate
            )));
        }

        let rates = [
            ("different_owners", self.fees.different_owners),
            ("same_owner", self.fees.same_owner),
            ("deposit", self.fees.deposit),
            ("withdraw", self.fees.withdraw),
        ];
        for (name, rate) in rates {
            if rate < Decimal::ZERO || rate > Decimal::ONE {
                return Err(crate::Error::Config(format!(
                    "fee rate {} = {} is outside [0, 1]",
                    name, rate
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.service_name, "wallet-core");
        assert_eq!(config.max_wallets_per_user, 3);
        assert_eq!(config.starting_balance_btc, Decimal::ONE);
        assert_eq!(config.fees.different_owners, Decimal::new(15, 3));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_fee_rate_out_of_range() {
        let mut config = Config::default();
        config.fees.withdraw = Decimal::new(15, 1); // 1.5
        assert!(matches!(config.validate(), Err(crate::Error::Config(_))));
    }

    #[test]
    fn test_non_positive_rate_rejected() {
        let mut config = Config::default();
        config.exchange_rate = Decimal::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rate_without_fiat_headroom_rejected() {
        let mut config = Config::default();
        config.exchange_rate = Decimal::MAX;
        assert!(matches!(config.validate(), Err(crate::Error::Config(_))));

        let mut config = Config::default();
        config.starting_balance_btc = MAX_SUPPLY_BTC + Decimal::ONE;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            max_wallets_per_user = 5
            admin_api_key = "secret"

            [fees]
            deposit = "0.01"

            [api_keys]
            scheme = "derived"
            "#,
        )
        .unwrap();

        assert_eq!(config.max_wallets_per_user, 5);
        assert_eq!(config.admin_api_key, "secret");
        assert_eq!(config.fees.deposit, Decimal::new(1, 2));
        assert_eq!(config.fees.different_owners, Decimal::new(15, 3));
        assert_eq!(config.api_keys.scheme, ApiKeyScheme::Derived);
        assert_eq!(config.api_keys.prefix, "api_key_");
    }
}
