//! Actor-based front for the ledger engine
//!
//! A single task owns the engine and processes requests from a bounded
//! mailbox one at a time, so every operation routed through a
//! [`LedgerHandle`] is serialized:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │               LedgerHandle (Clone)                   │
//! │         Sends messages to actor mailbox              │
//! └─────────────────────┬────────────────────────────────┘
//!                       │
//!                       │ mpsc::channel (bounded)
//!                       ▼
//! ┌──────────────────────────────────────────────────────┐
//! │              LedgerActor (Single Task)               │
//! │        WalletLedger -> stores -> oneshot reply       │
//! └──────────────────────────────────────────────────────┘
//! ```

use crate::types::{Registration, Statistics, Transaction, WalletView};
use crate::{Error, Result, WalletLedger};
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

const MAILBOX_CAPACITY: usize = 1000;

/// Message sent to the ledger actor
pub enum LedgerMessage {
    /// Register a user
    Register {
        username: String,
        password: String,
        response: oneshot::Sender<Result<Registration>>,
    },

    /// Open a wallet
    CreateWallet {
        api_key: String,
        response: oneshot::Sender<Result<WalletView>>,
    },

    /// Read one wallet
    GetWallet {
        api_key: String,
        address: String,
        response: oneshot::Sender<Result<WalletView>>,
    },

    /// Read the caller's wallets
    ListWallets {
        api_key: String,
        response: oneshot::Sender<Result<Vec<WalletView>>>,
    },

    /// Read a wallet's transaction history
    GetWalletTransactions {
        api_key: String,
        address: String,
        response: oneshot::Sender<Result<Vec<Transaction>>>,
    },

    /// Deposit fiat
    Deposit {
        api_key: String,
        address: String,
        amount_fiat: Decimal,
        response: oneshot::Sender<Result<WalletView>>,
    },

    /// Withdraw fiat
    Withdraw {
        api_key: String,
        address: String,
        amount_fiat: Decimal,
        response: oneshot::Sender<Result<WalletView>>,
    },

    /// Transfer BTC between wallets
    Transfer {
        api_key: String,
        from_address: String,
        to_address: String,
        amount_btc: Decimal,
        response: oneshot::Sender<Result<Transaction>>,
    },

    /// Platform statistics
    GetStatistics {
        admin_api_key: String,
        response: oneshot::Sender<Result<Statistics>>,
    },

    /// Shutdown actor
    Shutdown,
}

/// Actor that processes ledger messages
pub struct LedgerActor {
    /// Engine
    ledger: Arc<WalletLedger>,

    /// Mailbox for incoming messages
    mailbox: mpsc::Receiver<LedgerMessage>,
}

impl LedgerActor {
    /// Create new actor
    pub fn new(ledger: Arc<WalletLedger>, mailbox: mpsc::Receiver<LedgerMessage>) -> Self {
        Self { ledger, mailbox }
    }

    /// Run the actor event loop until shutdown or until every handle is dropped
    pub async fn run(mut self) {
        while let Some(msg) = self.mailbox.recv().await {
            if let LedgerMessage::Shutdown = msg {
                tracing::info!("Ledger actor shutting down");
                break;
            }
            self.handle_message(msg);
        }
    }

    /// Handle a single message
    fn handle_message(&self, msg: LedgerMessage) {
        let ledger = &self.ledger;

        // A dropped receiver just means the caller gave up waiting
        match msg {
            LedgerMessage::Register { username, password, response } => {
                let _ = response.send(ledger.register(&username, &password));
            }

            LedgerMessage::CreateWallet { api_key, response } => {
                let _ = response.send(ledger.create_wallet(&api_key));
            }

            LedgerMessage::GetWallet { api_key, address, response } => {
                let _ = response.send(ledger.get_wallet(&api_key, &address));
            }

            LedgerMessage::ListWallets { api_key, response } => {
                let _ = response.send(ledger.list_wallets(&api_key));
            }

            LedgerMessage::GetWalletTransactions { api_key, address, response } => {
                let _ = response.send(ledger.get_wallet_transactions(&api_key, &address));
            }

            LedgerMessage::Deposit { api_key, address, amount_fiat, response } => {
                let _ = response.send(ledger.deposit(&api_key, &address, amount_fiat));
            }

            LedgerMessage::Withdraw { api_key, address, amount_fiat, response } => {
                let _ = response.send(ledger.withdraw(&api_key, &address, amount_fiat));
            }

            LedgerMessage::Transfer {
                api_key,
                from_address,
                to_address,
                amount_btc,
                response,
            } => {
                let _ = response.send(ledger.transfer(&api_key, &from_address, &to_address, amount_btc));
            }

            LedgerMessage::GetStatistics { admin_api_key, response } => {
                let _ = response.send(ledger.get_statistics(&admin_api_key));
            }

            LedgerMessage::Shutdown => {
                // Handled in run loop
            }
        }
    }
}

/// Handle for sending messages to the actor
#[derive(Clone)]
pub struct LedgerHandle {
    sender: mpsc::Sender<LedgerMessage>,
}

impl LedgerHandle {
    /// Create new handle
    pub fn new(sender: mpsc::Sender<LedgerMessage>) -> Self {
        Self { sender }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> LedgerMessage,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))?
    }

    /// Register a user
    pub async fn register(&self, username: &str, password: &str) -> Result<Registration> {
        self.request(|response| LedgerMessage::Register {
            username: username.to_string(),
            password: password.to_string(),
            response,
        })
        .await
    }

    /// Open a wallet
    pub async fn create_wallet(&self, api_key: &str) -> Result<WalletView> {
        self.request(|response| LedgerMessage::CreateWallet {
            api_key: api_key.to_string(),
            response,
        })
        .await
    }

    /// Read one wallet
    pub async fn get_wallet(&self, api_key: &str, address: &str) -> Result<WalletView> {
        self.request(|response| LedgerMessage::GetWallet {
            api_key: api_key.to_string(),
            address: address.to_string(),
            response,
        })
        .await
    }

    /// Read the caller's wallets
    pub async fn list_wallets(&self, api_key: &str) -> Result<Vec<WalletView>> {
        self.request(|response| LedgerMessage::ListWallets {
            api_key: api_key.to_string(),
            response,
        })
        .await
    }

    /// Read a wallet's transaction history
    pub async fn get_wallet_transactions(&self, api_key: &str, address: &str) -> Result<Vec<Transaction>> {
        self.request(|response| LedgerMessage::GetWalletTransactions {
            api_key: api_key.to_string(),
            address: address.to_string(),
            response,
        })
        .await
    }

    /// Deposit fiat
    pub async fn deposit(&self, api_key: &str, address: &str, amount_fiat: Decimal) -> Result<WalletView> {
        self.request(|response| LedgerMessage::Deposit {
            api_key: api_key.to_string(),
            address: address.to_string(),
            amount_fiat,
            response,
        })
        .await
    }

    /// Withdraw fiat
    pub async fn withdraw(&self, api_key: &str, address: &str, amount_fiat: Decimal) -> Result<WalletView> {
        self.request(|response| LedgerMessage::Withdraw {
            api_key: api_key.to_string(),
            address: address.to_string(),
            amount_fiat,
            response,
        })
        .await
    }

    /// Transfer BTC between wallets
    pub async fn transfer(
        &self,
        api_key: &str,
        from_address: &str,
        to_address: &str,
        amount_btc: Decimal,
    ) -> Result<Transaction> {
        self.request(|response| LedgerMessage::Transfer {
            api_key: api_key.to_string(),
            from_address: from_address.to_string(),
            to_address: to_address.to_string(),
            amount_btc,
            response,
        })
        .await
    }

    /// Platform statistics
    pub async fn get_statistics(&self, admin_api_key: &str) -> Result<Statistics> {
        self.request(|response| LedgerMessage::GetStatistics {
            admin_api_key: admin_api_key.to_string(),
            response,
        })
        .await
    }

    /// Shutdown actor
    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(LedgerMessage::Shutdown)
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;
        Ok(())
    }
}

/// Spawn the ledger actor
pub fn spawn_ledger_actor(ledger: Arc<WalletLedger>) -> LedgerHandle {
    let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY); // Bounded channel for backpressure
    let actor = LedgerActor::new(ledger, rx);

    tokio::spawn(async move {
        actor.run().await;
    });

    LedgerHandle::new(tx)
}
