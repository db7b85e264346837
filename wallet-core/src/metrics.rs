//! Metrics collection for observability
//!
//! This module provides Prometheus metrics for monitoring the wallet ledger.
//!
//! # Metrics
//!
//! - `wallet_registrations_total` - Users registered
//! - `wallet_wallets_created_total` - Wallets opened
//! - `wallet_postings_total{kind}` - Deposits, withdrawals and transfers recorded
//! - `wallet_rejections_total{reason}` - Operations refused with a domain error

use crate::types::TransactionKind;
use prometheus::{IntCounter, IntCounterVec, Opts, Registry};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Users registered
    pub registrations_total: IntCounter,

    /// Wallets created
    pub wallets_created_total: IntCounter,

    /// Postings by kind
    pub postings_total: IntCounterVec,

    /// Rejections by reason
    pub rejections_total: IntCounterVec,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector with its own registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let registrations_total =
            IntCounter::new("wallet_registrations_total", "Total number of registered users")?;
        registry.register(Box::new(registrations_total.clone()))?;

        let wallets_created_total =
            IntCounter::new("wallet_wallets_created_total", "Total number of wallets created")?;
        registry.register(Box::new(wallets_created_total.clone()))?;

        let postings_total = IntCounterVec::new(
            Opts::new("wallet_postings_total", "Recorded transactions by kind"),
            &["kind"],
        )?;
        registry.register(Box::new(postings_total.clone()))?;

        let rejections_total = IntCounterVec::new(
            Opts::new("wallet_rejections_total", "Refused operations by reason"),
            &["reason"],
        )?;
        registry.register(Box::new(rejections_total.clone()))?;

        Ok(Self {
            registrations_total,
            wallets_created_total,
            postings_total,
            rejections_total,
            registry,
        })
    }

    /// Record a registration
    pub fn record_registration(&self) {
        self.registrations_total.inc();
    }

    /// Record a wallet creation
    pub fn record_wallet_created(&self) {
        self.wallets_created_total.inc();
    }

    /// Record a completed posting
    pub fn record_posting(&self, kind: TransactionKind) {
        self.postings_total.with_label_values(&[kind.as_str()]).inc();
    }

    /// Record a refused operation
    pub fn record_rejection(&self, reason: &str) {
        self.rejections_total.with_label_values(&[reason]).inc();
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
