//! Payment history kept in step with order events.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{MemberId, OrderId};
use domain::Money;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

/// Kind of payment record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaymentKind {
    /// The order total was taken when the order was created.
    Settled,
    /// The order total was given back after a cancellation or return.
    Refunded,
}

impl PaymentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentKind::Settled => "settled",
            PaymentKind::Refunded => "refunded",
        }
    }
}

/// One entry in an order's payment history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentEntry {
    pub order_id: OrderId,
    pub owner_id: MemberId,
    pub kind: PaymentKind,
    pub amount: Money,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("Payment history unavailable: {0}")]
    Unavailable(String),
}

/// Stores payment entries, at most one per order and kind.
#[async_trait]
pub trait PaymentHistory: Send + Sync {
    /// Records an entry. Returns false if the order already has one of this kind.
    async fn record(&self, entry: PaymentEntry) -> Result<bool, PaymentError>;

    /// Returns an order's entries in the order they were recorded.
    async fn entries_for(&self, order_id: OrderId) -> Result<Vec<PaymentEntry>, PaymentError>;
}

/// In-memory payment history for tests and single-node deployments.
#[derive(Clone, Default)]
pub struct InMemoryPaymentHistory {
    entries: Arc<RwLock<HashMap<OrderId, Vec<PaymentEntry>>>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryPaymentHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), PaymentError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(PaymentError::Unavailable(
                "payment history offline".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl PaymentHistory for InMemoryPaymentHistory {
    async fn record(&self, entry: PaymentEntry) -> Result<bool, PaymentError> {
        self.check_available()?;
        let mut entries = self.entries.write().await;
        let history = entries.entry(entry.order_id).or_default();

        if history.iter().any(|existing| existing.kind == entry.kind) {
            return Ok(false);
        }
        history.push(entry);
        Ok(true)
    }

    async fn entries_for(&self, order_id: OrderId) -> Result<Vec<PaymentEntry>, PaymentError> {
        self.check_available()?;
        Ok(self
            .entries
            .read()
            .await
            .get(&order_id)
            .cloned()
            .unwrap_or_default())
    }
}
