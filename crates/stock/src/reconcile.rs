//! Detects and corrects drift between ledger counters and the inventory table.
//!
//! Some drift is normal: a reservation lowers the counter right away while
//! the matching `STOCK_REDUCED` reaches the inventory table later. Drift that
//! stays identical across consecutive sweeps, while no stock event is queued
//! for publishing or waiting to be applied, is treated as leaked and the
//! counter is reset to the authoritative value.

use std::collections::HashMap;

use common::ProductId;
use tokio::sync::Mutex;

use crate::{InventoryTable, Result, StockLedger};

/// Reconciliation settings.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Quiet sweeps that must observe the same drift before it is corrected.
    pub confirmations: u32,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self { confirmations: 2 }
    }
}

/// A counter that disagrees with the inventory table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Drift {
    pub product_id: ProductId,
    pub ledger: i64,
    pub authoritative: i64,
}

impl Drift {
    /// Authoritative minus ledger; positive means the ledger shows too little.
    pub fn amount(&self) -> i64 {
        self.authoritative - self.ledger
    }
}

/// Outcome of one reconciliation sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub checked: usize,
    pub drifted: Vec<Drift>,
    pub corrected: Vec<ProductId>,
}

/// Compares ledger counters with the inventory table on each sweep.
pub struct Reconciler<S: StockLedger, I: InventoryTable> {
    ledger: S,
    inventory: I,
    config: ReconcilerConfig,
    /// product -> (drift amount, consecutive sightings)
    observed: Mutex<HashMap<ProductId, (i64, u32)>>,
}

impl<S: StockLedger, I: InventoryTable> Reconciler<S, I> {
    pub fn new(ledger: S, inventory: I) -> Self {
        Self::with_config(ledger, inventory, ReconcilerConfig::default())
    }

    pub fn with_config(ledger: S, inventory: I, config: ReconcilerConfig) -> Self {
        Self {
            ledger,
            inventory,
            config,
            observed: Mutex::new(HashMap::new()),
        }
    }

    /// Runs one sweep.
    ///
    /// `in_flight` counts stock events not yet reflected in the inventory
    /// table: queued in the outbox, or published but not applied by the
    /// listener. A sweep with anything in flight reports drift but neither
    /// corrects it nor counts it towards `confirmations`.
    #[tracing::instrument(skip(self))]
    pub async fn run_once(&self, in_flight: usize) -> Result<ReconcileReport> {
        let counters = self.ledger.snapshot().await?;
        let authoritative = self.inventory.all_quantities().await?;

        let mut report = ReconcileReport {
            checked: counters.len(),
            ..Default::default()
        };
        let mut observed = self.observed.lock().await;
        let mut still_drifting = HashMap::new();

        for (product_id, ledger) in counters {
            let Some(&truth) = authoritative.get(&product_id) else {
                tracing::warn!(%product_id, "stock counter has no inventory row");
                continue;
            };
            if ledger == truth {
                continue;
            }

            let drift = Drift {
                product_id: product_id.clone(),
                ledger,
                authoritative: truth,
            };
            metrics::counter!("inventory_drift_detected_total").increment(1);

            let sightings = match observed.get(&product_id) {
                _ if in_flight > 0 => 0,
                Some(&(amount, seen)) if amount == drift.amount() => seen + 1,
                _ => 1,
            };

            if in_flight == 0 && sightings >= self.config.confirmations {
                if self
                    .ledger
                    .compare_and_reset(&product_id, ledger, truth)
                    .await?
                {
                    tracing::warn!(
                        %product_id,
                        ledger,
                        authoritative = truth,
                        "stock counter reset to inventory quantity"
                    );
                    metrics::counter!("inventory_drift_corrected_total").increment(1);
                    report.corrected.push(product_id);
                }
            } else {
                tracing::info!(
                    %product_id,
                    ledger,
                    authoritative = truth,
                    sightings,
                    "stock drift observed"
                );
                still_drifting.insert(product_id, (drift.amount(), sightings));
            }
            report.drifted.push(drift);
        }

        *observed = still_drifting;
        Ok(report)
    }
}
