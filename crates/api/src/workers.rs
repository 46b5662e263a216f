//! Wires the fulfillment components together and starts the background tasks.

use std::sync::Arc;

use domain::{InMemoryCatalog, OrderLedger};
use event_channel::{EventChannel, ReliablePublisher};
use saga::{
    CompensationListener, InMemoryPaymentHistory, OrderLifecycleEngine,
    StockReservationCoordinator, SweepScheduler, spawn_periodic,
};
use stock::{InMemoryStockLedger, InventoryTable, Reconciler, ReconcilerConfig};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::status::StatusBoard;

/// Storage the service runs on.
pub struct Backends<O, I, C> {
    pub orders: O,
    pub inventory: I,
    pub channel: C,
}

/// Handles of the running background tasks.
pub struct Workers {
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl Workers {
    /// Starts every background task. They stop once `shutdown` turns true.
    pub fn start<O, I, C>(
        backends: Backends<O, I, C>,
        config: &Config,
        status: Arc<StatusBoard>,
        shutdown: watch::Receiver<bool>,
    ) -> Self
    where
        O: OrderLedger + 'static,
        I: InventoryTable + Clone + 'static,
        C: EventChannel + Clone + 'static,
    {
        let Backends {
            orders,
            inventory,
            channel,
        } = backends;

        let ledger = InMemoryStockLedger::in_memory(inventory.clone(), config.lock.clone());
        let publisher = ReliablePublisher::with_config(channel.clone(), config.publisher.clone());
        let coordinator = StockReservationCoordinator::new(ledger.clone(), publisher.clone());
        let engine = Arc::new(OrderLifecycleEngine::new(
            orders,
            coordinator,
            InMemoryCatalog::new(),
        ));

        let listener = Arc::new(CompensationListener::with_config(
            channel,
            inventory.clone(),
            InMemoryPaymentHistory::new(),
            config.listener.clone(),
        ));
        let reconciler = Arc::new(Reconciler::with_config(
            ledger,
            inventory,
            ReconcilerConfig::default(),
        ));

        let mut handles = Vec::new();

        handles.push((
            "lifecycle-sweep",
            SweepScheduler::spawn(engine, config.sweep_interval, shutdown.clone()),
        ));

        let reconcile_listener = Arc::clone(&listener);

        handles.push(("compensation-listener", {
            let listener = Arc::clone(&listener);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { listener.run(shutdown).await })
        }));

        handles.push((
            "listener-status",
            spawn_periodic(
                "listener-status",
                config.listener.poll_interval,
                shutdown.clone(),
                {
                    let status = Arc::clone(&status);
                    move || {
                        let listener = Arc::clone(&listener);
                        let status = Arc::clone(&status);
                        async move {
                            status.set_stuck_messages(listener.stuck_messages().await.len());
                        }
                    }
                },
            ),
        ));

        handles.push((
            "outbox-flush",
            spawn_periodic(
                "outbox-flush",
                config.outbox_flush_interval,
                shutdown.clone(),
                {
                    let publisher = publisher.clone();
                    let status = Arc::clone(&status);
                    move || {
                        let publisher = publisher.clone();
                        let status = Arc::clone(&status);
                        async move {
                            if publisher.pending().await > 0
                                && let Err(e) = publisher.flush_outbox().await
                            {
                                tracing::warn!(error = %e, "outbox flush failed");
                            }
                            status.set_outbox_pending(publisher.pending().await);
                        }
                    }
                },
            ),
        ));

        handles.push((
            "reconciliation",
            spawn_periodic(
                "reconciliation",
                config.reconcile_interval,
                shutdown,
                move || {
                    let reconciler = Arc::clone(&reconciler);
                    let listener = Arc::clone(&reconcile_listener);
                    let publisher = publisher.clone();
                    let status = Arc::clone(&status);
                    async move {
                        let unapplied = match listener.pending_stock_events().await {
                            Ok(count) => count,
                            Err(e) => {
                                tracing::warn!(error = %e, "listener backlog unknown, skipping reconciliation");
                                return;
                            }
                        };
                        let in_flight = publisher.pending().await + unapplied;
                        match reconciler.run_once(in_flight).await {
                            Ok(report) => status.set_drifted_products(
                                report.drifted.len().saturating_sub(report.corrected.len()),
                            ),
                            Err(e) => tracing::warn!(error = %e, "reconciliation failed"),
                        }
                    }
                },
            ),
        ));

        Self { handles }
    }

    /// Waits for every task to finish.
    pub async fn join(self) {
        for (name, handle) in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(task = name, error = %e, "background task panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::InMemoryOrderLedger;
    use event_channel::InMemoryEventChannel;
    use stock::InMemoryInventoryTable;

    #[tokio::test]
    async fn test_workers_stop_on_shutdown() {
        let (tx, rx) = watch::channel(false);
        let workers = Workers::start(
            Backends {
                orders: InMemoryOrderLedger::new(),
                inventory: InMemoryInventoryTable::new(),
                channel: InMemoryEventChannel::new(),
            },
            &Config::default(),
            Arc::new(StatusBoard::default()),
            rx,
        );

        tx.send(true).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), workers.join())
            .await
            .unwrap();
    }
}
