//! Periodic background jobs.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use domain::{Catalog, OrderLedger};
use event_channel::EventChannel;
use stock::StockLedger;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::lifecycle::OrderLifecycleEngine;

/// Runs `job` every `period` until `shutdown` turns true.
///
/// The first run happens one full period after spawning. Ticks missed while
/// a run is slow are skipped rather than bunched up.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut job: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(job = name, period_ms = period.as_millis() as u64, "background job started");

        while !*shutdown.borrow() {
            tokio::select! {
                _ = ticker.tick() => job().await,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::info!(job = name, "background job stopped");
    })
}

/// Drives [`OrderLifecycleEngine::run_sweep`] on a fixed period.
pub struct SweepScheduler;

impl SweepScheduler {
    /// Starts the sweep loop. A failed sweep is logged and retried on the
    /// next period.
    pub fn spawn<O, S, C, K>(
        engine: Arc<OrderLifecycleEngine<O, S, C, K>>,
        period: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()>
    where
        O: OrderLedger + 'static,
        S: StockLedger + 'static,
        C: EventChannel + 'static,
        K: Catalog + 'static,
    {
        spawn_periodic("lifecycle-sweep", period, shutdown, move || {
            let engine = Arc::clone(&engine);
            async move {
                if let Err(e) = engine.run_sweep().await {
                    tracing::warn!(error = %e, "lifecycle sweep failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_runs_each_period_until_shutdown() {
        let runs = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = watch::channel(false);

        let counter = Arc::clone(&runs);
        let handle = spawn_periodic("test", Duration::from_secs(10), rx, move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        tx.send(true).unwrap();
        handle.await.unwrap();

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }
}
