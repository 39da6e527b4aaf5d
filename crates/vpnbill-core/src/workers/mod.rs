//! Periodic background tasks
//!
//! Each worker ticks on its own interval and stops when the shared shutdown
//! channel flips to `true`. A failing tick is logged and retried on the next
//! one.

mod confirmation;
mod expiry;
mod health;

pub use confirmation::{ConfirmationSummary, ConfirmationWorker};
pub use expiry::{ExpirySummary, ExpiryWorker};
pub use health::{tcp_ping, HealthSummary, HealthWorker};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

use crate::error::CoreResult;

/// Sender flips to `true` to stop every worker holding a receiver
pub fn shutdown_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

#[async_trait]
pub trait Worker: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn interval(&self) -> Duration;

    async fn tick(&self) -> CoreResult<()>;
}

/// Run `worker` until shutdown
pub fn spawn<W: Worker>(worker: Arc<W>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("{} worker started (every {:?})", worker.name(), worker.interval());

        let mut ticker = interval(worker.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = worker.tick().await {
                        warn!("{} worker tick failed: {}", worker.name(), e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("{} worker stopped", worker.name());
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(AtomicUsize);

    #[async_trait]
    impl Worker for Counter {
        fn name(&self) -> &'static str {
            "counter"
        }

        fn interval(&self) -> Duration {
            Duration::from_millis(5)
        }

        async fn tick(&self) -> CoreResult<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_worker_stops_on_shutdown() {
        let (tx, rx) = shutdown_channel();
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let handle = spawn(counter.clone(), rx);

        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        let ticks = counter.0.load(Ordering::SeqCst);
        assert!(ticks >= 1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(counter.0.load(Ordering::SeqCst), ticks);
    }
}
