//! Background task that refreshes the commit cache on a fixed period.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info};

use super::CommitCache;

/// Handle to the running refresh loop.
pub struct RefreshTask {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl RefreshTask {
    /// Start refreshing `cache` every `refresh_interval`. The first tick fires
    /// one period from now, since construction already refreshed once.
    pub fn spawn(cache: Arc<CommitCache>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run(cache, shutdown_rx));
        Self {
            shutdown_tx,
            handle,
        }
    }

    /// Signal the loop to stop and wait for it. An in-flight refresh is
    /// allowed to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.handle.await {
            error!("Refresh task ended abnormally: {}", e);
        }
    }
}

async fn run(cache: Arc<CommitCache>, mut shutdown_rx: watch::Receiver<bool>) {
    let period = cache.config().refresh_interval;
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(interval_secs = period.as_secs(), "Refresh task started");
    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!("Refresh task shutting down");
                    break;
                }
            }
            _ = ticker.tick() => {
                if let Err(e) = cache.refresh().await {
                    error!("Refresh failed; keeping previous state: {}", e);
                }
            }
        }
    }
}
