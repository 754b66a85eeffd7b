//! Relay from the `expiry_outbox` table to the delayed queue.
//!
//! Rows are leased rather than locked for the whole publish, so several
//! relays can run side by side; a row whose relay died becomes claimable
//! again when its lease runs out. Publishing is at-least-once, which the
//! expiry worker tolerates.

use chrono::Utc;
use std::sync::Arc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::error::{Error, Result};
use crate::queue::DelayedQueue;
use crate::store::Storage;

pub struct OutboxRelay {
    store: Arc<dyn Storage>,
    queue: Arc<dyn DelayedQueue>,
    config: RelayConfig,
}

impl OutboxRelay {
    pub fn new(store: Arc<dyn Storage>, queue: Arc<dyn DelayedQueue>, config: RelayConfig) -> Self {
        Self { store, queue, config }
    }

    /// Publishes one batch of pending notices and returns how many went out.
    pub async fn relay_once(&self) -> Result<usize> {
        let entries = self
            .store
            .claim_unpublished(self.config.batch_size, self.config.lease())
            .await?;

        let mut published = 0;
        for entry in entries {
            // Оставшаяся задержка, а не полный TTL: запись могла пролежать в outbox
            let delay = entry.remaining_delay(Utc::now());
            if let Err(e) = self.queue.publish(&entry.payload, delay).await {
                // Остальные записи пачки вернутся, когда истечёт аренда
                warn!(
                    outbox_id = %entry.id,
                    booking_id = %entry.booking_id,
                    attempts = entry.attempts,
                    error = %e,
                    "Failed to publish expiry notice"
                );
                break;
            }
            self.store.mark_published(entry.id).await?;
            published += 1;
        }
        Ok(published)
    }

    /// Deletes rows published longer ago than the retention window.
    pub async fn purge_once(&self) -> Result<u64> {
        let retention = chrono::Duration::from_std(self.config.retention())
            .map_err(|_| Error::Validation("relay retention is out of range".to_string()))?;
        let purged = self.store.purge_published(Utc::now() - retention).await?;
        if purged > 0 {
            info!(purged, "Purged published outbox entries");
        }
        Ok(purged)
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let purge_every = self.config.retention() / 24;
        let mut last_purge = Instant::now();

        info!(interval_ms = self.config.interval_ms, "Outbox relay started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            // Полная пачка: скорее всего, есть ещё
            loop {
                match self.relay_once().await {
                    Ok(n) if n as i64 >= self.config.batch_size && !shutdown.is_cancelled() => {
                        debug!(published = n, "Outbox batch relayed");
                    }
                    Ok(0) => break,
                    Ok(n) => {
                        debug!(published = n, "Outbox batch relayed");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "Outbox relay pass failed");
                        break;
                    }
                }
            }

            if last_purge.elapsed() >= purge_every {
                if let Err(e) = self.purge_once().await {
                    warn!(error = %e, "Outbox purge failed");
                }
                last_purge = Instant::now();
            }
        }

        info!("Outbox relay stopped");
    }
}
