//! Trade list persistence
//!
//! Protocol steps call [`PersistenceManager::request_persistence`] and move on.
//! Requests are coalesced: a background loop waits for a quiet period, takes a
//! snapshot and writes it through the configured [`TradeStore`].

pub mod store;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info};

use crate::error::PersistenceResult;
use crate::models::Trade;
use crate::services::trade_manager::TradeListStatus;

pub use store::{JsonFileStore, MemoryStore};

/// One entry of the stored trade list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub status: TradeListStatus,
    pub trade: Trade,
}

#[async_trait]
pub trait TradeStore: Send + Sync {
    async fn save(&self, records: &[TradeRecord]) -> PersistenceResult<()>;

    async fn load(&self) -> PersistenceResult<Vec<TradeRecord>>;
}

/// Produces the current trade list when a write is due
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn snapshot(&self) -> Vec<TradeRecord>;
}

pub struct PersistenceManager {
    store: Arc<dyn TradeStore>,
    debounce: Duration,
    notify: Notify,
    requests: AtomicU64,
    started: AtomicBool,
    source: Mutex<Option<Weak<dyn SnapshotSource>>>,
}

impl PersistenceManager {
    pub fn new(store: Arc<dyn TradeStore>, debounce: Duration) -> Arc<Self> {
        Arc::new(Self {
            store,
            debounce,
            notify: Notify::new(),
            requests: AtomicU64::new(0),
            started: AtomicBool::new(false),
            source: Mutex::new(None),
        })
    }

    pub fn store(&self) -> &Arc<dyn TradeStore> {
        &self.store
    }

    /// Ask for the trade list to be written soon. Never blocks.
    pub fn request_persistence(&self) {
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_one();
    }

    /// Start the write loop. The loop ends at the first write after `source` is dropped.
    pub async fn start(self: &Arc<Self>, source: Weak<dyn SnapshotSource>) {
        *self.source.lock().await = Some(source);
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                // notify_one keeps a permit, so requests made during a write are not lost
                this.notify.notified().await;
                if this.requests.load(Ordering::SeqCst) == 0 {
                    continue;
                }

                // Wait until no new request arrives for one debounce period
                let mut seen = this.requests.load(Ordering::SeqCst);
                loop {
                    tokio::time::sleep(this.debounce).await;
                    let now = this.requests.load(Ordering::SeqCst);
                    if now == seen {
                        break;
                    }
                    seen = now;
                }

                match this.flush().await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => error!(error = %e, "Failed to persist trade list"),
                }
            }
            debug!("Persistence loop stopped");
        });
        info!(debounce_ms = self.debounce.as_millis() as u64, "Persistence manager started");
    }

    /// Write the current snapshot now. Returns false if the source is gone.
    pub async fn flush(&self) -> PersistenceResult<bool> {
        let source = self.source.lock().await.as_ref().and_then(Weak::upgrade);
        let Some(source) = source else {
            return Ok(false);
        };
        self.requests.store(0, Ordering::SeqCst);
        let records = source.snapshot().await;
        self.store.save(&records).await?;
        debug!(trades = records.len(), "Trade list persisted");
        Ok(true)
    }

    pub async fn load(&self) -> PersistenceResult<Vec<TradeRecord>> {
        self.store.load().await
    }
}
