//! Cached election-window map.
//!
//! The ingestion window check runs on every election submission; hitting
//! the tally store each time would put a read on the hot path. The cache
//! holds the window map in memory, refreshed periodically and populated on
//! miss.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::store::{StoreError, TallyStore};

#[derive(Clone)]
pub struct WindowCache {
    map: Arc<RwLock<HashMap<i64, (DateTime<Utc>, DateTime<Utc>)>>>,
    tally: TallyStore,
}

impl std::fmt::Debug for WindowCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowCache").finish()
    }
}

impl WindowCache {
    pub fn new(tally: TallyStore) -> Self {
        Self {
            map: Arc::new(RwLock::new(HashMap::new())),
            tally,
        }
    }

    /// Reload the whole map from the election registry.
    pub async fn refresh(&self) -> Result<(), StoreError> {
        let elections = self.tally.elections().await?;
        let mut fresh = HashMap::with_capacity(elections.len());
        for election in elections {
            fresh.insert(election.id, (election.start_at, election.end_at));
        }
        *self.map.write().await = fresh;
        debug!("election window cache refreshed");
        Ok(())
    }

    /// Voting window for one election: cache hit, or store lookup that
    /// populates the cache. `None` means the election is not registered.
    pub async fn window(
        &self,
        election_id: i64,
    ) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>, StoreError> {
        if let Some(window) = self.map.read().await.get(&election_id) {
            return Ok(Some(*window));
        }
        match self.tally.election_window(election_id).await? {
            Some(window) => {
                self.map.write().await.insert(election_id, window);
                Ok(Some(window))
            }
            None => Ok(None),
        }
    }

    /// Periodic refresh task; lives until shutdown.
    pub fn spawn_refresher(
        self,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.changed() => {}
                }
                if *shutdown.borrow() {
                    break;
                }
                if let Err(e) = self.refresh().await {
                    warn!(error = %e, "window cache refresh failed");
                }
            }
        })
    }
}
