//! In-memory credential store.
//!
//! The authoritative pipeline state lives in the audit and tally tables;
//! this store is reconstructible, so process memory is an acceptable home:
//! V is loaded from the generator's fingerprint file before voting opens,
//! and C is rebuilt by replaying accepted audit rows at startup.

use std::collections::{HashMap, HashSet};
use std::io::BufRead;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::info;

use crate::domain::Fingerprint;

use super::{ClaimOutcome, CredentialError, CredentialStore};

#[derive(Default)]
struct State {
    valid: HashSet<Fingerprint>,
    cast: HashSet<Fingerprint>,
    duplicates: HashMap<Fingerprint, CounterEntry>,
}

struct CounterEntry {
    count: u64,
    touched: Instant,
}

/// Credential store backed by process memory.
pub struct MemoryCredentialStore {
    state: RwLock<State>,
    /// Optional expiry for duplicate counters. `None` retains counters for
    /// the whole voting window.
    counter_ttl: Option<Duration>,
}

impl MemoryCredentialStore {
    pub fn new(counter_ttl: Option<Duration>) -> Self {
        Self {
            state: RwLock::new(State::default()),
            counter_ttl,
        }
    }

    /// Load the valid set V from the credential generator's output: one
    /// fingerprint per line, blank lines and `#` comments ignored. Returns
    /// the number of fingerprints loaded.
    pub async fn load_valid(&self, reader: impl BufRead) -> std::io::Result<u64> {
        let mut loaded = 0u64;
        let mut skipped = 0u64;
        let mut state = self.state.write().await;
        for line in reader.lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match Fingerprint::parse(line) {
                Ok(fingerprint) => {
                    state.valid.insert(fingerprint);
                    loaded += 1;
                }
                Err(_) => skipped += 1,
            }
        }
        drop(state);
        info!(loaded, skipped, "loaded valid credential set");
        Ok(loaded)
    }

    /// Insert a single fingerprint into V. Setup/test convenience.
    pub async fn insert_valid(&self, fingerprint: Fingerprint) {
        self.state.write().await.valid.insert(fingerprint);
    }

    /// Rebuild the cast set C from previously accepted fingerprints
    /// (audit-table replay on startup).
    pub async fn restore_cast(&self, fingerprints: impl IntoIterator<Item = Fingerprint>) -> u64 {
        let mut state = self.state.write().await;
        let before = state.cast.len();
        state.cast.extend(fingerprints);
        let restored = (state.cast.len() - before) as u64;
        drop(state);
        info!(restored, "restored cast credential set from audit replay");
        restored
    }

    fn counter_expired(&self, entry: &CounterEntry) -> bool {
        match self.counter_ttl {
            Some(ttl) => entry.touched.elapsed() >= ttl,
            None => false,
        }
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn is_valid(&self, fingerprint: &Fingerprint) -> Result<bool, CredentialError> {
        Ok(self.state.read().await.valid.contains(fingerprint))
    }

    async fn claim(&self, fingerprint: &Fingerprint) -> Result<ClaimOutcome, CredentialError> {
        // One write-lock section is the linearization point: of any number
        // of concurrent claimers exactly one observes the insert.
        let mut state = self.state.write().await;
        if state.cast.insert(fingerprint.clone()) {
            Ok(ClaimOutcome::New)
        } else {
            Ok(ClaimOutcome::Duplicate)
        }
    }

    async fn is_cast(&self, fingerprint: &Fingerprint) -> Result<bool, CredentialError> {
        Ok(self.state.read().await.cast.contains(fingerprint))
    }

    async fn record_duplicate(&self, fingerprint: &Fingerprint) -> Result<u64, CredentialError> {
        let mut state = self.state.write().await;
        let expired = state
            .duplicates
            .get(fingerprint)
            .is_some_and(|entry| self.counter_expired(entry));
        if expired {
            state.duplicates.remove(fingerprint);
        }
        let entry = state
            .duplicates
            .entry(fingerprint.clone())
            .or_insert(CounterEntry {
                count: 0,
                touched: Instant::now(),
            });
        entry.count += 1;
        entry.touched = Instant::now();
        Ok(entry.count)
    }

    async fn duplicate_count(&self, fingerprint: &Fingerprint) -> Result<u64, CredentialError> {
        let state = self.state.read().await;
        Ok(state
            .duplicates
            .get(fingerprint)
            .filter(|entry| !self.counter_expired(entry))
            .map(|entry| entry.count)
            .unwrap_or(0))
    }

    async fn ping(&self) -> Result<(), CredentialError> {
        Ok(())
    }
}
