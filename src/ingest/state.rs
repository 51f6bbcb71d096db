//! Application state shared across all HTTP handlers.

use std::sync::Arc;
use std::time::Duration;

use crate::bus::MessageBus;
use crate::config::{BrokerConfig, HttpConfig};
use crate::store::TallyStore;

use super::windows::WindowCache;

/// Shared state passed to all axum handlers. Cloning is cheap; everything
/// heavy sits behind the inner `Arc`.
#[derive(Debug, Clone)]
pub struct AppState {
    inner: Arc<StateInner>,
}

#[derive(Debug)]
struct StateInner {
    bus: MessageBus,
    tally: TallyStore,
    windows: WindowCache,
    publish_confirm_timeout: Duration,
    request_deadline: Duration,
}

impl AppState {
    pub fn new(bus: MessageBus, tally: TallyStore, http: &HttpConfig, broker: &BrokerConfig) -> Self {
        let windows = WindowCache::new(tally.clone());
        AppState {
            inner: Arc::new(StateInner {
                bus,
                tally,
                windows,
                publish_confirm_timeout: broker.publish_confirm_timeout,
                request_deadline: http.request_deadline,
            }),
        }
    }

    pub fn bus(&self) -> &MessageBus {
        &self.inner.bus
    }

    pub fn tally(&self) -> &TallyStore {
        &self.inner.tally
    }

    pub fn windows(&self) -> &WindowCache {
        &self.inner.windows
    }

    pub fn publish_confirm_timeout(&self) -> Duration {
        self.inner.publish_confirm_timeout
    }

    pub fn request_deadline(&self) -> Duration {
        self.inner.request_deadline
    }
}
