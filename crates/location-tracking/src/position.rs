//! Position sources
//!
//! A [`PositionSource`] hands out continuous watches and one-shot reads.
//! [`HostPositionFeed`] is the implementation backed by samples the host
//! platform pushes in (device bridge, gateway endpoint, tests).

use crate::Position;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Buffer for one-shot listeners; they only care about the next event
const ONE_SHOT_CHANNEL_SIZE: usize = 16;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PositionError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Position unavailable: {0}")]
    PositionUnavailable(String),
    #[error("Timed out after {0:?} waiting for a position")]
    Timeout(Duration),
    #[error("Geolocation is not supported by this host")]
    CapabilityUnsupported,
    #[error("Invalid position sample: {0}")]
    InvalidSample(String),
}

pub type Result<T> = std::result::Result<T, PositionError>;

/// Acquisition options passed to the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionOptions {
    pub enable_high_accuracy: bool,
    /// How long to wait for a sample before reporting a timeout
    pub timeout_ms: u64,
    /// Oldest cached sample that may be reused instead of a fresh read
    pub maximum_age_ms: u64,
}

impl PositionOptions {
    /// Defaults for the continuous watch
    pub fn watch() -> Self {
        Self {
            enable_high_accuracy: true,
            timeout_ms: 15_000,
            maximum_age_ms: 60_000,
        }
    }

    /// Defaults for a manual refresh
    pub fn one_shot() -> Self {
        Self {
            enable_high_accuracy: true,
            timeout_ms: 10_000,
            maximum_age_ms: 60_000,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn maximum_age(&self) -> Duration {
        Duration::from_millis(self.maximum_age_ms)
    }
}

impl Default for PositionOptions {
    fn default() -> Self {
        Self::watch()
    }
}

/// One item delivered on a watch
#[derive(Debug, Clone, PartialEq)]
pub enum PositionEvent {
    Sample(Position),
    Error(PositionError),
}

/// Handle identifying a continuous watch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(u64);

impl WatchId {
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Receiving end of a continuous watch
pub struct PositionWatch {
    id: WatchId,
    timeout: Duration,
    events: mpsc::UnboundedReceiver<PositionEvent>,
}

impl PositionWatch {
    pub fn new(
        id: WatchId,
        timeout: Duration,
        events: mpsc::UnboundedReceiver<PositionEvent>,
    ) -> Self {
        Self {
            id,
            timeout,
            events,
        }
    }

    pub fn id(&self) -> WatchId {
        self.id
    }

    /// Next sample or error. A missed deadline yields a `Timeout` error and
    /// the watch keeps running. `None` once the watch has been stopped.
    pub async fn next(&mut self) -> Option<PositionEvent> {
        match tokio::time::timeout(self.timeout, self.events.recv()).await {
            Ok(event) => event,
            Err(_) => Some(PositionEvent::Error(PositionError::Timeout(self.timeout))),
        }
    }
}

/// Platform positioning capability
#[async_trait]
pub trait PositionSource: Send + Sync {
    /// Begin a continuous watch. Fails synchronously when positioning is
    /// absent; the watch stays registered until [`PositionSource::stop`].
    fn start(&self, options: &PositionOptions) -> Result<PositionWatch>;

    /// Release a watch. Unknown ids are ignored.
    fn stop(&self, id: WatchId);

    /// Single read, independent of any running watch
    async fn request_once(&self, options: &PositionOptions) -> Result<Position>;
}

struct Watcher {
    options: PositionOptions,
    tx: mpsc::UnboundedSender<PositionEvent>,
}

/// Position source fed by the host platform
pub struct HostPositionFeed {
    supported: bool,
    next_id: AtomicU64,
    watchers: Mutex<HashMap<WatchId, Watcher>>,
    latest: Mutex<Option<(Position, Instant)>>,
    events: broadcast::Sender<PositionEvent>,
}

impl HostPositionFeed {
    pub fn new() -> Self {
        Self::with_support(true)
    }

    /// A host without positioning; every request fails with
    /// `CapabilityUnsupported`
    pub fn unsupported() -> Self {
        Self::with_support(false)
    }

    fn with_support(supported: bool) -> Self {
        let (events, _) = broadcast::channel(ONE_SHOT_CHANNEL_SIZE);
        Self {
            supported,
            next_id: AtomicU64::new(1),
            watchers: Mutex::new(HashMap::new()),
            latest: Mutex::new(None),
            events,
        }
    }

    pub fn is_supported(&self) -> bool {
        self.supported
    }

    /// Push a sample from the platform. Returns the number of watches it
    /// reached.
    pub fn publish_sample(&self, position: Position) -> Result<usize> {
        if !self.supported {
            return Err(PositionError::CapabilityUnsupported);
        }
        if !position.is_valid() {
            return Err(PositionError::InvalidSample(format!(
                "lat={} lon={} accuracy={:?}",
                position.latitude, position.longitude, position.accuracy
            )));
        }

        *self.latest.lock() = Some((position, Instant::now()));
        Ok(self.fan_out(PositionEvent::Sample(position)))
    }

    /// Push a platform failure. Returns the number of watches it reached.
    pub fn publish_error(&self, error: PositionError) -> usize {
        warn!("Host reported position error: {}", error);
        self.fan_out(PositionEvent::Error(error))
    }

    /// Number of live watches
    pub fn watch_count(&self) -> usize {
        let mut watchers = self.watchers.lock();
        watchers.retain(|_, w| !w.tx.is_closed());
        watchers.len()
    }

    /// Options requested by the live watches
    pub fn requested_options(&self) -> Vec<PositionOptions> {
        let mut watchers = self.watchers.lock();
        watchers.retain(|_, w| !w.tx.is_closed());
        watchers.values().map(|w| w.options.clone()).collect()
    }

    fn fan_out(&self, event: PositionEvent) -> usize {
        let delivered = {
            let mut watchers = self.watchers.lock();
            watchers.retain(|id, w| {
                let alive = w.tx.send(event.clone()).is_ok();
                if !alive {
                    debug!("Dropping closed watch {}", id.0);
                }
                alive
            });
            watchers.len()
        };
        // No one-shot listener is fine
        let _ = self.events.send(event);
        delivered
    }

    fn cached(&self, maximum_age: Duration) -> Option<Position> {
        let latest = self.latest.lock();
        latest
            .as_ref()
            .filter(|(_, at)| at.elapsed() <= maximum_age)
            .map(|(p, _)| *p)
    }
}

impl Default for HostPositionFeed {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PositionSource for HostPositionFeed {
    fn start(&self, options: &PositionOptions) -> Result<PositionWatch> {
        if !self.supported {
            return Err(PositionError::CapabilityUnsupported);
        }

        let id = WatchId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();

        // A recent enough sample is replayed so the watch starts warm
        if let Some(position) = self.cached(options.maximum_age()) {
            let _ = tx.send(PositionEvent::Sample(position));
        }

        self.watchers.lock().insert(
            id,
            Watcher {
                options: options.clone(),
                tx,
            },
        );
        debug!("Started position watch {}", id.0);

        Ok(PositionWatch::new(id, options.timeout(), rx))
    }

    fn stop(&self, id: WatchId) {
        if self.watchers.lock().remove(&id).is_some() {
            debug!("Stopped position watch {}", id.0);
        }
    }

    async fn request_once(&self, options: &PositionOptions) -> Result<Position> {
        if !self.supported {
            return Err(PositionError::CapabilityUnsupported);
        }

        // Subscribe before checking the cache so a sample landing in between
        // is not missed
        let mut rx = self.events.subscribe();
        if let Some(position) = self.cached(options.maximum_age()) {
            return Ok(position);
        }

        let wait = async {
            loop {
                match rx.recv().await {
                    Ok(PositionEvent::Sample(p)) => return Ok(p),
                    Ok(PositionEvent::Error(e)) => return Err(e),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(PositionError::PositionUnavailable(
                            "position feed closed".to_string(),
                        ))
                    }
                }
            }
        };

        tokio::time::timeout(options.timeout(), wait)
            .await
            .map_err(|_| PositionError::Timeout(options.timeout()))?
    }
}
