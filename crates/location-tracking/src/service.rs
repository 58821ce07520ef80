//! Location service orchestrator
//!
//! Owns the tracking state, listens to the position watch and connectivity
//! transitions, drives reverse geocoding and scoring, and publishes each
//! result as a whole [`LocationSnapshot`].
//!
//! ```text
//! IDLE ──sample──▶ ACTIVE ◀──sample── FAILED
//!                    │                  ▲
//!                    └──position error──┘
//! ```
//!
//! Every accepted sample, position error and connectivity recovery bumps a
//! generation counter. A lookup carries the generation it was issued under
//! and its result is applied only if that is still current, so a slow answer
//! for an older position can never overwrite a newer one.

use crate::config::ServiceConfig;
use crate::connectivity::{ConnectivityMonitor, ConnectivityUpdate};
use crate::geocode::{AddressSource, GeocodeError, GeocodeResolver, ResolvedAddress};
use crate::position::{PositionError, PositionEvent, PositionSource, PositionWatch, WatchId};
use crate::scorer::RiskScorer;
use crate::{
    LocationSnapshot, Position, TrackingState, ADDRESS_LOCATING, ADDRESS_REFRESH_FAILED,
    ADDRESS_UNAVAILABLE, ADDRESS_UNSUPPORTED, ADDRESS_UPDATING,
};
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What the current address text is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AddressKind {
    /// Fixed status text
    Placeholder,
    /// Coordinate form while a lookup is outstanding
    Pending,
    Resolved,
    /// Coordinate form after a failed or skipped lookup
    Fallback,
}

struct ServiceState {
    position: Option<Position>,
    address: String,
    address_kind: AddressKind,
    tracking: TrackingState,
    /// Last connectivity update applied
    connectivity: ConnectivityUpdate,
    last_error: Option<String>,
    generation: u64,
    /// Position behind the current resolved address
    last_resolved: Option<Position>,
    revision: u64,
}

impl ServiceState {
    fn set_placeholder(&mut self, text: &str) {
        self.address = text.to_string();
        self.address_kind = AddressKind::Placeholder;
    }

    fn apply_address(&mut self, address: ResolvedAddress) {
        self.address_kind = match address.source {
            AddressSource::Resolved => AddressKind::Resolved,
            AddressSource::Fallback => AddressKind::Fallback,
        };
        self.last_error = address
            .failure
            .map(|reason| format!("Failed to fetch address: {}", reason));
        self.address = address.text;
    }
}

/// A lookup issued for one position under one generation
struct ResolveTicket {
    generation: u64,
    position: Position,
}

struct Inner {
    state: Mutex<ServiceState>,
    snapshot_tx: watch::Sender<Arc<LocationSnapshot>>,
    source: Arc<dyn PositionSource>,
    resolver: Arc<dyn GeocodeResolver>,
    scorer: RiskScorer,
    config: ServiceConfig,
}

impl Inner {
    fn on_sample(self: &Arc<Self>, position: Position) {
        let ticket = {
            let mut state = self.state.lock();
            state.position = Some(position);
            state.tracking = TrackingState::Active;
            state.last_error = None;
            state.generation += 1;

            let ticket = if !state.connectivity.state.is_online() {
                debug!("Offline, skipping lookup for {}", position.fallback_label());
                state.apply_address(ResolvedAddress::fallback(&position, &GeocodeError::Offline));
                None
            } else if self.within_debounce(&state, &position) {
                debug!(
                    "Sample {} within {} m of last lookup, keeping address",
                    position.fallback_label(),
                    self.config.resolve.min_distance_m
                );
                None
            } else {
                state.address = position.fallback_label();
                state.address_kind = AddressKind::Pending;
                Some(ResolveTicket {
                    generation: state.generation,
                    position,
                })
            };

            self.publish(&mut state);
            ticket
        };

        if let Some(ticket) = ticket {
            self.spawn_resolve(ticket);
        }
    }

    fn on_position_error(&self, error: PositionError) {
        warn!("Position source error: {}", error);
        let mut state = self.state.lock();
        state.tracking = TrackingState::Failed;
        state.set_placeholder(ADDRESS_UNAVAILABLE);
        state.last_error = Some(error.to_string());
        state.generation += 1;
        self.publish(&mut state);
    }

    fn on_unsupported(&self) {
        warn!("Host has no positioning capability");
        let mut state = self.state.lock();
        state.set_placeholder(ADDRESS_UNSUPPORTED);
        state.last_error = Some(PositionError::CapabilityUnsupported.to_string());
        self.publish(&mut state);
    }

    fn on_refresh_failed(&self, error: PositionError) {
        warn!("Manual refresh failed: {}", error);
        let mut state = self.state.lock();
        state.set_placeholder(ADDRESS_REFRESH_FAILED);
        state.last_error = Some(error.to_string());
        self.publish(&mut state);
    }

    fn on_connectivity_change(self: &Arc<Self>, update: ConnectivityUpdate) {
        let ticket = {
            let mut state = self.state.lock();
            if state.connectivity.transitions == update.transitions {
                return;
            }
            // Also true for an offline period merged away between wakeups
            let recovered = update.recovered_since(&state.connectivity);
            state.connectivity = update;

            let ticket = match (recovered, state.address_kind, state.position) {
                (true, AddressKind::Fallback, Some(position)) => {
                    info!("Back online, retrying lookup for {}", position.fallback_label());
                    state.generation += 1;
                    Some(ResolveTicket {
                        generation: state.generation,
                        position,
                    })
                }
                _ => None,
            };

            self.publish(&mut state);
            ticket
        };

        if let Some(ticket) = ticket {
            self.spawn_resolve(ticket);
        }
    }

    fn on_resolved(&self, ticket: ResolveTicket, address: ResolvedAddress) {
        let mut state = self.state.lock();
        if state.generation != ticket.generation {
            debug!(
                "Discarding stale address for {} (generation {}, current {})",
                ticket.position.fallback_label(),
                ticket.generation,
                state.generation
            );
            return;
        }

        if address.source == AddressSource::Resolved {
            state.last_resolved = Some(ticket.position);
        }
        state.apply_address(address);
        self.publish(&mut state);
    }

    fn spawn_resolve(self: &Arc<Self>, ticket: ResolveTicket) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            if !inner.is_current(ticket.generation) {
                debug!(
                    "Skipping lookup for {}, superseded before it started",
                    ticket.position.fallback_label()
                );
                return;
            }
            let address = inner.resolver.resolve(&ticket.position).await;
            inner.on_resolved(ticket, address);
        });
    }

    fn is_current(&self, generation: u64) -> bool {
        self.state.lock().generation == generation
    }

    fn within_debounce(&self, state: &ServiceState, position: &Position) -> bool {
        let min_distance = self.config.resolve.min_distance_m;
        if min_distance <= 0.0 || state.address_kind != AddressKind::Resolved {
            return false;
        }
        state
            .last_resolved
            .map_or(false, |last| last.distance_m(position) < min_distance)
    }

    /// Replace the published snapshot. Called with the state lock held so
    /// publications follow state order.
    fn publish(&self, state: &mut ServiceState) {
        state.revision += 1;
        let score = self
            .scorer
            .score(state.position.as_ref(), &state.address, state.tracking);
        let snapshot = LocationSnapshot {
            position: state.position,
            address: state.address.clone(),
            tracking: state.tracking,
            connectivity: state.connectivity.state,
            last_error: state.last_error.clone(),
            score,
            revision: state.revision,
            updated_at: Utc::now(),
        };
        self.snapshot_tx.send_replace(Arc::new(snapshot));
    }
}

async fn run_watch(inner: Arc<Inner>, mut watch: PositionWatch) {
    while let Some(event) = watch.next().await {
        match event {
            PositionEvent::Sample(position) => inner.on_sample(position),
            PositionEvent::Error(error) => inner.on_position_error(error),
        }
    }
    debug!("Position watch {} closed", watch.id().id());
}

async fn run_connectivity(inner: Arc<Inner>, mut rx: watch::Receiver<ConnectivityUpdate>) {
    while rx.changed().await.is_ok() {
        let update = *rx.borrow_and_update();
        inner.on_connectivity_change(update);
    }
}

/// Location tracking service
///
/// Construct with [`LocationService::create`] inside a tokio runtime. The
/// position watch is released and background tasks stop on
/// [`LocationService::dispose`] or drop.
pub struct LocationService {
    inner: Arc<Inner>,
    watch_id: Option<WatchId>,
    tasks: Vec<JoinHandle<()>>,
}

impl LocationService {
    pub fn create(
        config: ServiceConfig,
        source: Arc<dyn PositionSource>,
        connectivity: Arc<dyn ConnectivityMonitor>,
        resolver: Arc<dyn GeocodeResolver>,
    ) -> Self {
        let scorer = RiskScorer::new(&config.scorer);

        let mut connectivity_rx = connectivity.subscribe();
        let initial_connectivity = *connectivity_rx.borrow_and_update();

        let initial = LocationSnapshot::initial(
            initial_connectivity.state,
            scorer.score(None, ADDRESS_LOCATING, TrackingState::Idle),
        );
        let (snapshot_tx, _) = watch::channel(Arc::new(initial));

        let inner = Arc::new(Inner {
            state: Mutex::new(ServiceState {
                position: None,
                address: ADDRESS_LOCATING.to_string(),
                address_kind: AddressKind::Placeholder,
                tracking: TrackingState::Idle,
                connectivity: initial_connectivity,
                last_error: None,
                generation: 0,
                last_resolved: None,
                revision: 0,
            }),
            snapshot_tx,
            source,
            resolver,
            scorer,
            config,
        });

        let mut tasks = vec![tokio::spawn(run_connectivity(
            Arc::clone(&inner),
            connectivity_rx,
        ))];

        let watch_id = match inner.source.start(&inner.config.watch) {
            Ok(watch) => {
                let id = watch.id();
                info!("Location service started (watch {})", id.id());
                tasks.push(tokio::spawn(run_watch(Arc::clone(&inner), watch)));
                Some(id)
            }
            Err(PositionError::CapabilityUnsupported) => {
                inner.on_unsupported();
                None
            }
            Err(e) => {
                inner.on_position_error(e);
                None
            }
        };

        Self {
            inner,
            watch_id,
            tasks,
        }
    }

    /// Current published snapshot
    pub fn snapshot(&self) -> Arc<LocationSnapshot> {
        self.inner.snapshot_tx.borrow().clone()
    }

    /// Change notifications. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> watch::Receiver<Arc<LocationSnapshot>> {
        self.inner.snapshot_tx.subscribe()
    }

    /// Manual one-shot read, independent of the continuous watch. Returns
    /// the snapshot published once the read settles; a successful read may
    /// still have its lookup outstanding.
    pub async fn refresh(&self) -> Arc<LocationSnapshot> {
        {
            let mut state = self.inner.state.lock();
            state.set_placeholder(ADDRESS_UPDATING);
            state.last_error = None;
            self.inner.publish(&mut state);
        }

        match self.inner.source.request_once(&self.inner.config.refresh).await {
            Ok(position) => self.inner.on_sample(position),
            Err(PositionError::CapabilityUnsupported) => self.inner.on_unsupported(),
            Err(e) => self.inner.on_refresh_failed(e),
        }

        self.snapshot()
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    /// Release the position watch and stop background tasks
    pub fn dispose(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(id) = self.watch_id.take() {
            self.inner.source.stop(id);
            info!("Location service stopped (watch {})", id.id());
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        // Lookups still in flight are discarded on completion
        self.inner.state.lock().generation += 1;
    }
}

impl Drop for LocationService {
    fn drop(&mut self) {
        self.shutdown();
    }
}
