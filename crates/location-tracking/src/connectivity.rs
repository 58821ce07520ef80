//! Host network reachability
//!
//! [`HostConnectivity`] holds the online/offline flag the host reports and
//! fans transitions out over a watch channel. [`ConnectivityProbe`] can drive
//! it from periodic HTTP checks when the host has no native notification.

use crate::ConnectivityState;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Latest state plus the number of transitions that led to it.
///
/// A watch receiver only sees the newest value, so a quick
/// offline/online flap shows up as an unchanged state with `transitions`
/// advanced by two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectivityUpdate {
    pub state: ConnectivityState,
    pub transitions: u64,
}

impl ConnectivityUpdate {
    /// Whether an offline period lies between `previous` and this update
    pub fn recovered_since(&self, previous: &ConnectivityUpdate) -> bool {
        if !self.state.is_online() || self.transitions == previous.transitions {
            return false;
        }
        !previous.state.is_online() || self.transitions.saturating_sub(previous.transitions) >= 2
    }
}

/// Online/offline notification capability
pub trait ConnectivityMonitor: Send + Sync {
    /// State as of now
    fn current(&self) -> ConnectivityState;

    /// Receiver that wakes on every transition
    fn subscribe(&self) -> watch::Receiver<ConnectivityUpdate>;
}

/// Connectivity flag set by the host
pub struct HostConnectivity {
    tx: watch::Sender<ConnectivityUpdate>,
}

impl HostConnectivity {
    pub fn new(initial: ConnectivityState) -> Self {
        let (tx, _) = watch::channel(ConnectivityUpdate {
            state: initial,
            transitions: 0,
        });
        Self { tx }
    }

    pub fn online() -> Self {
        Self::new(ConnectivityState::Online)
    }

    /// Record the host's state. Returns true when this was a transition.
    pub fn set(&self, state: ConnectivityState) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if current.state == state {
                false
            } else {
                current.state = state;
                current.transitions += 1;
                true
            }
        });
        if changed {
            info!("Connectivity changed to {:?}", state);
        }
        changed
    }
}

impl ConnectivityMonitor for HostConnectivity {
    fn current(&self) -> ConnectivityState {
        self.tx.borrow().state
    }

    fn subscribe(&self) -> watch::Receiver<ConnectivityUpdate> {
        self.tx.subscribe()
    }
}

/// Periodic reachability check feeding a [`HostConnectivity`]
pub struct ConnectivityProbe {
    client: reqwest::Client,
    url: String,
    interval: Duration,
    monitor: Arc<HostConnectivity>,
}

impl ConnectivityProbe {
    pub fn new(
        monitor: Arc<HostConnectivity>,
        url: impl Into<String>,
        interval: Duration,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(monitor, client, url, interval))
    }

    /// Use a preconfigured client; its timeout bounds each check
    pub fn with_client(
        monitor: Arc<HostConnectivity>,
        client: reqwest::Client,
        url: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            client,
            url: url.into(),
            interval,
            monitor,
        }
    }

    /// Any HTTP response counts as reachable; transport failures do not
    pub async fn check(&self) -> ConnectivityState {
        match self.client.get(&self.url).send().await {
            Ok(response) => {
                debug!("Probe {} answered {}", self.url, response.status());
                ConnectivityState::Online
            }
            Err(e) => {
                debug!("Probe {} failed: {}", self.url, e);
                ConnectivityState::Offline
            }
        }
    }

    /// Run the probe until the handle is aborted
    pub fn spawn(self) -> JoinHandle<()> {
        info!(
            "Connectivity probe every {:?} against {}",
            self.interval, self.url
        );
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            loop {
                interval.tick().await;
                let state = self.check().await;
                self.monitor.set(state);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::get, Router};

    fn local_client() -> reqwest::Client {
        reqwest::Client::builder()
            .no_proxy()
            .timeout(Duration::from_secs(2))
            .build()
            .unwrap()
    }

    #[test]
    fn test_set_reports_transitions_only() {
        let host = HostConnectivity::online();
        assert!(!host.set(ConnectivityState::Online));
        assert!(host.set(ConnectivityState::Offline));
        assert!(!host.set(ConnectivityState::Offline));
        assert_eq!(host.current(), ConnectivityState::Offline);
    }

    #[tokio::test]
    async fn test_subscriber_sees_transition() {
        let host = HostConnectivity::new(ConnectivityState::Offline);
        let mut rx = host.subscribe();

        host.set(ConnectivityState::Online);
        rx.changed().await.unwrap();
        let update = *rx.borrow_and_update();
        assert_eq!(update.state, ConnectivityState::Online);
        assert_eq!(update.transitions, 1);
    }

    #[test]
    fn test_flap_visible_through_transition_count() {
        let host = HostConnectivity::online();
        let rx = host.subscribe();
        let before = *rx.borrow();

        host.set(ConnectivityState::Offline);
        host.set(ConnectivityState::Online);

        let after = *rx.borrow();
        assert_eq!(after.state, ConnectivityState::Online);
        assert_eq!(after.transitions, 2);
        assert!(after.recovered_since(&before));
    }

    #[test]
    fn test_recovered_since() {
        let update = |state, transitions| ConnectivityUpdate { state, transitions };
        let online = ConnectivityState::Online;
        let offline = ConnectivityState::Offline;

        assert!(update(online, 1).recovered_since(&update(offline, 0)));
        assert!(update(online, 4).recovered_since(&update(online, 2)));
        assert!(!update(online, 2).recovered_since(&update(online, 2)));
        assert!(!update(offline, 1).recovered_since(&update(online, 0)));
        assert!(!update(offline, 3).recovered_since(&update(offline, 1)));
    }

    #[tokio::test]
    async fn test_probe_reachable_endpoint() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route("/", get(|| async { "ok" }));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let host = Arc::new(HostConnectivity::new(ConnectivityState::Offline));
        let probe = ConnectivityProbe::with_client(
            Arc::clone(&host),
            local_client(),
            format!("http://{}/", addr),
            Duration::from_secs(30),
        );

        assert_eq!(probe.check().await, ConnectivityState::Online);
    }

    #[tokio::test]
    async fn test_probe_unreachable_endpoint() {
        // Reserve a port, then release it so nothing is listening
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let host = Arc::new(HostConnectivity::online());
        let probe = ConnectivityProbe::with_client(
            Arc::clone(&host),
            local_client(),
            format!("http://{}/", addr),
            Duration::from_millis(50),
        );

        let mut rx = host.subscribe();
        let handle = probe.spawn();
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().state, ConnectivityState::Offline);
        handle.abort();
    }
}
