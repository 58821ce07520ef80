//! Location API Routes
//!
//! Published surface for UI collaborators (read snapshot, refresh,
//! subscribe over WebSocket) and the inbound surface the host platform
//! pushes position samples, failures and connectivity through.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::Response,
    routing::{get, post},
    Json, Router,
};
use location_tracking::{
    AccuracyLevel, ConnectivityMonitor, ConnectivityState, HostConnectivity, HostPositionFeed,
    LocationService, LocationSnapshot, Position, PositionError, PositionOptions, SafetyLevel,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_stream::{wrappers::WatchStream, StreamExt};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<LocationService>,
    pub feed: Arc<HostPositionFeed>,
    pub connectivity: Arc<HostConnectivity>,
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Snapshot plus display classifications
#[derive(Serialize)]
pub struct LocationView {
    #[serde(flatten)]
    pub snapshot: LocationSnapshot,
    pub safety_level: SafetyLevel,
    pub accuracy_level: AccuracyLevel,
}

impl From<&LocationSnapshot> for LocationView {
    fn from(snapshot: &LocationSnapshot) -> Self {
        Self {
            safety_level: snapshot.safety_level(),
            accuracy_level: snapshot.accuracy_level(),
            snapshot: snapshot.clone(),
        }
    }
}

#[derive(Deserialize)]
pub struct HostSample {
    pub latitude: f64,
    pub longitude: f64,
    /// Accuracy radius in metres
    pub accuracy: Option<f64>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostErrorCode {
    PermissionDenied,
    PositionUnavailable,
    Timeout,
}

#[derive(Deserialize)]
pub struct HostFailure {
    pub code: HostErrorCode,
    pub message: Option<String>,
}

#[derive(Deserialize)]
pub struct HostConnectivityUpdate {
    pub online: bool,
}

#[derive(Serialize)]
pub struct DeliveryResponse {
    /// Number of live watches the event reached
    pub delivered: usize,
}

#[derive(Serialize)]
pub struct ConnectivityResponse {
    pub connectivity: ConnectivityState,
    pub changed: bool,
}

// ============================================================================
// Route Handlers
// ============================================================================

pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "suraksha-gateway",
        "positioning": state.feed.is_supported(),
        "connectivity": state.connectivity.current(),
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// GET /location - Current snapshot
pub async fn get_location(State(state): State<AppState>) -> Json<LocationView> {
    let snapshot = state.service.snapshot();
    Json(LocationView::from(snapshot.as_ref()))
}

/// POST /location/refresh - One-shot read outside the continuous watch
pub async fn refresh_location(State(state): State<AppState>) -> Json<LocationView> {
    let snapshot = state.service.refresh().await;
    Json(LocationView::from(snapshot.as_ref()))
}

/// GET /location/ws - Current snapshot, then every replacement
pub async fn location_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| stream_snapshots(socket, state))
}

async fn stream_snapshots(mut socket: WebSocket, state: AppState) {
    let mut updates = WatchStream::new(state.service.subscribe());

    loop {
        tokio::select! {
            update = updates.next() => {
                let Some(snapshot) = update else { break };
                let json = match serde_json::to_string(&LocationView::from(snapshot.as_ref())) {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::warn!("Snapshot serialization failed: {}", e);
                        continue;
                    }
                };
                if socket.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
    tracing::debug!("Location subscriber disconnected");
}

/// POST /host/position - Sample from the device
pub async fn host_position(
    State(state): State<AppState>,
    Json(sample): Json<HostSample>,
) -> Result<Json<DeliveryResponse>, (StatusCode, String)> {
    let position = Position {
        latitude: sample.latitude,
        longitude: sample.longitude,
        accuracy: sample.accuracy,
    };

    let delivered = state.feed.publish_sample(position).map_err(|e| match e {
        PositionError::CapabilityUnsupported => (StatusCode::NOT_IMPLEMENTED, e.to_string()),
        _ => (StatusCode::BAD_REQUEST, e.to_string()),
    })?;

    Ok(Json(DeliveryResponse { delivered }))
}

/// POST /host/position/error - Device positioning failure
pub async fn host_position_error(
    State(state): State<AppState>,
    Json(failure): Json<HostFailure>,
) -> Json<DeliveryResponse> {
    let error = match failure.code {
        HostErrorCode::PermissionDenied => PositionError::PermissionDenied(
            failure
                .message
                .unwrap_or_else(|| "User denied geolocation".to_string()),
        ),
        HostErrorCode::PositionUnavailable => PositionError::PositionUnavailable(
            failure
                .message
                .unwrap_or_else(|| "No position fix".to_string()),
        ),
        HostErrorCode::Timeout => PositionError::Timeout(state.service.config().watch.timeout()),
    };

    Json(DeliveryResponse {
        delivered: state.feed.publish_error(error),
    })
}

/// POST /host/connectivity - Network transition
pub async fn host_connectivity(
    State(state): State<AppState>,
    Json(update): Json<HostConnectivityUpdate>,
) -> Json<ConnectivityResponse> {
    let connectivity = ConnectivityState::from_online(update.online);
    let changed = state.connectivity.set(connectivity);
    Json(ConnectivityResponse {
        connectivity,
        changed,
    })
}

/// GET /host/position/options - What the live watches ask of the device
pub async fn host_position_options(State(state): State<AppState>) -> Json<Vec<PositionOptions>> {
    Json(state.feed.requested_options())
}

// ============================================================================
// Router
// ============================================================================

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/location", get(get_location))
        .route("/location/refresh", post(refresh_location))
        .route("/location/ws", get(location_ws))
        .route("/host/position", post(host_position))
        .route("/host/position/error", post(host_position_error))
        .route("/host/position/options", get(host_position_options))
        .route("/host/connectivity", post(host_connectivity));

    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request};
    use location_tracking::{GeocodeResolver, ResolvedAddress, ServiceConfig};
    use std::time::Duration;
    use tower::ServiceExt;

    struct FixedResolver;

    #[async_trait]
    impl GeocodeResolver for FixedResolver {
        async fn resolve(&self, _position: &Position) -> ResolvedAddress {
            ResolvedAddress::resolved("Connaught Place, New Delhi, Delhi")
        }
    }

    fn app_with(feed: HostPositionFeed) -> Router {
        let feed = Arc::new(feed);
        let connectivity = Arc::new(HostConnectivity::online());
        let service = Arc::new(LocationService::create(
            ServiceConfig::default(),
            feed.clone(),
            connectivity.clone(),
            Arc::new(FixedResolver),
        ));
        router(AppState {
            service,
            feed,
            connectivity,
        })
    }

    fn app() -> Router {
        app_with(HostPositionFeed::new())
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<&str>) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(body.map(|b| Body::from(b.to_string())).unwrap_or_else(Body::empty))
            .unwrap();

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    async fn wait_for_address(app: &Router, address: &str) -> serde_json::Value {
        for _ in 0..100 {
            let (_, json) = send(app, "GET", "/api/v1/location", None).await;
            if json["address"] == address {
                return json;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("address never became {:?}", address);
    }

    #[tokio::test]
    async fn test_health() {
        let app = app();
        let (status, json) = send(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["positioning"], true);
        assert_eq!(json["connectivity"], "online");
    }

    #[tokio::test]
    async fn test_initial_location() {
        let app = app();
        let (status, json) = send(&app, "GET", "/api/v1/location", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["address"], "Locating...");
        assert_eq!(json["tracking"], "idle");
        assert_eq!(json["score"], 75);
        assert_eq!(json["safety_level"], "caution");
        assert_eq!(json["accuracy_level"], "unknown");
        assert!(json["position"].is_null());
    }

    #[tokio::test]
    async fn test_host_sample_flows_to_snapshot() {
        let app = app();
        let (status, json) = send(
            &app,
            "POST",
            "/api/v1/host/position",
            Some(r#"{"latitude": 28.6315, "longitude": 77.2167, "accuracy": 8.0}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["delivered"], 1);

        let json = wait_for_address(&app, "Connaught Place, New Delhi, Delhi").await;
        assert_eq!(json["tracking"], "active");
        assert_eq!(json["score"], 95);
        assert_eq!(json["safety_level"], "safe");
        assert_eq!(json["accuracy_level"], "very_high");
        assert_eq!(json["position"]["latitude"], 28.6315);
    }

    #[tokio::test]
    async fn test_invalid_sample_rejected() {
        let app = app();
        let (status, _) = send(
            &app,
            "POST",
            "/api/v1/host/position",
            Some(r#"{"latitude": 95.0, "longitude": 77.2}"#),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_positioning_disabled() {
        let app = app_with(HostPositionFeed::unsupported());
        let (_, json) = send(&app, "GET", "/api/v1/location", None).await;
        assert_eq!(json["address"], "Geolocation not supported");

        let (status, _) = send(
            &app,
            "POST",
            "/api/v1/host/position",
            Some(r#"{"latitude": 28.6, "longitude": 77.2}"#),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
    }

    #[tokio::test]
    async fn test_host_error_marks_tracking_failed() {
        let app = app();
        let (status, json) = send(
            &app,
            "POST",
            "/api/v1/host/position/error",
            Some(r#"{"code": "permission_denied"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["delivered"], 1);

        let json = wait_for_address(&app, "Location unavailable").await;
        assert_eq!(json["tracking"], "failed");
        assert_eq!(json["last_error"], "Permission denied: User denied geolocation");
    }

    #[tokio::test]
    async fn test_unknown_error_code_rejected() {
        let app = app();
        let (status, _) = send(
            &app,
            "POST",
            "/api/v1/host/position/error",
            Some(r#"{"code": "solar_flare"}"#),
        )
        .await;
        assert!(status.is_client_error());
    }

    #[tokio::test]
    async fn test_connectivity_transitions() {
        let app = app();
        let (_, json) = send(&app, "POST", "/api/v1/host/connectivity", Some(r#"{"online": false}"#)).await;
        assert_eq!(json["changed"], true);
        assert_eq!(json["connectivity"], "offline");

        let (_, json) = send(&app, "POST", "/api/v1/host/connectivity", Some(r#"{"online": false}"#)).await;
        assert_eq!(json["changed"], false);
    }

    #[tokio::test]
    async fn test_offline_sample_shows_coordinates() {
        let app = app();
        send(&app, "POST", "/api/v1/host/connectivity", Some(r#"{"online": false}"#)).await;
        send(
            &app,
            "POST",
            "/api/v1/host/position",
            Some(r#"{"latitude": 12.9716, "longitude": 77.5946}"#),
        )
        .await;

        let json = wait_for_address(&app, "12.9716, 77.5946").await;
        assert_eq!(json["connectivity"], "offline");
        assert_eq!(json["last_error"], "Failed to fetch address: Network offline");
    }

    #[tokio::test]
    async fn test_requested_options() {
        let app = app();
        let (status, json) = send(&app, "GET", "/api/v1/host/position/options", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json[0]["enable_high_accuracy"], true);
        assert_eq!(json[0]["timeout_ms"], 15000);
        assert_eq!(json[0]["maximum_age_ms"], 60000);
    }

    #[tokio::test]
    async fn test_refresh_uses_recent_sample() {
        let app = app();
        send(
            &app,
            "POST",
            "/api/v1/host/position",
            Some(r#"{"latitude": 28.6315, "longitude": 77.2167, "accuracy": 30.0}"#),
        )
        .await;

        let (status, json) = send(&app, "POST", "/api/v1/location/refresh", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["tracking"], "active");
        assert_eq!(json["position"]["longitude"], 77.2167);

        wait_for_address(&app, "Connaught Place, New Delhi, Delhi").await;
    }
}
