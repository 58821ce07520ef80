use anyhow::Result;
use location_tracking::{
    ConnectivityProbe, HostConnectivity, HostPositionFeed, LocationService, NominatimResolver,
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod routes;

use config::GatewayConfig;
use routes::AppState;

/// Bound on a single reachability check
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "suraksha_gateway=debug,location_tracking=debug,info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = GatewayConfig::from_env()?;

    let feed = Arc::new(if config.positioning_enabled {
        HostPositionFeed::new()
    } else {
        tracing::warn!("   Positioning disabled - location will report unsupported");
        HostPositionFeed::unsupported()
    });
    let connectivity = Arc::new(HostConnectivity::online());
    let resolver = Arc::new(NominatimResolver::new(config.service.geocode.clone())?);

    // Optional reachability probe for hosts without native online/offline events
    let _probe = match &config.probe_url {
        Some(url) => {
            let probe = ConnectivityProbe::new(
                Arc::clone(&connectivity),
                url.clone(),
                config.probe_interval,
                PROBE_TIMEOUT,
            )?;
            Some(probe.spawn())
        }
        None => None,
    };

    let service = Arc::new(LocationService::create(
        config.service.clone(),
        feed.clone(),
        connectivity.clone(),
        resolver,
    ));

    let app = routes::router(AppState {
        service,
        feed,
        connectivity,
    });

    let addr = format!("0.0.0.0:{}", config.port);

    tracing::info!("Suraksha Gateway starting on {}", addr);
    tracing::info!("   Geocoder: {}", config.service.geocode.base_url);
    tracing::info!(
        "   Country bias: {}",
        config.service.geocode.country_codes.join(",")
    );
    tracing::info!(
        "   Lookup debounce: {} m",
        config.service.resolve.min_distance_m
    );

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
