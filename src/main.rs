//! Fleet Sync
//!
//! Offline-first device service for fleet trip records: a SQLite local store,
//! tenant-scoped replication to a shared cloud store, and invite-based
//! onboarding of driver devices.

mod api;
mod auth;
mod cloud;
mod config;
mod db;
mod errors;
mod invite;
mod models;
mod scope;
mod sync;

use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post, put},
    Router,
};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use auth::Accounts;
use cloud::{CloudStore, HttpCloudStore, MemoryCloudStore, ScopedCloud};
use config::Config;
use db::LocalStore;
use invite::{InviteService, LocalDeviceIdentity};
use models::{
    Advance, Client, Company, Driver, FuelEntry, PickupClientDistance, PickupLocation, RateSlab,
    Trip,
};
use scope::ScopeManager;
use sync::{DedupResolver, SyncCoordinator};

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: LocalStore,
    pub scope: ScopeManager,
    pub accounts: Accounts,
    pub resolver: DedupResolver,
    pub coordinator: Arc<SyncCoordinator>,
    pub invites: Arc<InviteService>,
    pub config: Arc<Config>,
}

impl AppState {
    /// Wire the engine around one local store and one cloud store.
    pub fn new(config: Config, store: LocalStore, cloud: Arc<dyn CloudStore>) -> Self {
        let scope = ScopeManager::new();
        let coordinator = SyncCoordinator::new(
            store.clone(),
            ScopedCloud::new(cloud.clone(), scope.scope()),
            config.sync_max_attempts,
        );
        let invites = InviteService::new(
            cloud,
            scope.clone(),
            store.clone(),
            Arc::new(LocalDeviceIdentity::new(store.clone())),
            config.invite_ttl,
        );
        Self {
            accounts: Accounts::new(store.clone(), scope.clone()),
            resolver: DedupResolver::new(store.clone()),
            coordinator: Arc::new(coordinator),
            invites: Arc::new(invites),
            config: Arc::new(config),
            store,
            scope,
        }
    }
}

fn cloud_from_config(config: &Config) -> Result<Arc<dyn CloudStore>, errors::AppError> {
    match &config.cloud_url {
        Some(url) => {
            tracing::info!("Cloud store: {}", url);
            Ok(Arc::new(HttpCloudStore::new(url, config.cloud_token.clone())?))
        }
        None => {
            tracing::warn!("No cloud store configured (FLEET_CLOUD_URL). Using an in-memory store!");
            Ok(Arc::new(MemoryCloudStore::new()))
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::from_env();

    // Initialize logging
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let registry = tracing_subscriber::registry().with(env_filter);
    if config.log_json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    tracing::info!("Starting Fleet Sync");
    tracing::info!("Database path: {:?}", config.db_path);
    tracing::info!("Bind address: {}", config.bind_addr);

    // Warn if PSK is not configured
    if config.api_psk.is_none() {
        tracing::warn!("No API PSK configured (FLEET_API_PSK). Authentication is disabled!");
    }

    // Initialize database
    let pool = db::init_database(&config.db_path).await?;
    let store = LocalStore::new(pool);
    let cloud = cloud_from_config(&config)?;

    let state = AppState::new(config.clone(), store, cloud);

    let route = state.accounts.restore_session().await?;
    tracing::info!(?route, "Launch route");

    // Background sync
    let cancel = CancellationToken::new();
    let sync_task = state
        .coordinator
        .clone()
        .spawn(config.sync_interval, cancel.clone());

    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;

    cancel.cancel();
    if let Err(e) = sync_task.await {
        tracing::error!("Sync task ended abnormally: {}", e);
    }
    tracing::info!("Shut down");

    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
        }
        _ = cancel.cancelled() => {}
    }
    tracing::info!("Shutdown requested");
    cancel.cancel();
}

/// Create the application router with all routes.
pub fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Clone PSK for the auth layer
    let psk = state.config.api_psk.clone();

    // API routes
    let api_routes = Router::new()
        // Session
        .route("/session", get(api::get_session))
        .route("/session/owner", post(api::login_owner))
        .route("/session/logout", post(api::logout))
        .route("/launch", get(api::get_launch_route))
        .route("/owner/setup", post(api::setup_owner))
        // Invites
        .route("/invites", post(api::create_invite))
        .route("/invites/{code}", get(api::validate_invite))
        .route("/invites/{code}/confirm", post(api::confirm_invite))
        // Reference data
        .route("/drivers", get(api::list_records::<Driver>))
        .route("/drivers", post(api::create_reference::<Driver>))
        .route("/drivers/{id}/advance-balance", get(api::get_advance_balance))
        .route("/companies", get(api::list_records::<Company>))
        .route("/companies", post(api::create_reference::<Company>))
        .route("/clients", get(api::list_records::<Client>))
        .route("/clients", post(api::create_reference::<Client>))
        .route("/pickup-locations", get(api::list_records::<PickupLocation>))
        .route("/pickup-locations", post(api::create_reference::<PickupLocation>))
        .route("/distances", get(api::list_records::<PickupClientDistance>))
        .route("/distances", post(api::create_reference::<PickupClientDistance>))
        .route("/rate-slabs", get(api::list_records::<RateSlab>))
        .route("/rate-slabs", put(api::replace_rate_slabs))
        // Financial records
        .route("/fuel", get(api::list_records::<FuelEntry>))
        .route("/fuel", post(api::create_fuel))
        .route("/advances", get(api::list_records::<Advance>))
        .route("/advances", post(api::create_advance))
        .route("/trips", get(api::list_records::<Trip>))
        .route("/trips", post(api::create_trip))
        .route("/trips/{id}/verify", post(api::verify_trip))
        .route("/trips/{id}/override", post(api::override_trip))
        .route("/audit", get(api::list_audit))
        // Sync
        .route("/sync", post(api::force_sync))
        .route("/sync/status", get(api::get_sync_status))
        .route("/sync/retry", post(api::retry_failed))
        // Apply PSK auth middleware
        .layer(middleware::from_fn(move |req, next| {
            auth::psk_auth_layer(psk.clone(), req, next)
        }));

    // Health check (no auth required)
    let health_routes = Router::new().route("/health", get(health_check));

    Router::new()
        .nest("/api", api_routes)
        .merge(health_routes)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint.
async fn health_check() -> &'static str {
    "OK"
}
