//! AutoForwardX server.
//!
//! Long-running process hosting the forwarding engine and the
//! control-plane HTTP API.
//!
//! ## Development mode
//!
//! Set `AUTOFORWARDX_DEV_MODE=true` to seed a demo user, session and
//! pair on startup. The platform client implementation is selected with
//! `AUTOFORWARDX_PLATFORM` (currently `mock`; a real client library
//! integration registers here).
//!
//! Exit codes: 0 clean shutdown, 2 bad configuration, 3 unrecoverable
//! store failure.

use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use tokio::signal;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use afx_api::{create_router, AppState};
use afx_client::{MockPlatformClient, PlatformClient};
use afx_config::AppConfig;
use afx_engine::{
    AntiBanConfig, DeliveryConfig, EngineConfig, ForwardingEngine, RouterOptions,
    SupervisorConfig, TransformConfig,
};
use afx_store::{SqliteStore, Store};

const EXIT_BAD_CONFIG: i32 = 2;
const EXIT_STORE_FAILURE: i32 = 3;

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    // Load .env if present (local development).
    let _ = dotenvy::dotenv();

    afx_common::logging::init_logging();
    info!("Starting AutoForwardX server");

    // 1. Configuration
    let config = match AppConfig::load() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            return EXIT_BAD_CONFIG;
        }
    };
    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        return EXIT_BAD_CONFIG;
    }

    // 2. Store
    let store = match SqliteStore::connect(&config.database.url, config.database.max_connections)
        .await
    {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(error = %e, url = %config.database.url, "Failed to connect to store");
            return EXIT_STORE_FAILURE;
        }
    };
    if let Err(e) = store.init_schema().await {
        error!(error = %e, "Failed to initialize store schema");
        return EXIT_STORE_FAILURE;
    }

    // 3. Prometheus exporter
    let metrics_handle = match metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
    {
        Ok(handle) => Some(handle),
        Err(e) => {
            error!(error = %e, "Failed to install metrics recorder, continuing without");
            None
        }
    };

    // 4. Platform client
    let platform = std::env::var("AUTOFORWARDX_PLATFORM").unwrap_or_else(|_| "mock".to_string());
    let client: Arc<dyn PlatformClient> = match platform.as_str() {
        "mock" => Arc::new(MockPlatformClient::new()),
        other => {
            error!(platform = other, "Unknown platform client implementation");
            return EXIT_BAD_CONFIG;
        }
    };

    // 5. Dev seeding before the engine opens sessions
    let dev_mode = std::env::var("AUTOFORWARDX_DEV_MODE")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false);
    if dev_mode {
        if let Err(e) = seed_dev_data(store.as_ref()).await {
            error!(error = %e, "Dev seeding failed");
            return EXIT_STORE_FAILURE;
        }
    }

    // 6. Forwarding engine
    let engine = Arc::new(ForwardingEngine::new(
        store.clone(),
        client,
        engine_config(&config),
    ));
    if let Err(e) = engine.start().await {
        error!(error = %e, "Failed to start forwarding engine");
        return EXIT_STORE_FAILURE;
    }

    // 7. Control-plane API
    let cors = if config.server.cors_origins.iter().any(|o| o == "*") {
        CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)
    } else {
        let origins: Vec<axum::http::HeaderValue> = config
            .server
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(Any)
            .allow_headers(Any)
    };

    let mut app = create_router(AppState::from_engine(&engine))
        .layer(TraceLayer::new_for_http())
        .layer(cors);
    if let Some(handle) = metrics_handle {
        app = app.route(
            "/metrics",
            get(move || {
                let handle = handle.clone();
                async move { handle.render() }
            }),
        );
    }

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, addr = %addr, "Failed to bind control-plane listener");
            return EXIT_BAD_CONFIG;
        }
    };
    info!(addr = %addr, workers = config.engine.workers, "AutoForwardX serving");

    // 8. Serve until shutdown, then drain
    let serve = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());
    if let Err(e) = serve.await {
        error!(error = %e, "HTTP server error");
    }

    engine.shutdown().await;
    info!("Shutdown complete");
    0
}

fn engine_config(config: &AppConfig) -> EngineConfig {
    EngineConfig {
        delivery: DeliveryConfig {
            workers: config.engine.workers,
            claim_batch: config.engine.claim_batch,
            max_attempts: config.engine.max_attempts,
            poll_interval: Duration::from_millis(500),
        },
        supervisor: SupervisorConfig {
            health_interval: Duration::from_secs(config.engine.health_interval_secs),
            ..Default::default()
        },
        antiban: AntiBanConfig {
            per_minute: config.rate_limit.per_minute,
            per_hour: config.rate_limit.per_hour,
            warning_threshold: config.rate_limit.warning_threshold,
            critical_threshold: config.rate_limit.critical_threshold,
        },
        router: RouterOptions {
            enforce_daily_cap: config.engine.enforce_daily_cap,
        },
        transforms: TransformConfig::default(),
        ingress_buffer: config.engine.ingress_buffer as usize,
        ..Default::default()
    }
}

/// Demo rows so the API and engine have something to work with locally.
async fn seed_dev_data(store: &dyn Store) -> afx_store::Result<()> {
    use afx_common::{MessageTypeFilter, Pair, PairState, PairStats, Plan, Session, User};

    if store.get_user("dev-user").await.is_ok() {
        return Ok(());
    }
    info!("Seeding development data");

    store.create_user(&User::new("dev-user", Plan::Pro)).await?;
    store
        .create_session(&Session {
            id: "dev-session".into(),
            user_id: "dev-user".into(),
            phone: "+15550100".into(),
            credential_blob: "dev-credentials".into(),
            active: true,
            last_health_at: None,
            display_name: Some("Dev Account".into()),
            created_at: chrono::Utc::now(),
        })
        .await?;
    store
        .create_pair(&Pair {
            id: "dev-pair".into(),
            user_id: "dev-user".into(),
            session_id: "dev-session".into(),
            source_ref: "dev-source".into(),
            destination_ref: "dev-destination".into(),
            state: PairState::Active,
            delay_min_s: 0,
            delay_max_s: 5,
            copy_mode: false,
            silent: false,
            forward_edits: true,
            forward_deletions: false,
            message_type_filter: MessageTypeFilter::All,
            chain: false,
            serialized: false,
            stats: PairStats::default(),
            created_at: chrono::Utc::now(),
        })
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
