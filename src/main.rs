use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::bail;
use axum::{routing::get, Router};
use http::HeaderValue;
use tokio::signal;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};

use promptmarket_api as api;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = api::config::load_config()?;
    api::config::init_tracing(cfg.log_level(), cfg.log_json);

    // Init DB (marketplace tables, read-only for this service)
    let db = Arc::new(api::db::establish_connection(&cfg).await?);

    // Init Redis client (construction only; connection checked in health)
    let redis_client = Arc::new(redis::Client::open(cfg.redis_url.clone())?);

    // Recovery store: Redis primary, in-process memory secondary
    let store = Arc::new(api::storage::RedundantStore::new(
        Arc::new(api::storage::RedisStore::new(
            redis_client.clone(),
            cfg.recovery_namespace.clone(),
            cfg.recovery_store_ttl_secs,
        )),
        Arc::new(api::storage::MemoryStore::new()),
    ));

    // External auth service client
    let auth: Arc<dyn api::auth::AuthClient> = Arc::new(api::auth::GoTrueClient::new(
        cfg.auth_url.clone(),
        cfg.auth_api_key.clone(),
    )?);

    // Transaction directory over the marketplace database
    let directory: Arc<dyn api::recovery::lookup::RecoveryDirectory> =
        Arc::new(api::recovery::lookup::SeaOrmDirectory::new(db.clone()));

    let services = api::handlers::AppServices::new(store, auth, directory);

    let app_state = api::AppState {
        db,
        config: cfg.clone(),
        redis: redis_client,
        services,
    };

    // Build CORS layer from config
    let configured_origins: Option<Vec<HeaderValue>> = cfg
        .cors_allowed_origins
        .as_ref()
        .map(|raw| {
            raw.split(',')
                .filter_map(|origin| {
                    let trimmed = origin.trim();
                    if trimmed.is_empty() {
                        None
                    } else {
                        HeaderValue::from_str(trimmed).ok()
                    }
                })
                .collect::<Vec<_>>()
        })
        .filter(|origins| !origins.is_empty());

    let cors_layer = if let Some(origins) = configured_origins {
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    } else if cfg.should_allow_permissive_cors() {
        info!("using permissive CORS, no explicit origins configured");
        CorsLayer::permissive()
    } else {
        error!("missing CORS configuration; set APP__CORS_ALLOWED_ORIGINS or APP__CORS_ALLOW_ANY_ORIGIN=true");
        bail!("missing CORS configuration");
    };

    // Rate limiter, shared by the middleware and the cleanup task
    let rate_limiter = Arc::new(api::rate_limiter::RateLimiter::new(
        api::rate_limiter::RateLimitConfig {
            requests_per_window: cfg.rate_limit_requests_per_window,
            window_duration: Duration::from_secs(cfg.rate_limit_window_seconds),
            enable_headers: cfg.rate_limit_enable_headers,
        },
    ));
    tokio::spawn(api::rate_limiter::start_cleanup_task(
        rate_limiter.clone(),
        Duration::from_secs(300),
    ));

    let app = Router::<api::AppState>::new()
        .route("/", get(|| async { "promptmarket-api up" }))
        .nest("/api/v1", api::api_v1_routes())
        .merge(api::openapi::swagger_ui())
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(cors_layer)
        .layer(axum::middleware::from_fn_with_state(
            rate_limiter,
            api::rate_limiter::rate_limit_middleware,
        ))
        .with_state(app_state);

    let addr = SocketAddr::new(cfg.host.parse()?, cfg.port);
    info!("promptmarket-api listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install signal handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
