use anyhow::{Context, Result, anyhow};
use axum::{
    Extension,
    body::Body,
    extract::MatchedPath,
    http::{HeaderName, HeaderValue, Method, Request, header::CONTENT_TYPE},
    routing::options,
};
use sqlx::postgres::PgPoolOptions;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    request_id::PropagateRequestIdLayer,
    set_header::SetRequestHeaderLayer,
    trace::TraceLayer,
};
use tracing::{Span, info, info_span, warn};
use ulid::Ulid;
use url::Url;
use utoipa_axum::router::OpenApiRouter;

use crate::engine::{
    agent::RegexAgentParser,
    capture::{CaptureConfig, ContextCapture},
    evaluator::{RiskEvaluator, RiskPolicy},
    geo::HttpGeoLocator,
    notifier::{NotifierConfig, VerificationNotifier},
    orchestrator::SignInOrchestrator,
};
use crate::store::{ContextStore, postgres::PgContextStore};

pub mod config;
pub mod credentials;
pub mod email;
pub mod handlers;
// OpenAPI router wiring and route registration live in openapi.rs.
mod openapi;
pub mod sessions;

pub use config::ServiceConfig;
pub use openapi::openapi;

/// Build the API router with all documented routes registered.
#[must_use]
pub fn router() -> OpenApiRouter {
    openapi::api_router()
}

/// Start the server
/// # Errors
/// Return error if failed to start the server
pub async fn new(
    port: u16,
    dsn: String,
    config: ServiceConfig,
    email_config: email::EmailWorkerConfig,
) -> Result<()> {
    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(10)
        .acquire_timeout(config.store_timeout())
        .max_lifetime(Duration::from_secs(60 * 2))
        .test_before_acquire(true)
        .connect(&dsn)
        .await
        .context("Failed to connect to database")?;

    let store: Arc<dyn ContextStore> = Arc::new(PgContextStore::new(pool.clone()));

    let frontend_base_url = config.frontend_base_url()?;
    let notifier = Arc::new(VerificationNotifier::new(
        store.clone(),
        Arc::new(email::OutboxDelivery),
        NotifierConfig::new(frontend_base_url.clone())
            .with_token_ttl_seconds(config.verification_ttl_seconds())
            .with_delivery_timeout(config.delivery_timeout())
            .with_store_timeout(config.store_timeout()),
    ));
    let evaluator = Arc::new(RiskEvaluator::new(
        store.clone(),
        notifier.clone(),
        RiskPolicy::new(config.thresholds()).with_store_timeout(config.store_timeout()),
    ));
    let capture = ContextCapture::new(
        Arc::new(HttpGeoLocator::new(config.geo_url().to_string())?),
        Arc::new(RegexAgentParser::new()?),
        CaptureConfig::new().with_lookup_timeout(config.geo_timeout()),
    );
    let credentials = credentials::HttpCredentialVerifier::new(
        &config.credentials_url()?,
        config.credentials_timeout(),
    )?;
    let sessions =
        sessions::PgSessionIssuer::new(pool.clone()).with_ttl_seconds(config.session_ttl_seconds());
    let orchestrator = Arc::new(SignInOrchestrator::new(
        Arc::new(credentials),
        Arc::new(sessions),
        capture,
        evaluator,
        notifier,
        store.clone(),
    ));
    let client_ip = Arc::new(handlers::ClientIpSource::new(config.client_ip_header()?));
    let service_token = Arc::new(handlers::ServiceToken::new(config.evaluate_token()));
    if !service_token.is_configured() {
        warn!("no evaluate token configured, /v1/auth/context/evaluate refuses every call");
    }

    info!(
        escalation = config.thresholds().escalation(),
        block = config.thresholds().block(),
        "context checks configured"
    );

    // Background worker polls email_outbox (DB-backed queue) for pending rows,
    // delivers/logs them, and retries failures with exponential backoff.
    email::spawn_outbox_worker(pool.clone(), Arc::new(email::LogEmailSender), email_config);

    let cors = CorsLayer::new()
        .allow_headers([CONTENT_TYPE])
        .allow_methods([Method::GET, Method::POST])
        .allow_origin(AllowOrigin::exact(frontend_origin(&frontend_base_url)?));

    let (router, _openapi) = router().split_for_parts();
    let app = router
        .route("/health", options(handlers::health::health))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static("x-request-id"),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    "x-request-id",
                )))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(cors)
                .layer(Extension(orchestrator))
                .layer(Extension(client_ip))
                .layer(Extension(service_token))
                .layer(Extension(store)),
        );

    let listener = TcpListener::bind(format!("::0:{port}")).await?;

    info!("Listening on [::]:{}", port);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
    info!("Gracefully shutdown");
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}

fn frontend_origin(frontend_base_url: &Url) -> Result<HeaderValue> {
    let host = frontend_base_url.host_str().ok_or_else(|| {
        anyhow!("Frontend base URL must include a valid host: {frontend_base_url}")
    })?;
    let port = frontend_base_url
        .port()
        .map_or_else(String::new, |port| format!(":{port}"));
    let origin = format!("{}://{}{}", frontend_base_url.scheme(), host, port);
    HeaderValue::from_str(&origin).context("Failed to build frontend origin header")
}
