//! # splitter: audio stem separation over HTTP
//!
//! `splitter` accepts the URL of an audio file, downloads it, separates it into stems (vocals,
//! accompaniment, drums, ...) and publishes every stem to an object store, answering with the
//! public URL of each one.
//!
//! ## Request Flow
//!
//! `POST /process {"url": ...}` runs the [`pipeline::Pipeline`] in a fresh temporary directory:
//!
//! 1. **Download** ([`download`]): one GET of the source URL. Anything other than `200 OK` is a
//!    client error and answers `400 {"detail": "Failed to download file"}`.
//! 2. **Separate** ([`separation`]): either the `spleeter` command line tool run as a subprocess,
//!    or a pretrained waveform model run in-process from an exclusive-checkout pool. A limiter
//!    bounds how many separations run at once.
//! 3. **Publish** ([`storage`]): each stem is uploaded as `<stem>_<source stem>.wav` and its
//!    public URL collected.
//!
//! Every other failure answers `500 {"detail": <error text>}`. The working directory is removed
//! whether the request succeeds or not.
//!
//! `GET /health` always answers `{"status": "healthy"}`. API docs are served at `/docs`.
//!
//! ## Quick Start
//!
//! ```no_run
//! use clap::Parser;
//! use splitter::{Application, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = splitter::config::Args::parse();
//!     let config = Config::load(&args)?;
//!
//!     splitter::telemetry::init_telemetry(config.enable_otel_export)?;
//!
//!     let app = Application::new(config).await?;
//!     app.serve(async {
//!         tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
//!     })
//!     .await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! See the [`config`] module for configuration options.
pub mod api;
pub mod audio;
pub mod config;
pub mod download;
pub mod errors;
mod metrics;
mod openapi;
pub mod pipeline;
pub mod separation;
pub mod storage;
pub mod telemetry;

#[cfg(test)]
pub mod test_utils;

use crate::{
    config::{CorsOrigin, StorageBackend},
    download::Downloader,
    openapi::ApiDoc,
    pipeline::Pipeline,
    separation::{SeparationEngine, Separator},
};
use axum::http::HeaderValue;
use axum::{
    Json, Router,
    routing::{get, post},
};
use axum_prometheus::PrometheusMetricLayer;
use bon::Builder;
pub use config::Config;
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{Level, debug, info, instrument};
use utoipa::OpenApi;
use utoipa_scalar::{Scalar, Servable};

/// Path the local storage backend's objects are served under.
pub const LOCAL_OBJECTS_PATH: &str = "/objects";

/// Application state shared across all request handlers.
///
/// # Example
///
/// ```ignore
/// let state = AppState::builder()
///     .config(config)
///     .pipeline(pipeline)
///     .build();
/// ```
#[derive(Clone, Builder)]
pub struct AppState {
    pub config: Config,
    pub pipeline: Pipeline,
}

/// Build an outbound HTTP client with an optional overall request timeout.
///
/// Installs the process-wide rustls crypto provider on first use, so library callers and tests
/// do not depend on `main` having done so.
pub(crate) fn http_client(timeout: Option<Duration>) -> anyhow::Result<reqwest::Client> {
    static CRYPTO_PROVIDER: Once = Once::new();
    CRYPTO_PROVIDER.call_once(|| {
        // Fails only if a provider is already installed, which is fine
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    });

    let mut builder = reqwest::Client::builder();
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    Ok(builder.build()?)
}

/// Create CORS layer from configuration
fn create_cors_layer(config: &Config) -> anyhow::Result<CorsLayer> {
    let cors_config = &config.cors;

    let mut cors = if cors_config.allowed_origins.iter().any(|o| matches!(o, CorsOrigin::Wildcard)) {
        CorsLayer::new().allow_origin(Any)
    } else {
        let mut origins = Vec::new();
        for origin in &cors_config.allowed_origins {
            if let CorsOrigin::Url(url) = origin {
                origins.push(url.origin().ascii_serialization().parse::<HeaderValue>()?);
            }
        }
        CorsLayer::new().allow_origin(origins)
    };

    cors = cors.allow_methods(Any).allow_headers(Any);

    if let Some(max_age) = cors_config.max_age {
        cors = cors.max_age(Duration::from_secs(max_age));
    }

    Ok(cors)
}

/// Build the application router with all endpoints and middleware.
///
/// - `POST /process` and `GET /health`
/// - OpenAPI JSON at `/openapi.json`, rendered docs at `/docs`
/// - Stored objects under [`LOCAL_OBJECTS_PATH`] when the local storage backend is selected
/// - Prometheus metrics at `/internal/metrics` when enabled
/// - CORS and tracing middleware
#[instrument(skip_all)]
pub fn build_router(state: AppState) -> anyhow::Result<Router> {
    let config = state.config.clone();

    let mut router = Router::new()
        .route("/process", post(api::handlers::process::process))
        .route("/health", get(api::handlers::health::health))
        .with_state(state)
        .route("/openapi.json", get(|| async { Json(ApiDoc::openapi()) }))
        .merge(Scalar::with_url("/docs", ApiDoc::openapi()));

    if config.storage.backend == StorageBackend::Local {
        router = router.nest_service(LOCAL_OBJECTS_PATH, ServeDir::new(&config.storage.local_root));
    }

    let cors_layer = create_cors_layer(&config)?;
    router = router.layer(cors_layer);

    if config.enable_metrics {
        let (prometheus_layer, metric_handle) = PrometheusMetricLayer::pair();
        router = router
            .route("/internal/metrics", get(|| async move { metric_handle.render() }))
            .layer(prometheus_layer);
    }

    let router = router.layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_request(DefaultOnRequest::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    );

    Ok(router)
}

/// Main application struct.
///
/// 1. **Create**: [`Application::new`] loads the separation backend, connects the object store
///    (creating the bucket when configured to) and builds the router
/// 2. **Serve**: [`Application::serve`] binds to a TCP port and handles requests until the
///    shutdown future resolves
pub struct Application {
    router: Router,
    config: Config,
}

impl Application {
    /// Create a new application instance with the configured separation backend
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let separator = separation::build_separator(&config.separation.engine)?;
        Self::new_with_separator(config, separator).await
    }

    /// Create a new application instance around an existing separation backend
    pub async fn new_with_separator(config: Config, separator: Arc<dyn Separator>) -> anyhow::Result<Self> {
        debug!("Starting splitter with configuration: {:#?}", config);

        let store = storage::build_store(&config.storage)?;
        if config.storage.create_bucket {
            store.ensure_bucket().await?;
        }

        let engine = SeparationEngine::new(separator, &config.separation);
        info!(
            "Separation engine ready: {} -> [{}], {} concurrent",
            engine.name(),
            engine.stems().join(", "),
            config.separation.max_concurrent
        );

        let pipeline = Pipeline::new(Downloader::new(&config.download)?, engine, store, config.work_dir.clone());

        let app_state = AppState::builder().config(config.clone()).pipeline(pipeline).build();
        let router = build_router(app_state)?;

        Ok(Self { router, config })
    }

    /// Convert application into a test server (for tests)
    #[cfg(test)]
    pub fn into_test_server(self) -> axum_test::TestServer {
        axum_test::TestServer::new(self.router.into_make_service()).expect("Failed to create test server")
    }

    /// Start serving the application
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.config.bind_address();
        let listener = TcpListener::bind(&bind_addr).await?;
        info!(
            "Splitter listening on http://{}, available at http://localhost:{}",
            bind_addr, self.config.port
        );

        axum::serve(listener, self.router.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await?;

        info!("Shutting down telemetry...");
        telemetry::shutdown_telemetry();

        Ok(())
    }
}
