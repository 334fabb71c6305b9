//! Fire ingestion pipeline: binary entrypoint.
//! Loads config, starts every stage and serves the HTTP/WebSocket surface.

use anyhow::Context;
use fire_ingest_pipeline::api::{self, AppState};
use fire_ingest_pipeline::ingest::adapters::{build_http_client, AdapterCatalog};
use fire_ingest_pipeline::metrics::Metrics;
use fire_ingest_pipeline::{Pipeline, PipelineConfig};
use shuttle_axum::ShuttleAxum;
use tower_http::cors::CorsLayer;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Compact logs by default; `LOG_FORMAT=json` switches to JSON lines.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("fire_ingest_pipeline=info,warn"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    // Shuttle may already have installed a subscriber; keep it in that case.
    let registry = tracing_subscriber::registry().with(filter);
    let res = if json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer().compact()).try_init()
    };
    if res.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

#[shuttle_runtime::main]
async fn axum() -> ShuttleAxum {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();

    init_tracing();

    let config = PipelineConfig::load_default().context("loading pipeline config")?;
    let client = build_http_client().context("building HTTP client")?;
    let metrics = Metrics::init(config.transform.dedupe_window_secs).context("installing metrics recorder")?;

    let pipeline = Pipeline::start(config, AdapterCatalog::http(client)).await?;
    let router = api::router(AppState::new(pipeline))
        .merge(metrics.router())
        .layer(CorsLayer::very_permissive());

    Ok(router.into())
}
