/**
 * PIOREACTOR SYNC - Entry point
 *
 * Loads the config, opens one sync context for the configured (or newest)
 * experiment and serves the HTTP view until interrupted.
 */

use anyhow::{anyhow, Context, Result};
use pioreactor_sync::api::{Backend, HttpBackend};
use pioreactor_sync::config::load_config;
use pioreactor_sync::context::SyncContext;
use pioreactor_sync::http::{build_router, AppState};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

const IDENTITY_BASE: &str = "webui_dosing";

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pioreactor_sync=info")),
        )
        .init();

    let cfg = load_config().await;
    let backend: Arc<dyn Backend> =
        Arc::new(HttpBackend::from_config(&cfg).context("building leader client")?);

    let experiment = match cfg.experiment.clone() {
        Some(experiment) => experiment,
        None => backend
            .experiments()
            .await
            .context("listing experiments")?
            .into_iter()
            .next()
            .map(|e| e.experiment)
            .ok_or_else(|| anyhow!("leader reports no experiments"))?,
    };
    info!(%experiment, "opening sync context");

    let context = SyncContext::open(&cfg, backend, &experiment, IDENTITY_BASE)
        .await
        .with_context(|| format!("opening sync context for {experiment}"))?;
    let context = Arc::new(context);

    let app = build_router(AppState {
        context: context.clone(),
        api_key: cfg.api_key.clone(),
    });
    let listener = TcpListener::bind(&cfg.listen)
        .await
        .with_context(|| format!("binding {}", cfg.listen))?;
    info!(addr = %cfg.listen, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("http server")?;

    if let Ok(context) = Arc::try_unwrap(context) {
        context.shutdown().await;
    }
    Ok(())
}
