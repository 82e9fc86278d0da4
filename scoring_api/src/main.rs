use anyhow::Context;
use tracing_subscriber::EnvFilter;

mod api;
mod model;
mod types;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = telematics_core::Settings::load().context("invalid configuration")?;
    let calibration = settings.calibration()?;
    tracing::info!(
        "pricing calibration: baseline={} slope_k={} cap={:?}",
        calibration.baseline(),
        calibration.slope(),
        calibration.bounds()
    );

    let bind_addr = settings.bind_addr.clone();
    let state = api::AppState::new(settings, calibration);

    // A missing artifact is not fatal: /score and /pricing answer 503 until it appears.
    if state.model.path().exists() {
        state.model.load()?;
    } else {
        tracing::warn!(
            "model artifact {} not found; scoring disabled until it is trained",
            state.model.path().display()
        );
    }

    let app = api::router(state);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    tracing::info!("listening on http://{}", bind_addr);

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to install ctrl-c handler: {e}");
        }
        tracing::info!("shutdown signal received");
    };
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
