mod buffer;
mod consumer;
mod dedup;
mod picker;
mod scheduler;
mod settings;
mod signal;
mod store;
mod trigger;
mod window;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use axum::routing::get;
use axum::Router;
use clap::Parser;
use serde_json::json;
use tokio::sync::watch;
use tracing::{error, info, warn};

use consumer::{run_consumer, DetectorState};
use picker::{EnvelopePicker, EnvelopePickerConfig, NormMode};
use scheduler::{Backend, StaLtaParams};
use settings::{DetectorMode, PickerNormMode, Settings};
use store::PickStore;

// ─── Global startup time (for uptime reporting) ──────────────────────────────
static STARTUP_MS: AtomicU64 = AtomicU64::new(0);

// ─── Health Endpoint ─────────────────────────────────────────────────────────

async fn health_check() -> axum::Json<serde_json::Value> {
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    let startup = STARTUP_MS.load(Ordering::Relaxed);
    let uptime_secs = if startup > 0 { (now_ms - startup) / 1000 } else { 0 };
    axum::Json(json!({
        "status": "ok",
        "service": "seis-detector",
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSecs": uptime_secs,
    }))
}

fn spawn_health_server(port: u16) {
    tokio::spawn(async move {
        let app = Router::new().route("/health", get(health_check));
        let addr = format!("0.0.0.0:{port}");
        match tokio::net::TcpListener::bind(&addr).await {
            Ok(listener) => {
                info!("Health endpoint at http://{addr}/health");
                if let Err(e) = axum::serve(listener, app).await {
                    warn!("Health server stopped: {e}");
                }
            }
            Err(e) => warn!("Health server: could not bind {addr}: {e}"),
        }
    });
}

// ─── Shutdown signal ─────────────────────────────────────────────────────────

async fn watch_signals(tx: watch::Sender<bool>) {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("Interrupted, stopping consumer");
    let _ = tx.send(true);
}

// ─── Main ────────────────────────────────────────────────────────────────────

fn build_backend(settings: &Settings) -> Backend {
    match settings.detector_mode {
        DetectorMode::StaLta => Backend::StaLta(StaLtaParams {
            fmin: settings.preprocess_fmin,
            fmax: settings.preprocess_fmax,
            sta_seconds: settings.sta_seconds,
            lta_seconds: settings.lta_seconds,
            trigger_on: settings.trigger_on,
            trigger_off: settings.trigger_off,
        }),
        DetectorMode::Picker => {
            let norm_mode = match settings.picker_norm_mode {
                PickerNormMode::Std => NormMode::Std,
                PickerNormMode::Max => NormMode::Max,
            };
            Backend::Picker(EnvelopePicker::new(EnvelopePickerConfig {
                window_samples: settings.picker_window_samples,
                detection_on: settings.picker_detection_threshold,
                detection_off: settings.picker_detection_threshold / 2.0,
                norm_mode,
                ..Default::default()
            }))
        }
    }
}

#[tokio::main]
async fn main() {
    let settings = Settings::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!(
                    "seis_detector={},lapin=warn",
                    settings.log_level.to_lowercase()
                )
                .into()
            }),
        )
        .init();

    let startup_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    STARTUP_MS.store(startup_ms, Ordering::Relaxed);

    info!(
        "🌍 SeisGrid detector v{} starting — mode: {:?}",
        env!("CARGO_PKG_VERSION"),
        settings.detector_mode
    );

    let store = match PickStore::connect(&settings.pg_url()).await {
        Ok(store) => store,
        Err(e) => {
            error!("Failed to connect to PostgreSQL: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = store.ensure_schema().await {
        error!("Failed to bootstrap schema: {e}");
        std::process::exit(1);
    }

    let backend = build_backend(&settings);
    if let Some(window_samples) = backend.input_samples() {
        info!("Loaded picker backend (window={window_samples} samples)");
    }
    let state = DetectorState::new(settings.buffer_seconds, backend);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(watch_signals(shutdown_tx));
    spawn_health_server(settings.health_port);

    match run_consumer(&settings, &store, state, shutdown_rx).await {
        Ok(()) => info!("Detector stopped cleanly"),
        Err(e) => {
            error!("Consumer failed: {e:#}");
            std::process::exit(1);
        }
    }
}
