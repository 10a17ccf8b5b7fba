mod associator;
mod geometry;
mod settings;
mod solver;
mod store;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::routing::get;
use axum::Router;
use clap::Parser;
use serde_json::json;
use tokio::sync::watch;
use tracing::{error, info, warn};

use seis_types::{Station, StationKey};

use associator::associate_picks;
use settings::Settings;
use solver::{estimate_origin, DEFAULT_MAX_DEPTH_KM, DEFAULT_MAX_ITERATIONS};
use store::OriginStore;

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
        "service": "seis-locator",
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
    info!("Interrupted, stopping locator");
    let _ = tx.send(true);
}

// ─── Locator cycle ───────────────────────────────────────────────────────────

/// One fetch → associate → solve → persist pass.
async fn run_cycle(
    store: &OriginStore,
    settings: &Settings,
    stations: &mut HashMap<StationKey, Station>,
) -> anyhow::Result<()> {
    let picks = store.fetch_recent_picks(settings.lookback_seconds).await?;

    if !picks.is_empty()
        && picks
            .iter()
            .any(|pick| !stations.contains_key(&pick.station_key()))
    {
        info!("Refreshing station cache due to unknown station in picks");
        *stations = store.fetch_stations().await?;
    }

    let events = associate_picks(
        &picks,
        settings.association_window_seconds,
        settings.min_stations,
        settings.min_stations,
        settings.min_pick_score,
    );

    let mut solved = 0usize;
    for event in &events {
        let estimate = match estimate_origin(
            event,
            stations,
            settings.vp_km_s,
            settings.min_stations,
            DEFAULT_MAX_DEPTH_KM,
            DEFAULT_MAX_ITERATIONS,
        ) {
            Ok(Some(estimate)) => estimate,
            Ok(None) => continue,
            Err(e) => {
                error!("Solver rejected configuration: {e}");
                continue;
            }
        };

        if estimate.rms_seconds > settings.max_residual_seconds {
            info!(
                "Skipping origin due to RMS: association_key={} rms={:.4} threshold={:.4}",
                estimate.association_key, estimate.rms_seconds, settings.max_residual_seconds
            );
            continue;
        }

        let origin_id = store.upsert_origin(&estimate).await?;
        store.replace_origin_arrivals(origin_id, &estimate).await?;
        solved += 1;
    }

    info!(
        "Cycle complete: stations={} picks={} events={} solved={solved}",
        stations.len(),
        picks.len(),
        events.len()
    );
    Ok(())
}

// ─── Main ────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    let settings = Settings::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("seis_locator={}", settings.log_level.to_lowercase()).into()
            }),
        )
        .init();

    let startup_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    STARTUP_MS.store(startup_ms, Ordering::Relaxed);

    info!("🌍 SeisGrid locator v{} starting", env!("CARGO_PKG_VERSION"));

    if settings.vp_km_s <= 0.0 || settings.min_stations < 3 {
        error!(
            "Invalid solver configuration: vp_km_s={} min_stations={}",
            settings.vp_km_s, settings.min_stations
        );
        std::process::exit(1);
    }

    let store = match OriginStore::connect(&settings.pg_url()).await {
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

    let mut stations = match store.fetch_stations().await {
        Ok(stations) => stations,
        Err(e) => {
            error!("Failed to load stations: {e}");
            std::process::exit(1);
        }
    };
    info!("Loaded stations: count={}", stations.len());

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(watch_signals(shutdown_tx));
    spawn_health_server(settings.health_port);

    while !*shutdown_rx.borrow() {
        if let Err(e) = run_cycle(&store, &settings, &mut stations).await {
            error!("Locator cycle failed: {e:#}");
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs_f64(settings.poll_seconds)) => {}
            _ = shutdown_rx.changed() => {}
        }
    }

    info!("Stopping locator service");
}
