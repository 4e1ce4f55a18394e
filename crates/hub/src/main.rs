mod clock;
mod config;
mod db;
mod error;
mod evaluator;
mod mqtt;
mod runner;
mod scheduler;
mod state;
#[cfg(test)]
mod testing;
mod valve;
mod weather;
mod web;
mod zone;

use anyhow::{Context, Result};
use std::{env, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use clock::Clock;
use config::ValveKind;
use db::Db;
use evaluator::ConditionEvaluator;
use mqtt::MqttValves;
use scheduler::IrrigationScheduler;
use state::SystemState;
use valve::{ValveActuator, ValveBoard};

fn main() -> Result<()> {
    // Read while the process is still single-threaded.
    let clock = Clock::local();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start runtime")?
        .block_on(run(clock))
}

async fn run(clock: Clock) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let db_url = env::var("DB_URL")
        .unwrap_or_else(|_| "sqlite:irrigation.db?mode=rwc".to_string());
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let web_port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;

    if let Ok(path) = env::var("LEGACY_HISTORY_PATH") {
        import_legacy_history(&db, &path).await;
    }

    // ── Config file ─────────────────────────────────────────────────
    let cfg = config::load(&config_path)?;
    let zones = cfg.zone_configs()?;
    if zones.is_empty() {
        warn!(path = %config_path, "no zones configured");
    }

    // ── Weather + shared state ──────────────────────────────────────
    let weather = weather::build_gateway(&cfg.weather, clock)?;
    let shared = SystemState::new(zones.clone(), weather.provider_name(), clock).shared();
    shared.write().await.record_system("hub started");
    info!(
        zones = zones.len(),
        provider = weather.provider_name(),
        utc_offset = %clock.offset(),
        "hub starting"
    );

    // ── Valves ──────────────────────────────────────────────────────
    let valves: Arc<dyn ValveActuator> = match cfg.valves.kind {
        ValveKind::Board => {
            // Many common relay boards are active-low. If yours is active-high, set false.
            let active_low = env::var("RELAY_ACTIVE_LOW")
                .ok()
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(true);
            let refs: Vec<String> = zones.iter().map(|z| z.actuator.clone()).collect();
            let board = ValveBoard::new(&refs, active_low)?;
            board.all_off().await;
            Arc::new(board)
        }
        ValveKind::Mqtt => {
            let host = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
            let port: u16 = env::var("MQTT_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1883);
            let (client, eventloop) = MqttValves::connect(&host, port, "irrigation-hub");
            mqtt::spawn_event_loop(eventloop, shared.clone());
            info!(%host, port, prefix = %cfg.valves.topic_prefix, "mqtt valves");
            Arc::new(MqttValves::new(
                client,
                cfg.valves.topic_prefix.clone(),
                cfg.valves.payload,
            ))
        }
    };

    // ── Scheduler ───────────────────────────────────────────────────
    let evaluator = ConditionEvaluator::new(
        weather,
        db.clone(),
        clock,
        cfg.rain_forecast.clone(),
        cfg.recent_rain.clone(),
    );
    let scheduler = Arc::new(IrrigationScheduler::new(
        evaluator,
        valves,
        db,
        shared,
        clock,
        &cfg.scheduler,
    ));

    let shutdown = CancellationToken::new();

    let web = tokio::spawn(web::serve(scheduler.clone(), web_port, shutdown.clone()));
    let ticker = tokio::spawn(
        scheduler
            .clone()
            .run(Duration::from_secs(cfg.scheduler.tick_sec), shutdown.clone()),
    );

    // ── Run until Ctrl-C ────────────────────────────────────────────
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutdown requested");

    // Let an in-flight tick finish before the registry is drained.
    shutdown.cancel();
    if let Err(e) = ticker.await {
        error!(error = %e, "scheduler loop ended abnormally");
    }
    scheduler.shutdown().await;
    match web.await {
        Ok(Err(e)) => error!(error = %e, "web server failed"),
        Err(e) => error!(error = %e, "web task ended abnormally"),
        Ok(Ok(())) => {}
    }
    Ok(())
}

async fn import_legacy_history(db: &Db, path: &str) {
    match std::fs::read_to_string(path) {
        Ok(json) => match db.import_legacy_json(&json).await {
            Ok(n) => info!(path, imported = n, "legacy history imported"),
            Err(e) => warn!(path, error = %e, "legacy history import failed"),
        },
        Err(e) => warn!(path, error = %e, "legacy history not readable"),
    }
}
