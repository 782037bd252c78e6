mod bus;
mod config;
mod controller;
mod cycle;
mod error;
mod mqtt;
mod pulse;
mod state;
mod status;
mod web;

use anyhow::{Context, Result};
use std::{env, sync::Arc, time::Duration};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use bus::{InboundRouter, MessageBus, MqttBus};
use controller::DeviceController;
use state::SystemState;
use status::StatusQuery;

/// How long to let the network task flush the disconnect on exit.
const NETWORK_DRAIN: Duration = Duration::from_secs(3);

#[tokio::main]
async fn main() -> Result<()> {
    // ── Logging ─────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Config file (+ env overrides) ───────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;

    // ── Shared state (ephemeral, for the status API) ────────────────
    let shared = SystemState::shared(&cfg.device.name);
    shared
        .write()
        .await
        .record_system("hub started".to_string());

    // ── MQTT ────────────────────────────────────────────────────────
    let (mqtt, eventloop) = MqttBus::connect(&cfg.broker)
        .await
        .with_context(|| format!("mqtt connect to {}:{}", cfg.broker.host, cfg.broker.port))?;
    let bus: Arc<dyn MessageBus> = Arc::new(mqtt.clone());

    // ── Controller ──────────────────────────────────────────────────
    let status = cfg
        .device
        .status
        .as_ref()
        .map(|gate| Arc::new(StatusQuery::from_config(Arc::clone(&bus), gate)));

    let controller = DeviceController::new(
        cfg.device.clone(),
        Arc::clone(&bus),
        status.clone(),
        shared.clone(),
    )?;
    let control = controller::spawn(controller);

    // ── Network task ────────────────────────────────────────────────
    let router = InboundRouter::new(&cfg.device.control_topic, control.clone(), status);
    let network = tokio::spawn(bus::run_event_loop(eventloop, mqtt, router, shared.clone()));

    // ── Web server ──────────────────────────────────────────────────
    let web_state = web::AppState {
        control: control.clone(),
        shared: shared.clone(),
    };
    let web_port = cfg.web.port;
    tokio::spawn(async move {
        if let Err(e) = web::serve(web_port, web_state).await {
            error!("{e:#}");
        }
    });

    info!(
        device = %cfg.device.name,
        control_topic = %cfg.device.control_topic,
        "hub running; ctrl-c to stop"
    );

    // ── Shutdown ────────────────────────────────────────────────────
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutting down");

    if let Err(e) = control.shutdown().await {
        warn!("shutdown: {e}");
    }
    match tokio::time::timeout(NETWORK_DRAIN, network).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("network task ended abnormally: {e}"),
        Err(_) => warn!("network task still running after {NETWORK_DRAIN:?}; exiting anyway"),
    }
    Ok(())
}
