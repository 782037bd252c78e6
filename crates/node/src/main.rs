mod sim;

use anyhow::{bail, Result};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::{env, time::Duration, time::Instant};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use sim::{LightSim, RelayBank, Scenario};

/// How often expired pulses are switched off.
const EXPIRY_TICK: Duration = Duration::from_millis(100);

struct Settings {
    broker: String,
    port: u16,
    relay_prefix: String,
    query_topic: String,
    reply_topic: String,
    status_key: String,
    on_value: i64,
    scenario: Scenario,
    cycle_period: Duration,
}

impl Settings {
    fn from_env() -> Self {
        let var = |name: &str, default: &str| env::var(name).unwrap_or_else(|_| default.to_string());
        Self {
            broker: var("MQTT_HOST", "127.0.0.1"),
            port: env::var("MQTT_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1883),
            relay_prefix: var("SIM_PREFIX", "cmnd"),
            query_topic: var("SIM_STATUS_QUERY", "cmnd/growlight/Mem1"),
            reply_topic: var("SIM_STATUS_REPLY", "stat/growlight/RESULT"),
            status_key: var("SIM_STATUS_KEY", "Mem1"),
            on_value: env::var("SIM_ON_VALUE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1),
            scenario: Scenario::from_str_lossy(&var("SIM_SCENARIO", "on")),
            cycle_period: Duration::from_secs(
                env::var("SIM_CYCLE_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(300),
            ),
        }
    }

    fn subscriptions(&self) -> [String; 3] {
        [
            format!("{}/+/POWER", self.relay_prefix),
            format!("{}/+/PulseTime", self.relay_prefix),
            self.query_topic.clone(),
        ]
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::from_env();
    let mut mqttoptions = MqttOptions::new("mistbuddy-sim", &settings.broker, settings.port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);

    // The network task forwards inbound publishes; state lives in this task.
    let (tx, mut inbound) = mpsc::channel::<(String, Vec<u8>)>(64);
    let topics = settings.subscriptions();
    let sub_client = client.clone();
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("simulator connected to mqtt");
                    for topic in &topics {
                        if let Err(e) = sub_client.try_subscribe(topic, QoS::AtLeastOnce) {
                            error!(topic = %topic, "subscribe failed: {e}");
                        }
                    }
                }
                Ok(Event::Incoming(Packet::Publish(p))) => {
                    if tx.send((p.topic.clone(), p.payload.to_vec())).await.is_err() {
                        return;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    error!("mqtt error: {e}. retrying...");
                    sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });

    let light = LightSim::new(
        settings.scenario,
        &settings.status_key,
        settings.on_value,
        settings.cycle_period,
        Instant::now(),
    );
    let mut relays = RelayBank::new();
    let mut tick = tokio::time::interval(EXPIRY_TICK);

    info!(
        scenario = %settings.scenario,
        query = %settings.query_topic,
        reply = %settings.reply_topic,
        "simulator running"
    );

    loop {
        tokio::select! {
            msg = inbound.recv() => {
                let Some((topic, payload)) = msg else { break };
                let now = Instant::now();

                if topic == settings.query_topic {
                    match light.answer(now) {
                        Some(reply) => {
                            debug!(reply = %reply, "answering status query");
                            publish(&client, &settings.reply_topic, reply).await;
                        }
                        None => warn!("dropping status query (flaky)"),
                    }
                    continue;
                }

                let payload = String::from_utf8_lossy(&payload);
                if let Some(report) = relays.handle(&topic, &payload, now) {
                    info!(device = %report.device, state = report.payload(), "relay switched");
                    publish(&client, &report.topic(), report.payload().to_string()).await;
                }
            }
            _ = tick.tick() => {
                for report in relays.expire(Instant::now()) {
                    info!(device = %report.device, "pulse expired; relay off");
                    publish(&client, &report.topic(), report.payload().to_string()).await;
                }
            }
        }
    }

    bail!("mqtt network task ended; simulator stopped")
}

async fn publish(client: &AsyncClient, topic: &str, payload: String) {
    if let Err(e) = client
        .publish(topic, QoS::AtLeastOnce, false, payload.into_bytes())
        .await
    {
        error!(topic, "publish error: {e}");
    }
}

// ===========================================================================
// Tests
// ===========================================================================
