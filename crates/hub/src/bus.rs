//! Message-bus adapter.
//!
//! [`MessageBus`] is the narrow publish/subscribe surface the controller,
//! cycle and status query depend on.  [`MqttBus`] implements it on top of a
//! rumqttc client whose network I/O runs in [`run_event_loop`], a separate
//! task.  Nothing the event loop receives touches controller state
//! directly: control commands cross over an mpsc channel
//! ([`ControlHandle::submit`]) and status replies through
//! [`StatusQuery::resolve`], both safe to call from any thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::BrokerConfig;
use crate::controller::ControlHandle;
use crate::mqtt::parse_control_payload;
use crate::state::SharedState;
use crate::status::StatusQuery;

/// Back-off between reconnect attempts after a connection error.
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Capacity of the rumqttc request channel.
const REQUEST_CAPACITY: usize = 20;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("not connected to broker")]
    NotConnected,
    #[error("no ConnAck from broker within {0:?}")]
    ConnectTimeout(Duration),
    #[error("connection error: {0}")]
    Connection(#[from] rumqttc::ConnectionError),
    #[error("client error: {0}")]
    Client(#[from] rumqttc::ClientError),
}

/// Publish/subscribe primitives shared by the controller, the misting cycle
/// and the status query.  All publishes are QoS 1, not retained.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), BusError>;

    async fn subscribe(&self, topic: &str) -> Result<(), BusError>;

    fn is_connected(&self) -> bool;

    /// Close the connection for good; the event loop exits instead of
    /// reconnecting.
    async fn disconnect(&self) -> Result<(), BusError>;
}

// ---------------------------------------------------------------------------
// rumqttc implementation
// ---------------------------------------------------------------------------

#[derive(Default)]
struct LinkFlags {
    connected: AtomicBool,
    closing: AtomicBool,
}

#[derive(Clone)]
pub struct MqttBus {
    client: AsyncClient,
    flags: Arc<LinkFlags>,
}

impl MqttBus {
    /// Create the client and drive the event loop until the broker accepts
    /// the connection.  The returned event loop must be handed to
    /// [`run_event_loop`].
    pub async fn connect(broker: &BrokerConfig) -> Result<(Self, EventLoop), BusError> {
        let mut options = MqttOptions::new(&broker.client_id, &broker.host, broker.port);
        options.set_keep_alive(Duration::from_secs(broker.keep_alive_secs.max(5)));

        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);

        let deadline = Duration::from_secs(broker.connect_timeout_secs);
        let handshake = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
                    Ok(_) => {}
                    Err(e) => return Err(BusError::Connection(e)),
                }
            }
        };
        match tokio::time::timeout(deadline, handshake).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(BusError::ConnectTimeout(deadline)),
        }

        info!(host = %broker.host, port = broker.port, client_id = %broker.client_id, "mqtt connected");

        let flags = Arc::new(LinkFlags::default());
        flags.connected.store(true, Ordering::SeqCst);
        Ok((Self { client, flags }, eventloop))
    }

    fn set_connected(&self, connected: bool) {
        self.flags.connected.store(connected, Ordering::SeqCst);
    }

    fn is_closing(&self) -> bool {
        self.flags.closing.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageBus for MqttBus {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), BusError> {
        if !self.is_connected() {
            return Err(BusError::NotConnected);
        }
        // try_publish never waits on a full request queue, so a stalled
        // broker cannot stall the misting loop.
        self.client
            .try_publish(topic, QoS::AtLeastOnce, false, payload.as_bytes().to_vec())?;
        debug!(topic, payload, "published");
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), BusError> {
        self.client.try_subscribe(topic, QoS::AtLeastOnce)?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.flags.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) -> Result<(), BusError> {
        self.flags.closing.store(true, Ordering::SeqCst);
        self.client.try_disconnect()?;
        info!("mqtt disconnect requested");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Inbound routing
// ---------------------------------------------------------------------------

/// Dispatches inbound publishes from the network task to their owners.
pub struct InboundRouter {
    control_topic: String,
    control: ControlHandle,
    status: Option<Arc<StatusQuery>>,
}

impl InboundRouter {
    pub fn new(
        control_topic: impl Into<String>,
        control: ControlHandle,
        status: Option<Arc<StatusQuery>>,
    ) -> Self {
        Self {
            control_topic: control_topic.into(),
            control,
            status,
        }
    }

    /// Topics to (re)subscribe after every connect.
    pub fn topics(&self) -> Vec<String> {
        let mut topics = vec![self.control_topic.clone()];
        if let Some(status) = &self.status {
            topics.push(status.reply_topic().to_string());
        }
        topics
    }

    /// Hand one inbound message to whoever owns its topic.  Never blocks.
    pub fn route(&self, topic: &str, payload: &[u8]) {
        if topic == self.control_topic {
            match parse_control_payload(payload) {
                Ok(cmd) => {
                    info!(topic, ?cmd, "control message received");
                    if let Err(e) = self.control.submit(cmd) {
                        error!(topic, "control request dropped: {e}");
                    }
                }
                Err(msg) => warn!(topic, "{msg} (ignored)"),
            }
            return;
        }

        if let Some(status) = &self.status {
            if rumqttc::matches(topic, status.reply_topic()) {
                status.resolve(payload);
                return;
            }
        }

        debug!(topic, "unhandled topic");
    }
}

async fn subscribe_all(bus: &MqttBus, router: &InboundRouter) {
    for topic in router.topics() {
        match bus.subscribe(&topic).await {
            Ok(()) => info!(topic = %topic, "subscribed"),
            Err(e) => error!(topic = %topic, "subscribe failed: {e}"),
        }
    }
}

/// Drive the MQTT connection until [`MessageBus::disconnect`] is called.
///
/// rumqttc reconnects on the next `poll` after an error, so the loop only
/// has to back off, track the link state, and re-subscribe on each ConnAck.
pub async fn run_event_loop(
    mut eventloop: EventLoop,
    bus: MqttBus,
    router: InboundRouter,
    shared: SharedState,
) {
    // The first ConnAck was consumed by `MqttBus::connect`.
    subscribe_all(&bus, &router).await;
    shared.write().await.set_mqtt_connected(true);

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                router.route(&p.topic, &p.payload);
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt reconnected");
                bus.set_connected(true);
                subscribe_all(&bus, &router).await;
                shared.write().await.set_mqtt_connected(true);
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("mqtt disconnected by broker");
                bus.set_connected(false);
                shared.write().await.set_mqtt_connected(false);
            }
            Ok(_) => {}
            Err(e) => {
                bus.set_connected(false);
                if bus.is_closing() {
                    info!("mqtt event loop stopped");
                    shared.write().await.set_mqtt_connected(false);
                    return;
                }
                error!("mqtt error: {e}. reconnecting...");
                {
                    let mut st = shared.write().await;
                    st.set_mqtt_connected(false);
                    st.record_error(format!("mqtt error: {e}"));
                }
                sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Test double
// ---------------------------------------------------------------------------


// ===========================================================================
// Tests
// ===========================================================================
