//! Device controller and the control task that serializes access to it.
//!
//! [`DeviceController`] owns at most one [`MistingCycle`] and the bus
//! connection.  Its `start`/`stop` take `&mut self` and must not overlap;
//! [`spawn`] satisfies that by moving the controller into one task that
//! drains a request channel.  Every caller (HTTP routes, the MQTT router,
//! shutdown) goes through the returned [`ControlHandle`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use crate::bus::{BusError, MessageBus};
use crate::config::DeviceConfig;
use crate::cycle::{validate_duration, CycleDeps, MistingCycle};
use crate::error::ControllerError;
use crate::mqtt::ControlCommand;
use crate::pulse::encode_power_off;
use crate::state::SharedState;
use crate::status::StatusQuery;

/// How long `stop` waits for a cycle to exit before aborting it.
const STOP_WAIT: Duration = Duration::from_secs(2);

/// Pending control requests.  Inbound MQTT commands beyond this are dropped.
const CONTROL_QUEUE: usize = 16;

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// Owns the single active misting cycle.
///
/// Precondition: `start`, `stop` and `shutdown` are never called
/// concurrently on one instance.  Use [`spawn`] rather than sharing it.
pub struct DeviceController {
    config: DeviceConfig,
    deps: CycleDeps,
    active: Option<MistingCycle>,
}

impl DeviceController {
    pub fn new(
        config: DeviceConfig,
        bus: Arc<dyn MessageBus>,
        status: Option<Arc<StatusQuery>>,
        shared: SharedState,
    ) -> Result<Self, ControllerError> {
        config.validate().map_err(ControllerError::Config)?;
        let deps = CycleDeps {
            bus,
            power_topics: config.power_topics.clone().into(),
            status,
            shared,
        };
        Ok(Self {
            config,
            deps,
            active: None,
        })
    }

    pub fn is_running(&self) -> bool {
        self.active.is_some()
    }

    /// Duration of the running cycle, if any.
    pub fn active_duration(&self) -> Option<f64> {
        self.active.as_ref().map(MistingCycle::duration_on)
    }

    /// Replace any running cycle with a new one misting `duration_on`
    /// seconds per minute.
    ///
    /// The old cycle is fully stopped (and power switched off) first.  On
    /// any error the controller is left idle.
    pub async fn start(&mut self, duration_on: f64) -> Result<(), ControllerError> {
        if let Some(previous) = self.active_duration() {
            info!(device = %self.config.name, previous, duration_on, "replacing running cycle");
        }
        self.stop().await?;

        if let Err(e) = validate_duration(duration_on) {
            error!(device = %self.config.name, duration_on, "start rejected: {e}");
            if let Err(off) = self.power_off().await {
                warn!(device = %self.config.name, "power off after rejected start failed: {off}");
            }
            self.deps
                .shared
                .write()
                .await
                .record_error(format!("start rejected: {e}"));
            return Err(e);
        }

        if !self.deps.bus.is_connected() {
            warn!(device = %self.config.name, duration_on, "start refused: bus not connected");
            self.deps
                .shared
                .write()
                .await
                .record_error("start refused: mqtt not connected".to_string());
            return Err(ControllerError::NotConnected);
        }

        let mut cycle = MistingCycle::new(duration_on, self.deps.clone());
        cycle.start()?;
        self.active = Some(cycle);

        info!(device = %self.config.name, duration_on, "misting started");
        self.deps
            .shared
            .write()
            .await
            .record_cycle_started(duration_on);
        Ok(())
    }

    /// Stop the running cycle and switch power off.  A no-op when idle.
    ///
    /// The cycle reference is always cleared; a failed OFF publish is
    /// returned after cleanup.
    pub async fn stop(&mut self) -> Result<(), ControllerError> {
        let Some(mut cycle) = self.active.take() else {
            return Ok(());
        };

        if !cycle.stop(STOP_WAIT).await {
            warn!(device = %self.config.name, "cycle did not stop cleanly; powering off anyway");
        }
        let off = self.power_off().await;

        let detail = match &off {
            Ok(()) => "misting stopped".to_string(),
            Err(e) => format!("misting stopped; power off failed: {e}"),
        };
        info!(device = %self.config.name, "{detail}");
        self.deps.shared.write().await.record_cycle_stopped(detail);

        off.map_err(ControllerError::from)
    }

    /// Stop, then close the bus.  The bus is only closed once no cycle can
    /// publish through it.
    pub async fn shutdown(&mut self) -> Result<(), ControllerError> {
        let stopped = self.stop().await;
        if let Err(e) = self.deps.bus.disconnect().await {
            warn!(device = %self.config.name, "bus disconnect failed: {e}");
        }
        info!(device = %self.config.name, "controller shut down");
        stopped
    }

    /// Publish OFF to every relay.  Keeps going past failures and reports
    /// the first one.
    async fn power_off(&self) -> Result<(), BusError> {
        if self.deps.power_topics.is_empty() {
            info!(device = %self.config.name, "(simulated) power OFF");
            return Ok(());
        }

        let mut first_err = None;
        for cmd in encode_power_off(&self.deps.power_topics) {
            if let Err(e) = self.deps.bus.publish(&cmd.topic, &cmd.payload).await {
                error!(topic = %cmd.topic, "power off publish failed: {e}");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Control task
// ---------------------------------------------------------------------------

type Reply = oneshot::Sender<Result<(), ControllerError>>;

/// One request for the control task.  `reply` is `None` for fire-and-forget
/// commands from the MQTT router.
#[derive(Debug)]
pub(crate) struct ControlRequest {
    pub(crate) command: ControlCommand,
    pub(crate) reply: Option<Reply>,
}

/// Cloneable, thread-safe entry point to the control task.
#[derive(Clone)]
pub struct ControlHandle {
    tx: mpsc::Sender<ControlRequest>,
}

impl ControlHandle {
    pub(crate) fn channel(capacity: usize) -> (Self, mpsc::Receiver<ControlRequest>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Queue a command without waiting for it.  Never blocks, so it is safe
    /// from the network task.
    pub(crate) fn submit(
        &self,
        command: ControlCommand,
    ) -> Result<(), mpsc::error::TrySendError<ControlRequest>> {
        self.tx.try_send(ControlRequest {
            command,
            reply: None,
        })
    }

    pub async fn start(&self, duration_on: f64) -> Result<(), ControllerError> {
        self.request(ControlCommand::Start(duration_on)).await
    }

    pub async fn stop(&self) -> Result<(), ControllerError> {
        self.request(ControlCommand::Stop).await
    }

    pub async fn shutdown(&self) -> Result<(), ControllerError> {
        self.request(ControlCommand::Shutdown).await
    }

    async fn request(&self, command: ControlCommand) -> Result<(), ControllerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ControlRequest {
                command,
                reply: Some(reply),
            })
            .await
            .map_err(|_| ControllerError::Unavailable)?;
        rx.await.map_err(|_| ControllerError::Unavailable)?
    }
}

/// Move `controller` into its own task and return the handle to it.
pub fn spawn(controller: DeviceController) -> ControlHandle {
    let (handle, rx) = ControlHandle::channel(CONTROL_QUEUE);
    tokio::spawn(run(controller, rx));
    handle
}

async fn run(mut controller: DeviceController, mut rx: mpsc::Receiver<ControlRequest>) {
    info!(device = %controller.config.name, "control task started");

    while let Some(req) = rx.recv().await {
        let shutting_down = req.command == ControlCommand::Shutdown;
        let result = match req.command {
            ControlCommand::Start(d) => controller.start(d).await,
            ControlCommand::Stop => controller.stop().await,
            ControlCommand::Shutdown => controller.shutdown().await,
        };

        match req.reply {
            Some(reply) => {
                let _ = reply.send(result);
            }
            None => {
                if let Err(e) = result {
                    error!(command = ?req.command, "control command failed: {e}");
                }
            }
        }

        if shutting_down {
            info!("control task stopped");
            return;
        }
    }

    // Every handle is gone; leave the device off.
    if controller.is_running() {
        if let Err(e) = controller.stop().await {
            warn!("final stop failed: {e}");
        }
    }
    info!("control task stopped");
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::testing::RecordingBus;
    use crate::state::{EventKind, SystemState};
    use crate::status::testing::{answering_query, QUERY_TOPIC};
    use tokio::time::sleep;

    const FAN: &str = "cmnd/mistbuddy_fan/POWER";
    const MISTER: &str = "cmnd/mistbuddy_mister/POWER";

    fn device_config() -> DeviceConfig {
        DeviceConfig {
            name: "tent".to_string(),
            control_topic: "mistbuddy/tent/set".to_string(),
            power_topics: vec![FAN.to_string(), MISTER.to_string()],
            simulate: false,
            status: None,
        }
    }

    fn controller(bus: &Arc<RecordingBus>) -> DeviceController {
        DeviceController::new(
            device_config(),
            Arc::clone(bus) as Arc<dyn MessageBus>,
            None,
            SystemState::shared("tent"),
        )
        .unwrap()
    }

    fn offs() -> Vec<(String, String)> {
        vec![
            (FAN.to_string(), "OFF".to_string()),
            (MISTER.to_string(), "OFF".to_string()),
        ]
    }

    fn tail(bus: &RecordingBus, n: usize) -> Vec<(String, String)> {
        let all = bus.published();
        all[all.len().saturating_sub(n)..].to_vec()
    }

    // -- Construction --------------------------------------------------------

    #[test]
    fn new_rejects_missing_power_topics() {
        let bus = RecordingBus::new();
        let mut cfg = device_config();
        cfg.power_topics.clear();
        let result = DeviceController::new(cfg, bus, None, SystemState::shared("tent"));
        assert!(matches!(result, Err(ControllerError::Config(_))));
    }

    #[test]
    fn new_accepts_simulated_device() {
        let bus = RecordingBus::new();
        let mut cfg = device_config();
        cfg.power_topics.clear();
        cfg.simulate = true;
        assert!(DeviceController::new(cfg, bus, None, SystemState::shared("tent")).is_ok());
    }

    // -- start / stop --------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn start_then_stop_ends_with_off_for_every_relay() {
        let bus = RecordingBus::new();
        let mut ctl = controller(&bus);

        ctl.start(5.0).await.unwrap();
        assert!(ctl.is_running());
        sleep(Duration::from_secs(1)).await;
        ctl.stop().await.unwrap();

        assert!(!ctl.is_running());
        assert_eq!(tail(&bus, 2), offs());

        let after_stop = bus.published().len();
        sleep(Duration::from_secs(300)).await;
        assert_eq!(bus.published().len(), after_stop, "no pulses after stop");
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_idempotent() {
        let bus = RecordingBus::new();
        let mut ctl = controller(&bus);
        ctl.start(10.0).await.unwrap();

        ctl.stop().await.unwrap();
        let after_first = bus.published().len();
        ctl.stop().await.unwrap();
        assert_eq!(bus.published().len(), after_first);
    }

    #[tokio::test]
    async fn stop_when_idle_publishes_nothing() {
        let bus = RecordingBus::new();
        let mut ctl = controller(&bus);
        ctl.stop().await.unwrap();
        assert!(bus.published().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn restart_replaces_old_cycle() {
        let bus = RecordingBus::new();
        let mut ctl = controller(&bus);

        ctl.start(10.0).await.unwrap();
        sleep(Duration::from_secs(1)).await;
        ctl.start(20.0).await.unwrap();
        assert_eq!(ctl.active_duration(), Some(20.0));

        // The old cycle was torn down (OFF) before the new one pulsed.
        let all = bus.published();
        let last_off = all.iter().rposition(|(_, p)| p == "OFF").unwrap();
        assert_eq!(all[last_off - 1..=last_off].to_vec(), offs());

        sleep(Duration::from_secs(170)).await;
        let after: Vec<_> = bus.published()[last_off + 1..].to_vec();
        assert!(after.iter().all(|(_, p)| p != "112"), "old cycle fired again");
        assert_eq!(
            after.iter().filter(|(_, p)| p == "120").count(),
            6,
            "new cycle pulses both relays each minute"
        );
        ctl.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_duration_leaves_power_off_and_idle() {
        let bus = RecordingBus::new();
        let mut ctl = controller(&bus);

        for d in [60.0, 0.0, -5.0, f64::NAN] {
            bus.clear();
            let err = ctl.start(d).await.unwrap_err();
            assert!(matches!(err, ControllerError::InvalidDuration(_)));
            assert!(err.is_config());
            assert!(!ctl.is_running());
            assert_eq!(bus.published(), offs());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_restart_stops_running_cycle() {
        let bus = RecordingBus::new();
        let mut ctl = controller(&bus);
        ctl.start(10.0).await.unwrap();

        assert!(ctl.start(75.0).await.is_err());
        assert!(!ctl.is_running());
        let before = bus.published().len();
        sleep(Duration::from_secs(120)).await;
        assert_eq!(bus.published().len(), before);
        assert_eq!(tail(&bus, 2), offs());
    }

    #[tokio::test]
    async fn start_while_disconnected_fails_and_stays_idle() {
        let bus = RecordingBus::new();
        bus.set_offline(true);
        let mut ctl = controller(&bus);

        let err = ctl.start(10.0).await.unwrap_err();
        assert!(matches!(err, ControllerError::NotConnected));
        assert!(!err.is_config());
        assert!(!ctl.is_running());
        assert!(bus.published().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_power_off_is_reported_but_cycle_is_cleared() {
        let bus = RecordingBus::new();
        let mut ctl = controller(&bus);
        ctl.start(10.0).await.unwrap();

        bus.set_fail_publishes(true);
        assert!(matches!(ctl.stop().await, Err(ControllerError::Bus(_))));
        assert!(!ctl.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_powers_off_then_disconnects() {
        let bus = RecordingBus::new();
        let mut ctl = controller(&bus);
        ctl.start(10.0).await.unwrap();

        ctl.shutdown().await.unwrap();
        assert_eq!(tail(&bus, 2), offs());
        assert!(bus.was_disconnected());
    }

    #[tokio::test(start_paused = true)]
    async fn gated_cycle_queries_before_pulsing() {
        let bus = RecordingBus::new();
        let (query, _answer) =
            answering_query(&bus, Duration::from_secs(5), Some(br#"{"Mem1":"1"}"#));
        let mut ctl = DeviceController::new(
            device_config(),
            Arc::clone(&bus) as Arc<dyn MessageBus>,
            Some(query),
            SystemState::shared("tent"),
        )
        .unwrap();

        ctl.start(10.0).await.unwrap();
        sleep(Duration::from_secs(1)).await;
        let all = bus.published();
        assert_eq!(all[0].0, QUERY_TOPIC);
        assert_eq!(all[2], (FAN.to_string(), "ON".to_string()));
        ctl.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn state_tracks_cycle() {
        let bus = RecordingBus::new();
        let shared = SystemState::shared("tent");
        let mut ctl = DeviceController::new(
            device_config(),
            Arc::clone(&bus) as Arc<dyn MessageBus>,
            None,
            shared.clone(),
        )
        .unwrap();

        ctl.start(12.5).await.unwrap();
        assert_eq!(
            shared.read().await.cycle.as_ref().map(|c| c.duration_on),
            Some(12.5)
        );
        ctl.stop().await.unwrap();
        assert!(shared.read().await.cycle.is_none());
    }

    // -- Control task --------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn handle_round_trips_results() {
        let bus = RecordingBus::new();
        let handle = spawn(controller(&bus));

        handle.start(10.0).await.unwrap();
        assert!(matches!(
            handle.start(60.0).await,
            Err(ControllerError::InvalidDuration(_))
        ));
        handle.stop().await.unwrap();
        assert_eq!(tail(&bus, 2), offs());
    }

    #[tokio::test(start_paused = true)]
    async fn submitted_commands_are_applied_in_order() {
        let bus = RecordingBus::new();
        let shared = SystemState::shared("tent");
        let ctl = DeviceController::new(
            device_config(),
            Arc::clone(&bus) as Arc<dyn MessageBus>,
            None,
            shared.clone(),
        )
        .unwrap();
        let handle = spawn(ctl);

        handle.submit(ControlCommand::Start(15.0)).unwrap();
        handle.submit(ControlCommand::Stop).unwrap();
        handle.submit(ControlCommand::Start(25.0)).unwrap();
        // A replied request queues behind the submitted ones.
        handle.stop().await.unwrap();

        let st = shared.read().await;
        assert!(st.cycle.is_none());
        let control: Vec<&str> = st
            .events
            .iter()
            .filter(|e| e.kind == EventKind::Control)
            .map(|e| e.detail.as_str())
            .collect();
        assert_eq!(control.len(), 4);
        assert!(control[0].contains("15"));
        assert!(control[2].contains("25"));
        assert_eq!(tail(&bus, 2), offs());
    }

    #[tokio::test(start_paused = true)]
    async fn handle_after_shutdown_is_unavailable() {
        let bus = RecordingBus::new();
        let handle = spawn(controller(&bus));

        handle.start(10.0).await.unwrap();
        handle.shutdown().await.unwrap();
        assert!(bus.was_disconnected());
        assert!(matches!(
            handle.start(10.0).await,
            Err(ControllerError::Unavailable)
        ));
    }
}
