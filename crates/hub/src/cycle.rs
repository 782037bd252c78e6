//! Misting cycle: once a minute, optionally ask the grow light whether it is
//! on, then pulse the MistBuddy relays for `duration_on` seconds.
//!
//! The relays switch themselves off via Tasmota's PulseTime, so the loop only
//! ever publishes ON.  Final OFF on stop belongs to the controller, which
//! publishes it after the loop has fully exited.
//!
//! ## Lifecycle
//!
//! ```text
//! Idle ──[start, 0 < d < 60]──▶ Running ──[cancel]──▶ Cancelling ──▶ Stopped
//!  │                                                                   ▲
//!  └──────────────────────[start, d out of range]──────────────────────┘
//! ```
//!
//! ## One iteration
//!
//! ```text
//! gate? ──true/absent──▶ pulse ──▶ on-phase (d) ──▶ idle (60 - d) ──▶ repeat
//!   └────false─────────▶ skip ──────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::bus::MessageBus;
use crate::error::ControllerError;
use crate::pulse::encode_power_on;
use crate::state::SharedState;
use crate::status::StatusQuery;

/// Length of one misting period.
pub const PERIOD: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    Idle,
    Running,
    Cancelling,
    Stopped,
}

/// Collaborators a cycle publishes through.  Cheap to clone.
#[derive(Clone)]
pub struct CycleDeps {
    pub bus: Arc<dyn MessageBus>,
    pub power_topics: Arc<[String]>,
    pub status: Option<Arc<StatusQuery>>,
    pub shared: SharedState,
}

/// Handle to one misting loop.  A stopped cycle is never restarted; the
/// controller builds a fresh one for every start.  Dropping the handle
/// cancels the loop.
pub struct MistingCycle {
    duration_on: f64,
    deps: CycleDeps,
    phase: Arc<watch::Sender<CyclePhase>>,
    cancel: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

/// Misting must leave a non-zero idle remainder inside the period.
pub fn validate_duration(duration_on: f64) -> Result<(), ControllerError> {
    if duration_on.is_finite() && duration_on > 0.0 && duration_on < PERIOD.as_secs_f64() {
        Ok(())
    } else {
        Err(ControllerError::InvalidDuration(duration_on))
    }
}

impl MistingCycle {
    pub fn new(duration_on: f64, deps: CycleDeps) -> Self {
        let (phase, _) = watch::channel(CyclePhase::Idle);
        let (cancel, _) = watch::channel(false);
        Self {
            duration_on,
            deps,
            phase: Arc::new(phase),
            cancel,
            task: None,
        }
    }

    pub fn duration_on(&self) -> f64 {
        self.duration_on
    }

    pub fn phase(&self) -> CyclePhase {
        *self.phase.borrow()
    }

    /// Spawn the loop.  An out-of-range duration never reaches `Running`:
    /// the cycle goes straight to `Stopped` and the error is returned.
    pub fn start(&mut self) -> Result<(), ControllerError> {
        if self.phase() != CyclePhase::Idle {
            return Err(ControllerError::Config(
                "a misting cycle can only be started once".to_string(),
            ));
        }
        if let Err(e) = validate_duration(self.duration_on) {
            error!(duration_on = self.duration_on, "refusing to start misting cycle: {e}");
            self.phase.send_replace(CyclePhase::Stopped);
            return Err(e);
        }

        self.phase.send_replace(CyclePhase::Running);
        let task = tokio::spawn(run(
            self.duration_on,
            self.deps.clone(),
            self.cancel.subscribe(),
            Arc::clone(&self.phase),
        ));
        self.task = Some(task);
        Ok(())
    }

    /// Ask the loop to stop.  Returns immediately.
    pub fn cancel(&self) {
        if self.phase() == CyclePhase::Running {
            self.phase.send_replace(CyclePhase::Cancelling);
        }
        self.cancel.send_replace(true);
    }

    /// Cancel and wait up to `wait` for the loop to exit.  A loop that does
    /// not exit in time is aborted.  Returns `true` on a clean exit.
    pub async fn stop(&mut self, wait: Duration) -> bool {
        self.cancel();
        let Some(mut task) = self.task.take() else {
            self.phase.send_replace(CyclePhase::Stopped);
            return true;
        };

        let clean = match tokio::time::timeout(wait, &mut task).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!("misting cycle task failed: {e}");
                false
            }
            Err(_) => {
                warn!(?wait, "misting cycle did not exit in time; aborting");
                task.abort();
                let _ = task.await;
                false
            }
        };
        self.phase.send_replace(CyclePhase::Stopped);
        clean
    }
}

impl Drop for MistingCycle {
    fn drop(&mut self) {
        self.cancel.send_replace(true);
    }
}

// ---------------------------------------------------------------------------
// Loop
// ---------------------------------------------------------------------------

async fn run(
    duration_on: f64,
    deps: CycleDeps,
    mut cancel: watch::Receiver<bool>,
    phase: Arc<watch::Sender<CyclePhase>>,
) {
    let on_phase = Duration::from_secs_f64(duration_on);
    let idle = PERIOD.saturating_sub(on_phase);

    info!(
        duration_on,
        idle_sec = idle.as_secs_f64(),
        gated = deps.status.is_some(),
        relays = deps.power_topics.len(),
        "misting cycle started"
    );

    let mut iteration: u64 = 0;
    loop {
        if *cancel.borrow() {
            break;
        }
        iteration += 1;

        // ── Gate ─────────────────────────────────────────────────
        let admitted = match &deps.status {
            None => true,
            Some(status) => {
                let satisfied = tokio::select! {
                    biased;
                    _ = cancelled(&mut cancel) => break,
                    satisfied = status.check_status() => satisfied,
                };
                deps.shared.write().await.record_gate(satisfied);
                satisfied
            }
        };

        if *cancel.borrow() {
            break;
        }

        // ── Pulse or skip ────────────────────────────────────────
        if admitted {
            pulse(duration_on, &deps).await;
        } else {
            info!(iteration, "light is off; skipping pulse");
        }

        // ── Wait out the period ──────────────────────────────────
        debug!(iteration, on_sec = duration_on, idle_sec = idle.as_secs_f64(), "waiting for next period");
        if !pause(&mut cancel, on_phase).await || !pause(&mut cancel, idle).await {
            break;
        }
    }

    phase.send_replace(CyclePhase::Stopped);
    info!(iterations = iteration, "misting cycle cancelled");
}

/// Sleep for `d` unless cancelled first.  Returns `false` on cancellation.
async fn pause(cancel: &mut watch::Receiver<bool>, d: Duration) -> bool {
    tokio::select! {
        biased;
        _ = cancelled(cancel) => false,
        _ = sleep(d) => true,
    }
}

/// Resolves once cancellation is requested or the handle is gone.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    while !*cancel.borrow_and_update() {
        if cancel.changed().await.is_err() {
            return;
        }
    }
}

/// Publish one pulse, relay by relay.  A relay whose timer could not be set
/// is not switched on, so it can never be left on without an auto-off.
async fn pulse(duration_on: f64, deps: &CycleDeps) {
    if deps.power_topics.is_empty() {
        info!(duration_on, "(simulated) power ON");
        deps.shared.write().await.record_pulse(duration_on);
        return;
    }

    let commands = encode_power_on(duration_on, &deps.power_topics);
    let mut switched = 0_usize;
    for relay in commands.chunks(2) {
        let mut armed = true;
        for cmd in relay {
            if !armed {
                break;
            }
            if let Err(e) = deps.bus.publish(&cmd.topic, &cmd.payload).await {
                error!(topic = %cmd.topic, payload = %cmd.payload, "pulse publish failed: {e}");
                armed = false;
            }
        }
        if armed {
            switched += 1;
        }
    }

    if switched == deps.power_topics.len() {
        info!(duration_on, relays = switched, "mist ON");
    } else {
        warn!(
            duration_on,
            switched,
            relays = deps.power_topics.len(),
            "pulse only partly published"
        );
    }

    let mut st = deps.shared.write().await;
    if switched > 0 {
        st.record_pulse(duration_on);
    } else {
        st.record_error("pulse failed: no relay switched on".to_string());
    }
}

// ===========================================================================
// Tests
// ===========================================================================
