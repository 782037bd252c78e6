use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    pub device: String,
    pub mqtt_connected: bool,
    pub cycle: Option<CycleInfo>,
    pub pulses: u64,
    pub skipped: u64,
    pub last_gate: Option<bool>,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Clone, Serialize)]
pub struct CycleInfo {
    pub duration_on: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub started: OffsetDateTime,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Control,
    Pulse,
    Status,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub device: String,
    pub mqtt_connected: bool,
    pub misting: bool,
    pub cycle: Option<CycleInfo>,
    pub pulses: u64,
    pub skipped: u64,
    pub last_gate: Option<bool>,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new(device: &str) -> Self {
        Self {
            started_at: Instant::now(),
            device: device.to_string(),
            mqtt_connected: false,
            cycle: None,
            pulses: 0,
            skipped: 0,
            last_gate: None,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn shared(device: &str) -> SharedState {
        Arc::new(RwLock::new(Self::new(device)))
    }

    /// Record a link state change; repeated reports of the same state are
    /// not logged as events.
    pub fn set_mqtt_connected(&mut self, connected: bool) {
        if self.mqtt_connected == connected {
            return;
        }
        self.mqtt_connected = connected;
        let detail = if connected {
            "mqtt connected"
        } else {
            "mqtt disconnected"
        };
        self.push_event(EventKind::System, detail.to_string());
    }

    pub fn record_cycle_started(&mut self, duration_on: f64) {
        self.cycle = Some(CycleInfo {
            duration_on,
            started: OffsetDateTime::now_utc(),
        });
        self.push_event(
            EventKind::Control,
            format!("misting started: {duration_on}s every minute"),
        );
    }

    pub fn record_cycle_stopped(&mut self, detail: String) {
        self.cycle = None;
        self.push_event(EventKind::Control, detail);
    }

    pub fn record_pulse(&mut self, duration_on: f64) {
        self.pulses += 1;
        self.push_event(EventKind::Pulse, format!("mist on for {duration_on}s"));
    }

    /// Record the light-status verdict for one iteration.
    pub fn record_gate(&mut self, satisfied: bool) {
        self.last_gate = Some(satisfied);
        if !satisfied {
            self.skipped += 1;
            self.push_event(
                EventKind::Status,
                "light status not satisfied; pulse skipped".to_string(),
            );
        }
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            device: self.device.clone(),
            mqtt_connected: self.mqtt_connected,
            misting: self.cycle.is_some(),
            cycle: self.cycle.clone(),
            pulses: self.pulses,
            skipped: self.skipped,
            last_gate: self.last_gate,
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================
