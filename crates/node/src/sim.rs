//! Tasmota-style device simulator for local development.
//!
//! Models the two kinds of device the hub talks to:
//! - relay plugs (`cmnd/<dev>/POWER`, `cmnd/<dev>/PulseTime`) that switch
//!   themselves off when a pulse timer runs out;
//! - a grow light whose on/off state is answered on request, driven by a
//!   [`Scenario`].
//!
//! Everything here is pure state; time is passed in so tests can drive it.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

/// PulseTime values at or above this are `value - 100` whole seconds; below
/// it they are tenths of a second.
const PULSETIME_SECONDS_FROM: u32 = 112;

/// Probability that a `Flaky` light ignores a status query.
const FLAKY_DROP_PROB: f32 = 0.3;

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Light behaviour selectable via `SIM_SCENARIO` env var.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Light always on; every query answers the on value.
    On,
    /// Light always off; the hub should skip every pulse.
    Off,
    /// Light toggles every cycle period, starting on.
    Cycle,
    /// Light on, but roughly a third of queries get no reply.  Exercises the
    /// hub's status timeout.
    Flaky,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "off" => Self::Off,
            "cycle" => Self::Cycle,
            "flaky" => Self::Flaky,
            _ => Self::On, // default
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::On => write!(f, "on"),
            Self::Off => write!(f, "off"),
            Self::Cycle => write!(f, "cycle"),
            Self::Flaky => write!(f, "flaky"),
        }
    }
}

// ---------------------------------------------------------------------------
// PulseTime
// ---------------------------------------------------------------------------

/// Decode a Tasmota PulseTime value.  `0` disables the timer.
pub fn pulse_duration(value: u32) -> Option<Duration> {
    match value {
        0 => None,
        v if v < PULSETIME_SECONDS_FROM => Some(Duration::from_millis(u64::from(v) * 100)),
        v => Some(Duration::from_secs(u64::from(v - 100))),
    }
}

// ---------------------------------------------------------------------------
// Relays
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Relay {
    on: bool,
    pulse: Option<Duration>,
    off_at: Option<Instant>,
}

/// A state change to report on `stat/<device>/POWER`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PowerReport {
    pub device: String,
    pub on: bool,
}

impl PowerReport {
    pub fn topic(&self) -> String {
        format!("stat/{}/POWER", self.device)
    }

    pub fn payload(&self) -> &'static str {
        if self.on {
            "ON"
        } else {
            "OFF"
        }
    }
}

/// Every relay seen so far, keyed by device name.
#[derive(Debug, Default)]
pub struct RelayBank {
    relays: BTreeMap<String, Relay>,
}

impl RelayBank {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one `cmnd/<device>/<command>` message.  Returns the report to
    /// publish when the relay changed state.
    pub fn handle(&mut self, topic: &str, payload: &str, now: Instant) -> Option<PowerReport> {
        let (device, command) = parse_command_topic(topic)?;
        let relay = self.relays.entry(device.to_string()).or_default();
        let payload = payload.trim();

        match command {
            "PulseTime" => {
                match payload.parse::<u32>() {
                    Ok(v) => {
                        relay.pulse = pulse_duration(v);
                        tracing::debug!(device, value = v, pulse = ?relay.pulse, "pulse time set");
                    }
                    Err(_) => tracing::warn!(device, payload, "bad PulseTime value (ignored)"),
                }
                None
            }
            "POWER" => {
                let on = match payload.to_ascii_uppercase().as_str() {
                    "ON" | "1" => true,
                    "OFF" | "0" => false,
                    "TOGGLE" | "2" => !relay.on,
                    _ => {
                        tracing::warn!(device, payload, "bad POWER value (ignored)");
                        return None;
                    }
                };
                relay.off_at = if on {
                    relay.pulse.map(|p| now + p)
                } else {
                    None
                };
                let changed = relay.on != on;
                relay.on = on;
                changed.then(|| PowerReport {
                    device: device.to_string(),
                    on,
                })
            }
            _ => None,
        }
    }

    /// Switch off every relay whose pulse ran out by `now`.
    pub fn expire(&mut self, now: Instant) -> Vec<PowerReport> {
        let mut reports = Vec::new();
        for (device, relay) in &mut self.relays {
            if relay.off_at.is_some_and(|t| t <= now) {
                relay.on = false;
                relay.off_at = None;
                reports.push(PowerReport {
                    device: device.clone(),
                    on: false,
                });
            }
        }
        reports
    }

    #[cfg(test)]
    pub fn is_on(&self, device: &str) -> bool {
        self.relays.get(device).is_some_and(|r| r.on)
    }
}

/// Split `cmnd/<device>/<command>` into its parts.
fn parse_command_topic(topic: &str) -> Option<(&str, &str)> {
    let mut parts = topic.split('/');
    let (_prefix, device, command) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() || device.is_empty() {
        return None;
    }
    Some((device, command))
}

// ---------------------------------------------------------------------------
// Light
// ---------------------------------------------------------------------------

/// The grow light the hub gates on.
pub struct LightSim {
    scenario: Scenario,
    key: String,
    on_value: i64,
    cycle_period: Duration,
    started: Instant,
}

impl LightSim {
    pub fn new(
        scenario: Scenario,
        key: impl Into<String>,
        on_value: i64,
        cycle_period: Duration,
        started: Instant,
    ) -> Self {
        Self {
            scenario,
            key: key.into(),
            on_value,
            cycle_period: cycle_period.max(Duration::from_secs(1)),
            started,
        }
    }

    pub fn is_on(&self, now: Instant) -> bool {
        match self.scenario {
            Scenario::On | Scenario::Flaky => true,
            Scenario::Off => false,
            Scenario::Cycle => {
                let elapsed = now.saturating_duration_since(self.started);
                (elapsed.as_secs() / self.cycle_period.as_secs()) % 2 == 0
            }
        }
    }

    /// Reply payload for one status query, or `None` when the simulated
    /// device stays silent.
    pub fn answer(&self, now: Instant) -> Option<String> {
        if self.scenario == Scenario::Flaky && fastrand::f32() < FLAKY_DROP_PROB {
            return None;
        }
        let value = if self.is_on(now) {
            self.on_value
        } else if self.on_value == 0 {
            1
        } else {
            0
        };
        let mut reply = serde_json::Map::new();
        reply.insert(self.key.clone(), value.into());
        Some(serde_json::Value::Object(reply).to_string())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
