//! Tasmota power commands for a MistBuddy.
//!
//! A pulse is two messages per relay: first `PulseTime` arms the device's
//! auto-off timer, then `POWER ON` closes the relay.  Tasmota reads PulseTime
//! values 1..=111 as tenths of a second and 112..=64900 as `value - 100`
//! seconds, so every timer we send is offset by 100 and clamped into the
//! seconds range.

/// Keyword that replaces the trailing `POWER` segment of a relay topic.
const TIMER_KEYWORD: &str = "PulseTime";

/// Fixed offset Tasmota subtracts from PulseTime values in the seconds range.
const PULSETIME_OFFSET: i64 = 100;

pub const PULSETIME_MIN: i64 = 112;
pub const PULSETIME_MAX: i64 = 64900;

/// One outbound MQTT message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PowerCommand {
    pub topic: String,
    pub payload: String,
}

impl PowerCommand {
    fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// PulseTime value for an on-duration of `seconds`.
///
/// Never fails: NaN and out-of-range inputs land on the nearest bound.
pub fn pulsetime_value(seconds: f64) -> i64 {
    // `as` saturates on overflow and maps NaN to 0.
    let whole = seconds.ceil() as i64;
    whole
        .saturating_add(PULSETIME_OFFSET)
        .clamp(PULSETIME_MIN, PULSETIME_MAX)
}

/// Swap the last `/`-separated segment of a relay topic for `PulseTime`,
/// e.g. `cmnd/mister/POWER` -> `cmnd/mister/PulseTime`.
pub fn timer_topic(power_topic: &str) -> String {
    match power_topic.rsplit_once('/') {
        Some((prefix, _)) => format!("{prefix}/{TIMER_KEYWORD}"),
        None => TIMER_KEYWORD.to_string(),
    }
}

/// Commands that switch every relay on for `seconds`, timer first.
pub fn encode_power_on(seconds: f64, power_topics: &[String]) -> Vec<PowerCommand> {
    let timer = pulsetime_value(seconds).to_string();
    power_topics
        .iter()
        .flat_map(|topic| {
            [
                PowerCommand::new(timer_topic(topic), timer.clone()),
                PowerCommand::new(topic.clone(), "ON"),
            ]
        })
        .collect()
}

/// Commands that switch every relay off immediately.
pub fn encode_power_off(power_topics: &[String]) -> Vec<PowerCommand> {
    power_topics
        .iter()
        .map(|topic| PowerCommand::new(topic.clone(), "OFF"))
        .collect()
}

// ===========================================================================
// Tests
// ===========================================================================
