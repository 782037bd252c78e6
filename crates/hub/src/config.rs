//! TOML config file loading, environment overrides, and validation for the
//! broker connection and the MistBuddy device.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::env;
use std::time::Duration;

use rumqttc::{has_wildcards, valid_filter};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub broker: BrokerConfig,
    pub device: DeviceConfig,
    #[serde(default)]
    pub web: WebConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            client_id: "mistbuddy-hub".to_string(),
            keep_alive_secs: 30,
            connect_timeout_secs: 10,
        }
    }
}

/// Everything the controller needs to drive one MistBuddy.  Immutable once
/// loaded.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    #[serde(default = "default_device_name")]
    pub name: String,
    /// Inbound topic carrying duration commands (`>0` start, `0` stop).
    pub control_topic: String,
    /// Tasmota `.../POWER` topics, e.g. the fan and the mister plug.
    #[serde(default)]
    pub power_topics: Vec<String>,
    /// Allow an empty `power_topics` list and only log power changes.
    #[serde(default)]
    pub simulate: bool,
    /// Light-status gate.  Absent means every cycle pulses.
    #[serde(default)]
    pub status: Option<StatusGateConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusGateConfig {
    pub query_topic: String,
    pub reply_topic: String,
    #[serde(default = "default_status_key")]
    pub key: String,
    #[serde(default = "default_on_value")]
    pub on_value: i64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: f64,
}

impl StatusGateConfig {
    /// Round-trip deadline.  Only meaningful after validation.
    pub fn timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.timeout_secs).unwrap_or(Duration::ZERO)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

fn default_device_name() -> String {
    "mistbuddy".to_string()
}

fn default_status_key() -> String {
    "Mem1".to_string()
}

fn default_on_value() -> i64 {
    1
}

fn default_timeout_secs() -> f64 {
    5.0
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_broker(&mut errors);
        self.device.collect_errors(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_broker(&self, errors: &mut Vec<String>) {
        let b = &self.broker;
        if b.host.trim().is_empty() {
            errors.push("broker: host is empty".to_string());
        }
        if b.port == 0 {
            errors.push("broker: port must be non-zero".to_string());
        }
        if b.client_id.trim().is_empty() {
            errors.push("broker: client_id is empty".to_string());
        }
        if b.connect_timeout_secs == 0 {
            errors.push("broker: connect_timeout_secs must be positive".to_string());
        }
    }

    /// Override broker and web settings from `MQTT_HOST`, `MQTT_PORT` and
    /// `WEB_PORT` when they are set.
    pub fn apply_env(&mut self) {
        if let Ok(host) = env::var("MQTT_HOST") {
            self.broker.host = host;
        }
        if let Some(port) = env::var("MQTT_PORT").ok().and_then(|s| s.parse().ok()) {
            self.broker.port = port;
        }
        if let Some(port) = env::var("WEB_PORT").ok().and_then(|s| s.parse().ok()) {
            self.web.port = port;
        }
    }
}

impl DeviceConfig {
    /// The single validation path for device settings, shared by config
    /// loading and controller construction.
    pub fn validate(&self) -> std::result::Result<(), String> {
        let mut errors = Vec::new();
        self.collect_errors(&mut errors);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.join("; "))
        }
    }

    fn collect_errors(&self, errors: &mut Vec<String>) {
        let ctx = format!("device '{}'", self.name);

        // ── Control topic ───────────────────────────────────
        if self.control_topic.trim().is_empty() {
            errors.push(format!("{ctx}: control_topic is empty"));
        } else if has_wildcards(&self.control_topic) {
            errors.push(format!(
                "{ctx}: control_topic '{}' must not contain wildcards",
                self.control_topic
            ));
        }

        // ── Power topics ────────────────────────────────────
        if self.power_topics.is_empty() && !self.simulate {
            errors.push(format!(
                "{ctx}: power_topics is empty (set simulate = true to run without hardware)"
            ));
        }
        let mut seen: HashSet<&str> = HashSet::new();
        for topic in &self.power_topics {
            if topic.trim().is_empty() {
                errors.push(format!("{ctx}: power topic is empty"));
            } else if has_wildcards(topic) {
                errors.push(format!(
                    "{ctx}: power topic '{topic}' must not contain wildcards"
                ));
            } else if !seen.insert(topic) {
                errors.push(format!("{ctx}: duplicate power topic '{topic}'"));
            }
        }

        // ── Status gate ─────────────────────────────────────
        if let Some(status) = &self.status {
            if status.query_topic.trim().is_empty() {
                errors.push(format!("{ctx}: status.query_topic is empty"));
            } else if has_wildcards(&status.query_topic) {
                errors.push(format!(
                    "{ctx}: status.query_topic '{}' must not contain wildcards",
                    status.query_topic
                ));
            }
            if status.reply_topic.trim().is_empty() {
                errors.push(format!("{ctx}: status.reply_topic is empty"));
            } else if !valid_filter(&status.reply_topic) {
                errors.push(format!(
                    "{ctx}: status.reply_topic '{}' is not a valid topic filter",
                    status.reply_topic
                ));
            }
            if status.key.trim().is_empty() {
                errors.push(format!("{ctx}: status.key is empty"));
            }
            if !status.timeout_secs.is_finite() || status.timeout_secs <= 0.0 {
                errors.push(format!(
                    "{ctx}: status.timeout_secs must be positive, got {}",
                    status.timeout_secs
                ));
            } else if Duration::try_from_secs_f64(status.timeout_secs).is_err() {
                errors.push(format!(
                    "{ctx}: status.timeout_secs {} is too large",
                    status.timeout_secs
                ));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Parse and validate config text.  Environment overrides are applied before
/// validation so a bad `MQTT_PORT` is reported like a bad file value.
pub fn parse(contents: &str, origin: &str) -> Result<Config> {
    let mut config: Config =
        toml::from_str(contents).with_context(|| format!("failed to parse config: {origin}"))?;
    config.apply_env();
    config
        .validate()
        .with_context(|| format!("invalid config: {origin}"))?;
    Ok(config)
}

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config = parse(&contents, path)?;

    tracing::info!(
        path,
        device = %config.device.name,
        power_topics = config.device.power_topics.len(),
        gated = config.device.status.is_some(),
        "config loaded"
    );

    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -- Helper: build a valid baseline config that passes validation ------

    fn valid_device() -> DeviceConfig {
        DeviceConfig {
            name: "tent_one".into(),
            control_topic: "mistbuddy/tent_one/set".into(),
            power_topics: vec![
                "cmnd/mistbuddy_fan/POWER".into(),
                "cmnd/mistbuddy_mister/POWER".into(),
            ],
            simulate: false,
            status: Some(valid_status()),
        }
    }

    fn valid_status() -> StatusGateConfig {
        StatusGateConfig {
            query_topic: "cmnd/growlight/Mem1".into(),
            reply_topic: "stat/growlight/RESULT".into(),
            key: "Mem1".into(),
            on_value: 1,
            timeout_secs: 5.0,
        }
    }

    fn valid_config() -> Config {
        Config {
            broker: BrokerConfig::default(),
            device: valid_device(),
            web: WebConfig::default(),
        }
    }

    fn assert_error_contains(config: &Config, needle: &str) {
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains(needle), "expected '{needle}' in: {err}");
    }

    // -- Baseline -----------------------------------------------------------

    #[test]
    fn valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn status_gate_is_optional() {
        let mut c = valid_config();
        c.device.status = None;
        assert!(c.validate().is_ok());
    }

    // -- Control topic ------------------------------------------------------

    #[test]
    fn empty_control_topic_rejected() {
        let mut c = valid_config();
        c.device.control_topic = "  ".into();
        assert_error_contains(&c, "control_topic is empty");
    }

    #[test]
    fn wildcard_control_topic_rejected() {
        let mut c = valid_config();
        c.device.control_topic = "mistbuddy/+/set".into();
        assert_error_contains(&c, "must not contain wildcards");
    }

    // -- Power topics -------------------------------------------------------

    #[test]
    fn empty_power_topics_rejected_without_simulate() {
        let mut c = valid_config();
        c.device.power_topics.clear();
        assert_error_contains(&c, "power_topics is empty");
    }

    #[test]
    fn empty_power_topics_allowed_when_simulating() {
        let mut c = valid_config();
        c.device.power_topics.clear();
        c.device.simulate = true;
        assert!(c.validate().is_ok());
    }

    #[test]
    fn duplicate_power_topic_rejected() {
        let mut c = valid_config();
        c.device.power_topics.push("cmnd/mistbuddy_fan/POWER".into());
        assert_error_contains(&c, "duplicate power topic");
    }

    #[test]
    fn wildcard_power_topic_rejected() {
        let mut c = valid_config();
        c.device.power_topics = vec!["cmnd/#".into()];
        assert_error_contains(&c, "'cmnd/#' must not contain wildcards");
    }

    // -- Status gate --------------------------------------------------------

    #[test]
    fn non_positive_status_timeout_rejected() {
        let mut c = valid_config();
        c.device.status.as_mut().unwrap().timeout_secs = 0.0;
        assert_error_contains(&c, "timeout_secs must be positive");
    }

    #[test]
    fn nan_status_timeout_rejected() {
        let mut c = valid_config();
        c.device.status.as_mut().unwrap().timeout_secs = f64::NAN;
        assert_error_contains(&c, "timeout_secs must be positive");
    }

    #[test]
    fn huge_status_timeout_rejected() {
        let mut c = valid_config();
        c.device.status.as_mut().unwrap().timeout_secs = 1e20;
        assert_error_contains(&c, "is too large");
        assert_eq!(c.device.status.unwrap().timeout(), Duration::ZERO);
    }

    #[test]
    fn empty_status_key_rejected() {
        let mut c = valid_config();
        c.device.status.as_mut().unwrap().key = "".into();
        assert_error_contains(&c, "status.key is empty");
    }

    #[test]
    fn reply_topic_may_use_wildcards() {
        let mut c = valid_config();
        c.device.status.as_mut().unwrap().reply_topic = "stat/growlight/+".into();
        assert!(c.validate().is_ok());
    }

    #[test]
    fn invalid_reply_filter_rejected() {
        let mut c = valid_config();
        c.device.status.as_mut().unwrap().reply_topic = "stat/#/RESULT".into();
        assert_error_contains(&c, "not a valid topic filter");
    }

    // -- Broker -------------------------------------------------------------

    #[test]
    fn zero_port_rejected() {
        let mut c = valid_config();
        c.broker.port = 0;
        assert_error_contains(&c, "port must be non-zero");
    }

    #[test]
    fn all_errors_reported_together() {
        let mut c = valid_config();
        c.broker.client_id = "".into();
        c.device.control_topic = "".into();
        c.device.power_topics.clear();
        let err = c.validate().unwrap_err().to_string();
        assert!(err.contains("3 errors"), "got: {err}");
    }

    #[test]
    fn device_validate_shares_rules() {
        let mut d = valid_device();
        assert!(d.validate().is_ok());
        d.power_topics.clear();
        assert!(d.validate().unwrap_err().contains("power_topics is empty"));
    }

    // -- TOML parsing -------------------------------------------------------

    #[test]
    fn parse_full_file() {
        let toml = r#"
            [broker]
            host = "gus.local"
            port = 1884

            [device]
            name = "tent_one"
            control_topic = "mistbuddy/tent_one/set"
            power_topics = ["cmnd/mistbuddy_fan/POWER", "cmnd/mistbuddy_mister/POWER"]

            [device.status]
            query_topic = "cmnd/growlight/Mem1"
            reply_topic = "stat/growlight/RESULT"
            timeout_secs = 2.5

            [web]
            port = 9000
        "#;
        let c: Config = toml::from_str(toml).unwrap();
        assert!(c.validate().is_ok());
        assert_eq!(c.broker.host, "gus.local");
        assert_eq!(c.broker.port, 1884);
        assert_eq!(c.broker.client_id, "mistbuddy-hub");
        assert_eq!(c.device.power_topics.len(), 2);
        let status = c.device.status.unwrap();
        assert_eq!(status.key, "Mem1");
        assert_eq!(status.on_value, 1);
        assert_eq!(status.timeout(), Duration::from_millis(2500));
        assert_eq!(c.web.port, 9000);
    }

    #[test]
    fn parse_minimal_file_uses_defaults() {
        let toml = r#"
            [device]
            control_topic = "mistbuddy/set"
            simulate = true
        "#;
        let c: Config = toml::from_str(toml).unwrap();
        assert!(c.validate().is_ok());
        assert_eq!(c.device.name, "mistbuddy");
        assert!(c.device.status.is_none());
        assert_eq!(c.broker.port, 1883);
        assert_eq!(c.web.port, 8080);
    }

    #[test]
    fn sample_config_is_valid() {
        let c: Config = toml::from_str(include_str!("../../../config.toml")).unwrap();
        assert!(c.validate().is_ok());
        assert_eq!(c.device.power_topics.len(), 2);
        assert!(c.device.status.is_some());
    }

    #[test]
    fn parse_missing_device_section_fails() {
        assert!(toml::from_str::<Config>("[broker]\nport = 1883\n").is_err());
    }

    #[test]
    fn parse_reports_validation_errors() {
        let toml = r#"
            [device]
            control_topic = "mistbuddy/set"
        "#;
        let err = format!("{:#}", parse(toml, "inline").unwrap_err());
        assert!(err.contains("power_topics is empty"), "got: {err}");
    }

    #[test]
    fn load_missing_file_fails() {
        let err = load("/nonexistent/mistbuddy.toml").unwrap_err().to_string();
        assert!(err.contains("failed to read config"), "got: {err}");
    }
}
