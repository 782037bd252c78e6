//! Light-status gate: one request/response round trip over MQTT.
//!
//! A query is an empty publish to the device's query topic (Tasmota answers
//! `cmnd/<dev>/Mem1` on `stat/<dev>/RESULT` with `{"Mem1":"1"}`).  The reply
//! arrives on the network task, which calls [`StatusQuery::resolve`]; the
//! waiting cycle is woken through a oneshot channel parked in a single
//! correlation slot.
//!
//! ```text
//! check_status ── claim slot ── publish query ── await reply | timeout ── clear slot
//!                     │                               ▲
//!                     └── (busy → false)              └── resolve() from the bus task
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::bus::MessageBus;
use crate::config::StatusGateConfig;
use crate::mqtt::parse_status_value;

/// How a single round trip ended.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusOutcome {
    /// Reply parsed; the integer found under the configured key.
    Value(i64),
    /// Reply arrived but was malformed, lacked the key, or was non-numeric.
    ParseError(String),
    /// No reply within the deadline.
    Timeout,
    /// The query could not be published.
    PublishFailed,
    /// Another query was already outstanding; nothing was sent.
    Busy,
}

impl StatusOutcome {
    pub fn is_satisfied(&self, on_value: i64) -> bool {
        matches!(self, Self::Value(v) if *v == on_value)
    }
}

/// The one outstanding request.  `reply` is taken by whichever inbound
/// message arrives first; the slot itself lives until the querying side
/// clears it.
struct PendingStatusRequest {
    reply: Option<oneshot::Sender<Vec<u8>>>,
}

type Slot = Mutex<Option<PendingStatusRequest>>;

/// Clears the correlation slot when the round trip ends, including when the
/// querying future is dropped mid-wait by a cycle being cancelled.
struct SlotGuard<'a> {
    slot: &'a Slot,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

pub struct StatusQuery {
    bus: Arc<dyn MessageBus>,
    query_topic: String,
    reply_topic: String,
    key: String,
    on_value: i64,
    timeout: Duration,
    pending: Slot,
}

impl StatusQuery {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        query_topic: impl Into<String>,
        reply_topic: impl Into<String>,
        key: impl Into<String>,
        on_value: i64,
        timeout: Duration,
    ) -> Self {
        Self {
            bus,
            query_topic: query_topic.into(),
            reply_topic: reply_topic.into(),
            key: key.into(),
            on_value,
            timeout,
            pending: Mutex::new(None),
        }
    }

    pub fn from_config(bus: Arc<dyn MessageBus>, cfg: &StatusGateConfig) -> Self {
        Self::new(
            bus,
            &cfg.query_topic,
            &cfg.reply_topic,
            &cfg.key,
            cfg.on_value,
            cfg.timeout(),
        )
    }

    pub fn reply_topic(&self) -> &str {
        &self.reply_topic
    }

    #[cfg(test)]
    pub fn is_pending(&self) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// True only when the device replied in time with exactly `on_value`.
    pub async fn check_status(&self) -> bool {
        let outcome = self.query().await;
        let satisfied = outcome.is_satisfied(self.on_value);
        match &outcome {
            StatusOutcome::Value(v) => {
                info!(topic = %self.query_topic, key = %self.key, value = v, satisfied, "status reply")
            }
            StatusOutcome::ParseError(msg) => {
                warn!(topic = %self.reply_topic, "status reply unusable: {msg}")
            }
            StatusOutcome::Timeout => {
                warn!(topic = %self.query_topic, timeout = ?self.timeout, "status query timed out")
            }
            StatusOutcome::PublishFailed | StatusOutcome::Busy => {}
        }
        satisfied
    }

    /// One round trip.  Never issues a second request while one is pending.
    pub async fn query(&self) -> StatusOutcome {
        let Some(rx) = self.claim() else {
            warn!(topic = %self.query_topic, "status query already pending; treating as not satisfied");
            return StatusOutcome::Busy;
        };
        let _clear = SlotGuard {
            slot: &self.pending,
        };

        if let Err(e) = self.bus.publish(&self.query_topic, "").await {
            warn!(topic = %self.query_topic, "status query publish failed: {e}");
            return StatusOutcome::PublishFailed;
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(payload)) => match parse_status_value(&payload, &self.key) {
                Ok(v) => StatusOutcome::Value(v),
                Err(msg) => StatusOutcome::ParseError(msg),
            },
            // Sender dropped without a reply; only a cleared slot does that.
            Ok(Err(_)) => StatusOutcome::Timeout,
            Err(_) => StatusOutcome::Timeout,
        }
    }

    /// Deliver a reply payload.  Safe to call from any thread; a reply with
    /// no outstanding request is dropped.
    pub fn resolve(&self, payload: &[u8]) -> bool {
        let tx = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_mut()
            .and_then(|p| p.reply.take());
        match tx {
            Some(tx) => tx.send(payload.to_vec()).is_ok(),
            None => {
                debug!(topic = %self.reply_topic, "status reply with no pending query (ignored)");
                false
            }
        }
    }

    fn claim(&self) -> Option<oneshot::Receiver<Vec<u8>>> {
        let mut slot = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        *slot = Some(PendingStatusRequest { reply: Some(tx) });
        Some(rx)
    }
}

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------


// ===========================================================================
// Tests
// ===========================================================================
