use thiserror::Error;

use crate::bus::BusError;

/// Errors surfaced at the `start`/`stop` boundary of the controller.
///
/// Per-iteration failures inside a running cycle never reach this type; they
/// are logged and the loop keeps going.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Misting duration must leave an idle remainder inside the 60 s period.
    #[error("duration_on must be greater than 0 and less than 60 seconds, got {0}")]
    InvalidDuration(f64),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("message bus is not connected")]
    NotConnected,

    #[error("message bus error: {0}")]
    Bus(#[from] BusError),

    /// The control task has shut down and no longer accepts requests.
    #[error("controller is not running")]
    Unavailable,
}

impl ControllerError {
    /// Configuration errors are the caller's fault; everything else is a
    /// transport or lifecycle problem.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::InvalidDuration(_) | Self::Config(_))
    }
}
