//! Error taxonomy for the event publisher/subscriber.

use bt_core::BtError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EventError {
    /// The publisher is currently disconnected and has refused a send.
    /// Callers treat this as non-fatal and log a warning.
    #[error("publisher disconnected")]
    Disconnected,

    #[error("amqp transport error: {0}")]
    Transport(String),

    #[error("failed to encode event payload: {0}")]
    Encoding(String),
}

impl From<lapin::Error> for EventError {
    fn from(err: lapin::Error) -> Self {
        EventError::Transport(err.to_string())
    }
}

impl From<EventError> for BtError {
    fn from(err: EventError) -> Self {
        BtError::Infrastructure(err.to_string())
    }
}
