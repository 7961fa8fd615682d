//! Shared transport types: delivery mode, lifecycle events, errors.

use std::time::Duration;

use crate::http::ApiError;

/// The single authoritative delivery state of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    /// No subscriptions and nothing running.
    #[default]
    Idle,
    /// A push connect or reconnect is in flight.
    Connecting,
    Connected,
    /// Interval polling; push is not in use.
    Polling,
}

/// Lifecycle notifications published on [`super::RealtimeTransport::events`].
///
/// Purely observational. Nothing here needs handling for delivery to work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    ModeChanged(DeliveryMode),
    /// The push channel closed without a local teardown.
    Disconnected,
    ReconnectScheduled { attempt: u32, delay: Duration },
    /// The reconnect budget ran out; polling for the rest of this transport's life.
    PushExhausted,
    PollFailed { conversation_id: String, consecutive_failures: u32 },
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid push URL: {0}")]
    InvalidUrl(String),
    #[error("push connect failed: {0}")]
    Connect(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("push channel closed")]
    Closed,
    #[error(transparent)]
    Api(#[from] ApiError),
}
