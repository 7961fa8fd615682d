//! Realtime conversation delivery.
//!
//! SYSTEM CONTEXT
//! ==============
//! [`RealtimeTransport`] multiplexes any number of conversation subscriptions
//! over one push connection, reconnects with bounded exponential backoff, and
//! degrades to interval polling when push is unavailable. The two network
//! seams, [`PushConnector`] and [`MessagePoller`], keep the state machine
//! testable without sockets.

pub mod backoff;
pub mod poll;
pub mod push;
pub mod transport;
pub mod types;

pub use backoff::reconnect_delay;
pub use poll::{HttpPoller, MessagePoller};
pub use push::{PushChannel, PushConnector, WsConnector, ws_url};
pub use transport::{MessageHandler, RealtimeTransport, Subscription, TypingHandler};
pub use types::{DeliveryMode, TransportError, TransportEvent};
