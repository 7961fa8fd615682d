//! # convo-widget
//!
//! Client side of an embeddable chat widget. Visitors get an anonymous,
//! fingerprinted session, conversations are delivered over a WebSocket push
//! channel that falls back to interval polling, and a controller drives the
//! widget's views from those two layers.
//!
//! The crate never installs a `tracing` subscriber; binaries such as the
//! bundled CLI do that.

pub mod config;
pub mod http;
pub mod realtime;
pub mod session;
pub mod widget;

pub use config::{ApiConfig, ConfigError, PageContext, PrechatRequirements, TransportConfig, WidgetConfig};
pub use envelopes;
pub use http::{ApiClient, ApiError};
pub use realtime::{DeliveryMode, RealtimeTransport, Subscription, TransportError, TransportEvent};
pub use session::{AnonymousSession, SessionError, SessionManager, UserInfo};
pub use widget::{View, WidgetController, WidgetError, WidgetState};
