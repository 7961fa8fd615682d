//! Embeddable chat widget: view state, conversation endpoints and the
//! controller that drives them.
//!
//! SYSTEM CONTEXT
//! ==============
//! Top of the stack. The embedding page calls into [`WidgetController`] and
//! renders [`WidgetState`]; sessions and delivery live in
//! [`crate::session`] and [`crate::realtime`].

pub mod api;
pub mod controller;
pub mod state;

pub use api::{ConversationApi, HttpConversationApi};
pub use controller::{HttpTransportFactory, RenderHook, TransportFactory, WidgetController, WidgetError};
pub use state::{ConversationSummary, DirectoryUser, View, WidgetState, needs_prechat, resolve_initial_view};
