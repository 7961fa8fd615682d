//! Widget view state machine.
//!
//! SYSTEM CONTEXT
//! ==============
//! The controller sits between the embedding page and the two lower layers.
//! Intent flows down (open, pre-chat, search, select, send) into the session
//! manager, the conversation API and the realtime transport. Delivery flows up
//! from transport callbacks into [`WidgetState`], then out through the render
//! hook.
//!
//! DESIGN
//! ======
//! - `Core` (state plus render hook) is shared with transport callbacks through
//!   a `Weak`, so a dropped controller stops reacting to late deliveries.
//! - Every mutation recomputes derived fields and renders a snapshot taken
//!   after the state lock is released; the hook may call back into
//!   [`WidgetController::state`].
//! - The transport is created lazily once a session exists and rebuilt when
//!   the session id changes.
//!
//! ERROR HANDLING
//! ==============
//! Failures are written to `WidgetState::error` for the presentation layer
//! and also returned to the caller. Transport problems never reach here.

#[cfg(test)]
#[path = "controller_test.rs"]
mod controller_test;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use envelopes::{ChatMessage, TypingIndicator};
use tracing::{debug, info, warn};

use super::api::{ConversationApi, HttpConversationApi};
use super::state::{View, WidgetState, needs_prechat, resolve_initial_view};
use crate::config::{PrechatRequirements, TransportConfig, WidgetConfig};
use crate::http::{ApiClient, ApiError};
use crate::realtime::{DeliveryMode, RealtimeTransport, Subscription};
use crate::session::{AnonymousSession, SessionError, SessionManager, UserInfo};

pub type RenderHook = Arc<dyn Fn(&WidgetState) + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum WidgetError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("no active session")]
    NoSession,
    #[error("no conversation selected")]
    NoConversation,
    #[error("unknown conversation {0}")]
    UnknownConversation(String),
}

/// Builds the transport for a session.
pub trait TransportFactory: Send + Sync {
    fn create(&self, session_id: &str) -> RealtimeTransport;
}

/// WebSocket push with HTTP polling fallback.
#[derive(Debug, Clone)]
pub struct HttpTransportFactory {
    client: ApiClient,
    config: TransportConfig,
}

impl HttpTransportFactory {
    #[must_use]
    pub fn new(client: ApiClient, config: TransportConfig) -> Self {
        Self { client, config }
    }
}

impl TransportFactory for HttpTransportFactory {
    fn create(&self, session_id: &str) -> RealtimeTransport {
        RealtimeTransport::over_http(self.client.clone(), session_id, self.config)
    }
}

// =============================================================================
// CORE
// =============================================================================

struct Core {
    state: Mutex<WidgetState>,
    render: Option<RenderHook>,
}

impl Core {
    fn lock(&self) -> MutexGuard<'_, WidgetState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mutate, recompute derived fields, render.
    fn update<R>(&self, f: impl FnOnce(&mut WidgetState) -> R) -> R {
        let (result, snapshot) = {
            let mut state = self.lock();
            let result = f(&mut state);
            state.recompute_unread();
            (result, self.render.is_some().then(|| state.clone()))
        };
        if let (Some(render), Some(snapshot)) = (&self.render, snapshot) {
            render(&snapshot);
        }
        result
    }

    fn on_message(&self, message: ChatMessage) {
        debug!(conversation_id = %message.conversation_id, message_id = %message.id, "message delivered");
        self.update(|state| state.apply_incoming(message));
    }

    fn on_typing(&self, indicator: TypingIndicator) {
        self.update(|state| state.apply_typing(indicator));
    }
}

// =============================================================================
// CONTROLLER
// =============================================================================

pub struct WidgetController {
    prechat: PrechatRequirements,
    target_user_id: Option<String>,
    sessions: Arc<SessionManager>,
    api: Arc<dyn ConversationApi>,
    transports: Arc<dyn TransportFactory>,
    core: Arc<Core>,
    transport: Mutex<Option<RealtimeTransport>>,
    subscriptions: Mutex<HashMap<String, Subscription>>,
}

impl WidgetController {
    pub fn new(
        prechat: PrechatRequirements,
        target_user_id: Option<String>,
        sessions: Arc<SessionManager>,
        api: Arc<dyn ConversationApi>,
        transports: Arc<dyn TransportFactory>,
    ) -> Self {
        Self {
            prechat,
            target_user_id,
            sessions,
            api,
            transports,
            core: Arc::new(Core { state: Mutex::new(WidgetState::default()), render: None }),
            transport: Mutex::new(None),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// HTTP-backed controller for `config`.
    ///
    /// # Errors
    ///
    /// Fails when the API base is unusable or the storage directory cannot be
    /// created.
    pub fn from_config(config: &WidgetConfig) -> Result<Self, WidgetError> {
        let client = ApiClient::new(&config.api)?;
        let sessions = Arc::new(SessionManager::from_config(config)?);
        Ok(Self::new(
            config.prechat,
            config.target_user_id.clone(),
            sessions,
            Arc::new(HttpConversationApi::new(client.clone())),
            Arc::new(HttpTransportFactory::new(client, config.transport)),
        ))
    }

    /// Call `hook` with the new state after every change.
    #[must_use]
    pub fn with_render_hook(mut self, hook: impl Fn(&WidgetState) + Send + Sync + 'static) -> Self {
        let state = self.core.lock().clone();
        self.core = Arc::new(Core { state: Mutex::new(state), render: Some(Arc::new(hook)) });
        self
    }

    #[must_use]
    pub fn state(&self) -> WidgetState {
        self.core.lock().clone()
    }

    /// Delivery mode of the live transport, if one exists.
    #[must_use]
    pub fn delivery_mode(&self) -> Option<DeliveryMode> {
        self.transport_guard().as_ref().map(RealtimeTransport::mode)
    }

    // -------------------------------------------------------------------------
    // Open / close
    // -------------------------------------------------------------------------

    /// Show the widget, establishing a session on first open.
    ///
    /// # Errors
    ///
    /// Returns [`WidgetError::Session`] when no session can be established.
    pub async fn open(&self) -> Result<(), WidgetError> {
        let existing = self.core.update(|state| {
            state.is_open = true;
            state.session.clone()
        });
        let session = match existing {
            Some(session) => session,
            None => {
                self.core.update(|state| {
                    state.is_loading = true;
                    state.error = None;
                });
                match self.sessions.get_or_create_session().await {
                    Ok(session) => session,
                    Err(e) => return Err(self.fail(e.into())),
                }
            }
        };
        self.ensure_transport(&session.session_id);

        let view = self.core.update(|state| {
            state.session = Some(session.clone());
            state.is_loading = false;
            state.view = self.resume_view(state);
            state.view
        });
        info!(?view, session_id = %session.session_id, "widget opened");
        if view == View::Conversations {
            self.load_conversations().await?;
        }
        Ok(())
    }

    /// Hide the widget. Subscriptions stay live so unread counts keep moving.
    pub fn close(&self) {
        self.core.update(|state| {
            state.is_open = false;
            state.view = View::Closed;
        });
    }

    /// # Errors
    ///
    /// See [`Self::open`].
    pub async fn toggle(&self) -> Result<(), WidgetError> {
        if self.core.lock().is_open {
            self.close();
            Ok(())
        } else {
            self.open().await
        }
    }

    // -------------------------------------------------------------------------
    // Pre-chat / search
    // -------------------------------------------------------------------------

    /// Send pre-chat details, then re-run initial view selection.
    ///
    /// # Errors
    ///
    /// Returns [`WidgetError::Session`] when the update is rejected; the
    /// widget stays on the pre-chat form.
    pub async fn submit_prechat(&self, info: UserInfo) -> Result<(), WidgetError> {
        self.core.update(|state| {
            state.is_loading = true;
            state.error = None;
        });
        let session = match self.sessions.update_user_info(&info).await {
            Ok(session) => session,
            Err(e) => return Err(self.fail(e.into())),
        };
        let view = self.core.update(|state| {
            state.session = Some(session.clone());
            state.is_loading = false;
            state.view = resolve_initial_view(self.prechat, self.target_user_id.as_deref(), Some(&session));
            state.view
        });
        if view == View::Conversations {
            self.load_conversations().await?;
        }
        Ok(())
    }

    /// Directory search. A blank query clears the results without a request.
    ///
    /// # Errors
    ///
    /// Returns [`WidgetError::NoSession`] before a session exists and
    /// [`WidgetError::Api`] when the search fails.
    pub async fn search(&self, query: &str) -> Result<(), WidgetError> {
        let session_id = self.require_session()?;
        let query = query.trim();
        if query.is_empty() {
            self.core.update(|state| state.search_results.clear());
            return Ok(());
        }
        self.core.update(|state| {
            state.is_loading = true;
            state.error = None;
        });
        let users = match self.api.search_users(&session_id, query).await {
            Ok(users) => users,
            Err(e) => return Err(self.fail(e.into())),
        };
        self.core.update(|state| {
            state.search_results = users;
            state.is_loading = false;
        });
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Conversations
    // -------------------------------------------------------------------------

    /// Start a conversation with a searched user and show the list.
    ///
    /// # Errors
    ///
    /// Returns [`WidgetError::NoSession`] before a session exists and
    /// [`WidgetError::Api`] when the backend refuses.
    pub async fn start_conversation(&self, user_id: &str) -> Result<(), WidgetError> {
        let session_id = self.require_session()?;
        self.core.update(|state| {
            state.is_loading = true;
            state.error = None;
        });
        let conversation = match self.api.start_conversation(&session_id, user_id).await {
            Ok(conversation) => conversation,
            Err(e) => return Err(self.fail(e.into())),
        };
        self.subscribe(&conversation.id);
        self.core.update(|state| {
            state.upsert_conversation(conversation);
            state.search_results.clear();
            state.is_loading = false;
            state.view = View::Conversations;
        });
        Ok(())
    }

    /// Fetch the visitor's conversations and subscribe to each.
    ///
    /// # Errors
    ///
    /// Returns [`WidgetError::NoSession`] before a session exists and
    /// [`WidgetError::Api`] when the list cannot be loaded.
    pub async fn load_conversations(&self) -> Result<(), WidgetError> {
        let session_id = self.require_session()?;
        self.core.update(|state| {
            state.is_loading = true;
            state.error = None;
        });
        let conversations = match self.api.list_conversations(&session_id).await {
            Ok(conversations) => conversations,
            Err(e) => return Err(self.fail(e.into())),
        };
        for conversation in &conversations {
            if !self.subscriptions_guard().contains_key(&conversation.id) {
                self.subscribe(&conversation.id);
            }
        }
        self.core.update(|state| {
            state.conversations = conversations;
            state.is_loading = false;
        });
        Ok(())
    }

    /// Open a listed conversation in the chat view.
    ///
    /// # Errors
    ///
    /// Returns [`WidgetError::UnknownConversation`] for an id not in the list
    /// and [`WidgetError::Api`] when its history cannot be loaded.
    pub async fn select_conversation(&self, conversation_id: &str) -> Result<(), WidgetError> {
        let session_id = self.require_session()?;
        let summary = self
            .core
            .lock()
            .conversations
            .iter()
            .find(|c| c.id == conversation_id)
            .cloned()
            .ok_or_else(|| WidgetError::UnknownConversation(conversation_id.to_owned()))?;

        self.core.update(|state| {
            state.current_conversation = Some(summary);
            state.messages.clear();
            state.typing = None;
            state.view = View::Chat;
            state.is_loading = true;
            state.error = None;
        });
        let history = match self.api.list_messages(&session_id, conversation_id).await {
            Ok(history) => history,
            Err(e) => return Err(self.fail(e.into())),
        };

        if let Some(transport) = self.transport_guard().as_ref()
            && let Some(last) = history.last()
        {
            transport.seed_cursor(conversation_id, &last.id);
        }
        if !self.subscriptions_guard().contains_key(conversation_id) {
            self.subscribe(conversation_id);
        }
        self.core.update(|state| {
            // Deliveries that raced the history fetch are already in `messages`.
            let live = std::mem::take(&mut state.messages);
            state.messages = history;
            for message in live {
                state.append_message(message);
            }
            state.mark_read(conversation_id);
            state.is_loading = false;
        });

        if let Err(e) = self.api.mark_read(&session_id, conversation_id).await {
            warn!(conversation_id, error = %e, "mark read failed");
        }
        Ok(())
    }

    /// `chat -> conversations` and `search -> conversations`.
    pub fn back(&self) {
        self.core.update(|state| match state.view {
            View::Chat => {
                state.current_conversation = None;
                state.messages.clear();
                state.typing = None;
                state.view = View::Conversations;
            }
            View::Search => {
                state.search_results.clear();
                state.view = View::Conversations;
            }
            View::Closed | View::Prechat | View::Conversations => {}
        });
    }

    /// Post a message to the open conversation.
    ///
    /// # Errors
    ///
    /// Returns [`WidgetError::NoConversation`] outside the chat view and
    /// [`WidgetError::Api`] when the backend rejects the message.
    pub async fn send_message(&self, content: &str) -> Result<(), WidgetError> {
        let session_id = self.require_session()?;
        let conversation_id = self
            .core
            .lock()
            .current_conversation
            .as_ref()
            .map(|c| c.id.clone())
            .ok_or(WidgetError::NoConversation)?;
        let content = content.trim();
        if content.is_empty() {
            return Ok(());
        }
        let message = match self.api.send_message(&session_id, &conversation_id, content).await {
            Ok(message) => message,
            Err(e) => return Err(self.fail(e.into())),
        };
        self.core.update(|state| {
            if let Some(summary) = state.conversations.iter_mut().find(|c| c.id == conversation_id) {
                summary.last_message = Some(message.content.clone());
                summary.last_message_at = Some(message.created_at.clone());
            }
            state.append_message(message);
        });
        Ok(())
    }

    /// Forward the visitor's typing state for the open conversation.
    pub fn set_typing(&self, is_typing: bool) {
        let Some(conversation_id) = self.core.lock().current_conversation.as_ref().map(|c| c.id.clone()) else {
            return;
        };
        if let Some(transport) = self.transport_guard().as_ref() {
            transport.send_typing(&conversation_id, is_typing);
        }
    }

    /// Drop the session, every subscription and all visible state.
    ///
    /// # Errors
    ///
    /// Returns [`WidgetError::Session`] when the stored session cannot be
    /// removed.
    pub fn logout(&self) -> Result<(), WidgetError> {
        self.subscriptions_guard().clear();
        if let Some(transport) = self.transport_guard().take() {
            transport.disconnect();
        }
        self.sessions.clear_session()?;
        self.core.update(|state| *state = WidgetState::default());
        info!("widget logged out");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    /// View to show when (re)opening with a session.
    fn resume_view(&self, state: &WidgetState) -> View {
        if needs_prechat(self.prechat, state.session.as_ref()) {
            View::Prechat
        } else if state.current_conversation.is_some() {
            View::Chat
        } else {
            resolve_initial_view(self.prechat, self.target_user_id.as_deref(), state.session.as_ref())
        }
    }

    fn require_session(&self) -> Result<String, WidgetError> {
        self.core
            .lock()
            .session
            .as_ref()
            .map(|s: &AnonymousSession| s.session_id.clone())
            .filter(|id| !id.is_empty())
            .ok_or(WidgetError::NoSession)
    }

    fn fail(&self, err: WidgetError) -> WidgetError {
        warn!(error = %err, "widget operation failed");
        let message = err.to_string();
        self.core.update(|state| {
            state.is_loading = false;
            state.error = Some(message);
        });
        err
    }

    fn ensure_transport(&self, session_id: &str) {
        let mut transport = self.transport_guard();
        if transport.as_ref().is_some_and(|t| t.session_id() == session_id) {
            return;
        }
        self.subscriptions_guard().clear();
        *transport = Some(self.transports.create(session_id));
    }

    fn subscribe(&self, conversation_id: &str) {
        let transport = self.transport_guard();
        let Some(transport) = transport.as_ref() else {
            return;
        };
        let on_message: Weak<Core> = Arc::downgrade(&self.core);
        let on_typing = on_message.clone();
        let subscription = transport.subscribe_with_typing(
            conversation_id,
            move |message| {
                if let Some(core) = on_message.upgrade() {
                    core.on_message(message);
                }
            },
            move |indicator| {
                if let Some(core) = on_typing.upgrade() {
                    core.on_typing(indicator);
                }
            },
        );
        self.subscriptions_guard().insert(conversation_id.to_owned(), subscription);
    }

    fn transport_guard(&self) -> MutexGuard<'_, Option<RealtimeTransport>> {
        self.transport.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn subscriptions_guard(&self) -> MutexGuard<'_, HashMap<String, Subscription>> {
        self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
