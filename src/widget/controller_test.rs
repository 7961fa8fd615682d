use super::*;
use crate::config::PageContext;
use crate::realtime::{MessagePoller, PushChannel, PushConnector, TransportError};
use crate::session::{CreateSessionRequest, CreatedSession, KeyValueStore, MemoryStore, SESSION_KEY, SessionApi};
use crate::widget::state::{ConversationSummary, DirectoryUser};
use envelopes::{Directive, Envelope, SenderType, decode_directive, encode_envelope};
use serde_json::Map;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::mpsc;

// =========================================================================
// Mocks
// =========================================================================

#[derive(Default)]
struct MockSessionApi {
    reject_create: bool,
    creates: AtomicUsize,
    updates: Mutex<Vec<UserInfo>>,
}

#[async_trait::async_trait]
impl SessionApi for MockSessionApi {
    async fn create(&self, _request: &CreateSessionRequest) -> Result<CreatedSession, ApiError> {
        let n = self.creates.fetch_add(1, Ordering::SeqCst) + 1;
        if self.reject_create {
            return Err(ApiError::Backend { status: 403, message: "Domain not allowed".into() });
        }
        Ok(CreatedSession {
            session_id: format!("sess-{n}"),
            name: None,
            email: None,
            created_at: Some(OffsetDateTime::now_utc()),
            expires_at: None,
        })
    }

    async fn validate(&self, _session_id: &str) -> Result<(), ApiError> {
        Ok(())
    }

    async fn update(&self, _session_id: &str, info: &UserInfo) -> Result<(), ApiError> {
        self.updates.lock().unwrap().push(info.clone());
        Ok(())
    }
}

#[derive(Default)]
struct MockConversationApi {
    conversations: Mutex<Vec<ConversationSummary>>,
    history: Mutex<HashMap<String, Vec<ChatMessage>>>,
    searches: Mutex<Vec<String>>,
    reads: Mutex<Vec<String>>,
    sent: AtomicUsize,
    fail_list: AtomicBool,
}

#[async_trait::async_trait]
impl ConversationApi for MockConversationApi {
    async fn search_users(&self, _session_id: &str, query: &str) -> Result<Vec<DirectoryUser>, ApiError> {
        self.searches.lock().unwrap().push(query.to_owned());
        Ok(vec![DirectoryUser { id: "u1".into(), name: "Acme Support".into(), avatar_url: None, title: None }])
    }

    async fn list_conversations(&self, _session_id: &str) -> Result<Vec<ConversationSummary>, ApiError> {
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(ApiError::Backend { status: 500, message: "Failed to load conversations".into() });
        }
        Ok(self.conversations.lock().unwrap().clone())
    }

    async fn start_conversation(&self, _session_id: &str, user_id: &str) -> Result<ConversationSummary, ApiError> {
        Ok(summary(&format!("conv-{user_id}"), 0))
    }

    async fn list_messages(&self, _session_id: &str, conversation_id: &str) -> Result<Vec<ChatMessage>, ApiError> {
        Ok(self.history.lock().unwrap().get(conversation_id).cloned().unwrap_or_default())
    }

    async fn send_message(
        &self,
        _session_id: &str,
        conversation_id: &str,
        content: &str,
    ) -> Result<ChatMessage, ApiError> {
        let n = self.sent.fetch_add(1, Ordering::SeqCst) + 1;
        let mut sent = message(conversation_id, &format!("sent-{n}"));
        sent.content = content.to_owned();
        sent.sender_type = SenderType::Visitor;
        Ok(sent)
    }

    async fn mark_read(&self, _session_id: &str, conversation_id: &str) -> Result<(), ApiError> {
        self.reads.lock().unwrap().push(conversation_id.to_owned());
        Ok(())
    }
}

/// Server half of an accepted push connection.
struct ServerEnd {
    to_client: mpsc::UnboundedSender<String>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl ServerEnd {
    fn push(&self, envelope: &Envelope) {
        self.to_client.send(encode_envelope(envelope).unwrap()).unwrap();
    }

    fn directives(&mut self) -> Vec<Directive> {
        let mut out = Vec::new();
        while let Ok(text) = self.from_client.try_recv() {
            out.push(decode_directive(&text).unwrap());
        }
        out
    }
}

struct AcceptingConnector {
    accepted: mpsc::UnboundedSender<ServerEnd>,
}

#[async_trait::async_trait]
impl PushConnector for AcceptingConnector {
    async fn connect(&self, _session_id: &str) -> Result<PushChannel, TransportError> {
        let (outbound, from_client) = mpsc::unbounded_channel();
        let (to_client, inbound) = mpsc::unbounded_channel();
        self.accepted.send(ServerEnd { to_client, from_client }).map_err(|_| TransportError::Closed)?;
        Ok(PushChannel { outbound, inbound })
    }
}

struct RefusingConnector;

#[async_trait::async_trait]
impl PushConnector for RefusingConnector {
    async fn connect(&self, _session_id: &str) -> Result<PushChannel, TransportError> {
        Err(TransportError::Closed)
    }
}

/// Serves everything after `after`, or the whole history without a cursor.
#[derive(Default)]
struct HistoryPoller {
    messages: Mutex<HashMap<String, Vec<ChatMessage>>>,
}

impl HistoryPoller {
    fn publish(&self, message: ChatMessage) {
        self.messages.lock().unwrap().entry(message.conversation_id.clone()).or_default().push(message);
    }
}

#[async_trait::async_trait]
impl MessagePoller for HistoryPoller {
    async fn poll(
        &self,
        _session_id: &str,
        conversation_id: &str,
        after: Option<&str>,
    ) -> Result<Vec<ChatMessage>, TransportError> {
        let all = self.messages.lock().unwrap().get(conversation_id).cloned().unwrap_or_default();
        let start = after
            .and_then(|after| all.iter().position(|m| m.id == after).map(|i| i + 1))
            .unwrap_or(0);
        Ok(all[start..].to_vec())
    }
}

struct IdlePoller;

#[async_trait::async_trait]
impl MessagePoller for IdlePoller {
    async fn poll(
        &self,
        _session_id: &str,
        _conversation_id: &str,
        _after: Option<&str>,
    ) -> Result<Vec<ChatMessage>, TransportError> {
        Ok(Vec::new())
    }
}

struct MockTransports {
    connector: Arc<dyn PushConnector>,
    poller: Arc<dyn MessagePoller>,
    created: Mutex<Vec<String>>,
}

impl TransportFactory for MockTransports {
    fn create(&self, session_id: &str) -> RealtimeTransport {
        self.created.lock().unwrap().push(session_id.to_owned());
        let config = TransportConfig {
            poll_interval: POLL,
            reconnect_base_delay: Duration::from_millis(1_000),
            max_reconnect_attempts: 5,
        };
        RealtimeTransport::new(session_id, config, self.connector.clone(), self.poller.clone())
    }
}

// =========================================================================
// Helpers
// =========================================================================

fn summary(id: &str, unread: u32) -> ConversationSummary {
    ConversationSummary {
        id: id.into(),
        participant_id: None,
        participant_name: Some(format!("owner of {id}")),
        last_message: None,
        last_message_at: None,
        unread_count: unread,
    }
}

fn message(conversation_id: &str, id: &str) -> ChatMessage {
    ChatMessage {
        id: id.into(),
        conversation_id: conversation_id.into(),
        content: format!("text {id}"),
        sender_type: SenderType::Agent,
        sender_id: Some("agent-1".into()),
        sender_name: None,
        created_at: "2026-03-01T12:00:00Z".into(),
        extra: Map::new(),
    }
}

struct Harness {
    controller: WidgetController,
    sessions: Arc<MockSessionApi>,
    api: Arc<MockConversationApi>,
    transports: Arc<MockTransports>,
    servers: mpsc::UnboundedReceiver<ServerEnd>,
    store: Arc<MemoryStore>,
}

fn harness_over(
    prechat: PrechatRequirements,
    target: Option<&str>,
    session_api: MockSessionApi,
    transports: MockTransports,
    servers: mpsc::UnboundedReceiver<ServerEnd>,
) -> Harness {
    let sessions = Arc::new(session_api);
    let store = Arc::new(MemoryStore::new());
    let manager = Arc::new(SessionManager::new(sessions.clone(), store.clone(), PageContext::default()));
    let api = Arc::new(MockConversationApi::default());
    let transports = Arc::new(transports);
    let controller = WidgetController::new(prechat, target.map(str::to_owned), manager, api.clone(), transports.clone());
    Harness { controller, sessions, api, transports, servers, store }
}

fn harness_with(prechat: PrechatRequirements, target: Option<&str>, session_api: MockSessionApi) -> Harness {
    let (accepted, servers) = mpsc::unbounded_channel();
    let transports = MockTransports {
        connector: Arc::new(AcceptingConnector { accepted }),
        poller: Arc::new(IdlePoller),
        created: Mutex::new(Vec::new()),
    };
    harness_over(prechat, target, session_api, transports, servers)
}

/// Push always refused, so delivery runs on `poller`.
fn polling_harness(target: Option<&str>, poller: Arc<HistoryPoller>) -> Harness {
    let (_, servers) = mpsc::unbounded_channel();
    let transports = MockTransports {
        connector: Arc::new(RefusingConnector),
        poller,
        created: Mutex::new(Vec::new()),
    };
    harness_over(NONE, target, MockSessionApi::default(), transports, servers)
}

fn harness(prechat: PrechatRequirements, target: Option<&str>) -> Harness {
    harness_with(prechat, target, MockSessionApi::default())
}

const NONE: PrechatRequirements = PrechatRequirements { collect_name: false, collect_email: false };
const EMAIL: PrechatRequirements = PrechatRequirements { collect_name: false, collect_email: true };
const POLL: Duration = Duration::from_millis(3_000);

async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

/// Open with a target so the conversation list loads, then select `c1`.
async fn open_chat(h: &mut Harness) -> ServerEnd {
    *h.api.conversations.lock().unwrap() = vec![summary("c1", 2), summary("c2", 1)];
    h.api.history.lock().unwrap().insert("c1".into(), vec![message("c1", "m1"), message("c1", "m2")]);
    h.controller.open().await.unwrap();
    settle().await;
    let server = h.servers.recv().await.unwrap();
    h.controller.select_conversation("c1").await.unwrap();
    settle().await;
    server
}

// =========================================================================
// Open / close
// =========================================================================

#[tokio::test]
async fn open_without_prechat_or_target_shows_search() {
    let h = harness(NONE, None);
    h.controller.open().await.unwrap();

    let state = h.controller.state();
    assert!(state.is_open);
    assert_eq!(state.view, View::Search);
    assert!(!state.is_loading);
    assert_eq!(state.session.as_ref().map(|s| s.session_id.as_str()), Some("sess-1"));
    assert_eq!(*h.transports.created.lock().unwrap(), ["sess-1"]);
}

#[tokio::test]
async fn open_with_target_loads_and_subscribes_conversations() {
    let mut h = harness(NONE, Some("biz-1"));
    *h.api.conversations.lock().unwrap() = vec![summary("c1", 2), summary("c2", 1)];
    h.controller.open().await.unwrap();
    settle().await;

    let state = h.controller.state();
    assert_eq!(state.view, View::Conversations);
    assert_eq!(state.conversations.len(), 2);
    assert_eq!(state.unread_count, 3);

    let mut server = h.servers.recv().await.unwrap();
    let mut subscribed: Vec<String> = server
        .directives()
        .into_iter()
        .filter_map(|d| match d {
            Directive::Subscribe { conversation_id } => Some(conversation_id),
            Directive::Typing { .. } => None,
        })
        .collect();
    subscribed.sort();
    assert_eq!(subscribed, ["c1", "c2"]);
    assert_eq!(h.controller.delivery_mode(), Some(DeliveryMode::Connected));
}

#[tokio::test]
async fn session_failure_is_surfaced_in_state() {
    let h = harness_with(NONE, None, MockSessionApi { reject_create: true, ..MockSessionApi::default() });
    let err = h.controller.open().await.unwrap_err();
    assert!(matches!(err, WidgetError::Session(_)));

    let state = h.controller.state();
    assert!(!state.is_loading);
    assert_eq!(state.error.as_deref(), Some("Domain not allowed (HTTP 403)"));
    assert!(h.transports.created.lock().unwrap().is_empty());
}

#[tokio::test]
async fn list_failure_keeps_view_and_reports_error() {
    let h = harness(NONE, Some("biz-1"));
    h.api.fail_list.store(true, Ordering::SeqCst);
    assert!(matches!(h.controller.open().await, Err(WidgetError::Api(_))));

    let state = h.controller.state();
    assert_eq!(state.view, View::Conversations);
    assert_eq!(state.error.as_deref(), Some("Failed to load conversations (HTTP 500)"));
}

#[tokio::test]
async fn close_then_reopen_resumes_chat() {
    let mut h = harness(NONE, Some("biz-1"));
    let _server = open_chat(&mut h).await;

    h.controller.close();
    let closed = h.controller.state();
    assert!(!closed.is_open);
    assert_eq!(closed.view, View::Closed);

    h.controller.toggle().await.unwrap();
    let reopened = h.controller.state();
    assert!(reopened.is_open);
    assert_eq!(reopened.view, View::Chat);
    assert_eq!(h.sessions.creates.load(Ordering::SeqCst), 1);
    assert_eq!(h.transports.created.lock().unwrap().len(), 1);
}

// =========================================================================
// Pre-chat / search
// =========================================================================

#[tokio::test]
async fn prechat_until_email_is_submitted() {
    let h = harness(EMAIL, None);
    h.controller.open().await.unwrap();
    assert_eq!(h.controller.state().view, View::Prechat);

    let info = UserInfo { email: Some("ada@example.com".into()), ..UserInfo::default() };
    h.controller.submit_prechat(info.clone()).await.unwrap();

    let state = h.controller.state();
    assert_eq!(state.view, View::Search);
    assert_eq!(state.session.and_then(|s| s.email).as_deref(), Some("ada@example.com"));
    assert_eq!(*h.sessions.updates.lock().unwrap(), [info]);
}

#[tokio::test]
async fn blank_search_clears_without_request() {
    let h = harness(NONE, None);
    h.controller.open().await.unwrap();

    h.controller.search("Acme").await.unwrap();
    assert_eq!(h.controller.state().search_results.len(), 1);

    h.controller.search("   ").await.unwrap();
    assert!(h.controller.state().search_results.is_empty());
    assert_eq!(*h.api.searches.lock().unwrap(), ["Acme"]);
}

#[tokio::test]
async fn search_requires_session() {
    let h = harness(NONE, None);
    assert!(matches!(h.controller.search("Acme").await, Err(WidgetError::NoSession)));
}

#[tokio::test]
async fn start_conversation_lists_and_subscribes() {
    let mut h = harness(NONE, None);
    h.controller.open().await.unwrap();
    h.controller.search("Acme").await.unwrap();
    h.controller.start_conversation("u1").await.unwrap();
    settle().await;

    let state = h.controller.state();
    assert_eq!(state.view, View::Conversations);
    assert_eq!(state.conversations[0].id, "conv-u1");
    assert!(state.search_results.is_empty());

    let mut server = h.servers.recv().await.unwrap();
    assert_eq!(server.directives(), [Directive::subscribe("conv-u1")]);
}

// =========================================================================
// Chat
// =========================================================================

#[tokio::test]
async fn select_loads_history_and_marks_read() {
    let mut h = harness(NONE, Some("biz-1"));
    let _server = open_chat(&mut h).await;

    let state = h.controller.state();
    assert_eq!(state.view, View::Chat);
    assert_eq!(state.current_conversation.as_ref().map(|c| c.id.as_str()), Some("c1"));
    let ids: Vec<&str> = state.messages.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, ["m1", "m2"]);
    assert_eq!(state.unread_count, 1);
    assert_eq!(*h.api.reads.lock().unwrap(), ["c1"]);
}

#[tokio::test]
async fn select_unknown_conversation_fails() {
    let h = harness(NONE, None);
    h.controller.open().await.unwrap();
    let err = h.controller.select_conversation("nope").await.unwrap_err();
    assert!(matches!(err, WidgetError::UnknownConversation(id) if id == "nope"));
}

#[tokio::test]
async fn pushed_messages_update_chat_and_unread() {
    let mut h = harness(NONE, Some("biz-1"));
    let server = open_chat(&mut h).await;

    server.push(&Envelope::NewMessage(message("c1", "m3")));
    server.push(&Envelope::NewMessage(message("c2", "x1")));
    settle().await;

    let state = h.controller.state();
    let ids: Vec<&str> = state.messages.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, ["m1", "m2", "m3"]);
    assert_eq!(state.conversations[1].unread_count, 2);
    assert_eq!(state.conversations[1].last_message.as_deref(), Some("text x1"));
    assert_eq!(state.unread_count, 2);
}

#[tokio::test]
async fn typing_notice_shows_for_open_chat() {
    let mut h = harness(NONE, Some("biz-1"));
    let server = open_chat(&mut h).await;

    server.push(&Envelope::Typing(TypingIndicator {
        conversation_id: "c1".into(),
        name: "Grace".into(),
        is_typing: true,
        user_id: None,
    }));
    settle().await;
    assert_eq!(h.controller.state().typing.map(|t| t.name).as_deref(), Some("Grace"));

    server.push(&Envelope::NewMessage(message("c1", "m3")));
    settle().await;
    assert_eq!(h.controller.state().typing, None);
}

#[tokio::test]
async fn sent_message_is_not_duplicated_by_push_echo() {
    let mut h = harness(NONE, Some("biz-1"));
    let server = open_chat(&mut h).await;

    h.controller.send_message("  hello  ").await.unwrap();
    let mut echo = message("c1", "sent-1");
    echo.content = "hello".into();
    server.push(&Envelope::NewMessage(echo));
    settle().await;

    let state = h.controller.state();
    let contents: Vec<&str> = state.messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, ["text m1", "text m2", "hello"]);
    assert_eq!(state.conversations[0].last_message.as_deref(), Some("hello"));
}

#[tokio::test]
async fn send_requires_open_conversation() {
    let h = harness(NONE, None);
    h.controller.open().await.unwrap();
    assert!(matches!(h.controller.send_message("hi").await, Err(WidgetError::NoConversation)));
}

#[tokio::test]
async fn typing_directive_sent_for_open_chat() {
    let mut h = harness(NONE, Some("biz-1"));
    let mut server = open_chat(&mut h).await;
    server.directives();

    h.controller.set_typing(true);
    assert_eq!(server.directives(), [Directive::typing("c1", true)]);
}

#[tokio::test]
async fn back_walks_chat_to_conversations() {
    let mut h = harness(NONE, Some("biz-1"));
    let _server = open_chat(&mut h).await;

    h.controller.back();
    let state = h.controller.state();
    assert_eq!(state.view, View::Conversations);
    assert_eq!(state.current_conversation, None);
    assert!(state.messages.is_empty());

    h.controller.back();
    assert_eq!(h.controller.state().view, View::Conversations);
}

#[tokio::test(start_paused = true)]
async fn polling_fallback_does_not_count_history_as_unread() {
    let poller = Arc::new(HistoryPoller::default());
    for (conversation_id, id) in [("c1", "old-1"), ("c1", "old-2"), ("c2", "old-3"), ("c2", "old-4")] {
        poller.publish(message(conversation_id, id));
    }
    let h = polling_harness(Some("biz-1"), poller.clone());
    *h.api.conversations.lock().unwrap() = vec![summary("c1", 0), summary("c2", 0)];
    h.controller.open().await.unwrap();
    settle().await;
    tokio::time::sleep(POLL).await;
    settle().await;

    assert_eq!(h.controller.delivery_mode(), Some(DeliveryMode::Polling));
    assert_eq!(h.controller.state().unread_count, 0);

    poller.publish(message("c2", "new-1"));
    tokio::time::sleep(POLL).await;
    settle().await;

    let state = h.controller.state();
    assert_eq!(state.unread_count, 1);
    assert_eq!(state.conversations[1].last_message.as_deref(), Some("text new-1"));
}

// =========================================================================
// Render hook / logout
// =========================================================================

#[tokio::test]
async fn render_hook_sees_every_change() {
    let h = harness(NONE, None);
    let views: Arc<Mutex<Vec<View>>> = Arc::default();
    let sink = views.clone();
    let controller = h.controller.with_render_hook(move |state| sink.lock().unwrap().push(state.view));

    controller.open().await.unwrap();
    controller.close();

    let views = views.lock().unwrap();
    assert_eq!(views.first(), Some(&View::Closed));
    assert!(views.contains(&View::Search));
    assert_eq!(views.last(), Some(&View::Closed));
}

#[tokio::test]
async fn logout_resets_everything() {
    let mut h = harness(NONE, Some("biz-1"));
    let _server = open_chat(&mut h).await;

    h.controller.logout().unwrap();
    assert_eq!(h.controller.state(), WidgetState::default());
    assert_eq!(h.controller.delivery_mode(), None);
    assert!(h.store.get(SESSION_KEY).unwrap().is_none());

    h.controller.open().await.unwrap();
    assert_eq!(h.sessions.creates.load(Ordering::SeqCst), 2);
    assert_eq!(*h.transports.created.lock().unwrap(), ["sess-1", "sess-2"]);
}
