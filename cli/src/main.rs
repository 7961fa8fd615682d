use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use convo_widget::config::{
    DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_MAX_RECONNECT_ATTEMPTS, DEFAULT_POLL_INTERVAL_MS, DEFAULT_RECONNECT_BASE_MS,
    DEFAULT_REQUEST_TIMEOUT_SECS,
};
use convo_widget::envelopes::{ChatMessage, TypingIndicator};
use convo_widget::realtime::RealtimeTransport;
use convo_widget::session::SessionManager;
use convo_widget::widget::{ConversationApi, HttpConversationApi};
use convo_widget::{
    ApiClient, ApiConfig, ApiError, PageContext, SessionError, TransportConfig, TransportEvent, UserInfo, WidgetConfig,
};
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("nothing to update; pass --name, --email or --phone")]
    EmptyUpdate,
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("signal handler failed: {0}")]
    Signal(#[from] std::io::Error),
}

#[derive(Parser, Debug)]
#[command(name = "convo-cli", about = "Chat widget session and delivery CLI")]
struct Cli {
    #[arg(long, env = "WIDGET_API_BASE", default_value = convo_widget::config::DEFAULT_API_BASE)]
    api_base: String,

    #[arg(long, env = "WIDGET_API_KEY")]
    api_key: String,

    /// Page origin reported when a session is created.
    #[arg(long, env = "WIDGET_ORIGIN")]
    origin: Option<String>,

    #[arg(long, env = "WIDGET_REFERRER", default_value = "")]
    referrer: String,

    /// Persist the visitor session here; in-memory when omitted.
    #[arg(long, env = "WIDGET_STORAGE_DIR")]
    storage_dir: Option<PathBuf>,

    #[arg(long, env = "WIDGET_REQUEST_TIMEOUT_SECS", default_value_t = DEFAULT_REQUEST_TIMEOUT_SECS)]
    request_timeout_secs: u64,

    #[arg(long, env = "WIDGET_CONNECT_TIMEOUT_SECS", default_value_t = DEFAULT_CONNECT_TIMEOUT_SECS)]
    connect_timeout_secs: u64,

    /// Delay between polls once push delivery is unavailable.
    #[arg(long, env = "WIDGET_POLL_INTERVAL_MS", default_value_t = DEFAULT_POLL_INTERVAL_MS)]
    poll_interval_ms: u64,

    #[arg(long, env = "WIDGET_RECONNECT_BASE_MS", default_value_t = DEFAULT_RECONNECT_BASE_MS)]
    reconnect_base_ms: u64,

    #[arg(long, env = "WIDGET_MAX_RECONNECT_ATTEMPTS", default_value_t = DEFAULT_MAX_RECONNECT_ATTEMPTS)]
    max_reconnect_attempts: u32,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print this machine's visitor fingerprint.
    Fingerprint,
    /// Restore or create the visitor session.
    Session,
    /// Attach visitor details to the session.
    Update {
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        phone: Option<String>,
    },
    /// Forget the stored session.
    Logout,
    Search {
        query: String,
    },
    Conversations,
    Start {
        user_id: String,
    },
    Messages {
        conversation_id: String,
    },
    Send {
        conversation_id: String,
        content: String,
    },
    /// Stream messages for conversations until Ctrl-C.
    Watch {
        #[arg(required = true)]
        conversation_ids: Vec<String>,
    },
}

impl Cli {
    fn widget_config(&self) -> WidgetConfig {
        let mut api = ApiConfig::new(self.api_base.trim_end_matches('/'), self.api_key.clone());
        api.request_timeout_secs = self.request_timeout_secs;
        api.connect_timeout_secs = self.connect_timeout_secs;

        let mut config = WidgetConfig::new(api);
        match &self.origin {
            Some(origin) => config.page = PageContext::from_origin(origin.clone(), self.referrer.clone()),
            None => config.page.referrer.clone_from(&self.referrer),
        }
        config.transport = TransportConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            reconnect_base_delay: Duration::from_millis(self.reconnect_base_ms),
            max_reconnect_attempts: self.max_reconnect_attempts,
        };
        config.storage_dir.clone_from(&self.storage_dir);
        config
    }
}

struct CliContext {
    config: WidgetConfig,
    sessions: SessionManager,
}

impl CliContext {
    fn new(cli: &Cli) -> Result<Self, CliError> {
        let config = cli.widget_config();
        let sessions = SessionManager::from_config(&config)?;
        Ok(Self { config, sessions })
    }

    fn client(&self) -> Result<ApiClient, CliError> {
        Ok(ApiClient::new(&self.config.api)?)
    }

    async fn session_id(&self) -> Result<String, CliError> {
        Ok(self.sessions.get_or_create_session().await?.session_id)
    }
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let ctx = CliContext::new(&cli)?;

    match cli.command {
        Command::Fingerprint => {
            println!("{}", ctx.sessions.fingerprint()?);
            Ok(())
        }
        Command::Session => {
            let session = ctx.sessions.get_or_create_session().await?;
            print_json(&serde_json::to_value(session)?)
        }
        Command::Update { name, email, phone } => run_update(&ctx, UserInfo { name, email, phone, metadata: None }).await,
        Command::Logout => {
            ctx.sessions.clear_session()?;
            eprintln!("session cleared");
            Ok(())
        }
        Command::Search { query } => {
            let session_id = ctx.session_id().await?;
            let users = HttpConversationApi::new(ctx.client()?).search_users(&session_id, &query).await?;
            print_json(&serde_json::to_value(users)?)
        }
        Command::Conversations => {
            let session_id = ctx.session_id().await?;
            let conversations = HttpConversationApi::new(ctx.client()?).list_conversations(&session_id).await?;
            print_json(&serde_json::to_value(conversations)?)
        }
        Command::Start { user_id } => {
            let session_id = ctx.session_id().await?;
            let conversation = HttpConversationApi::new(ctx.client()?)
                .start_conversation(&session_id, &user_id)
                .await?;
            print_json(&serde_json::to_value(conversation)?)
        }
        Command::Messages { conversation_id } => {
            let session_id = ctx.session_id().await?;
            let messages = HttpConversationApi::new(ctx.client()?)
                .list_messages(&session_id, &conversation_id)
                .await?;
            for message in &messages {
                print_message(message);
            }
            Ok(())
        }
        Command::Send { conversation_id, content } => {
            let session_id = ctx.session_id().await?;
            let message = HttpConversationApi::new(ctx.client()?)
                .send_message(&session_id, &conversation_id, &content)
                .await?;
            print_message(&message);
            Ok(())
        }
        Command::Watch { conversation_ids } => run_watch(&ctx, conversation_ids).await,
    }
}

async fn run_update(ctx: &CliContext, info: UserInfo) -> Result<(), CliError> {
    if info.is_empty() {
        return Err(CliError::EmptyUpdate);
    }
    ctx.sessions.get_or_create_session().await?;
    let session = ctx.sessions.update_user_info(&info).await?;
    print_json(&serde_json::to_value(session)?)
}

async fn run_watch(ctx: &CliContext, conversation_ids: Vec<String>) -> Result<(), CliError> {
    let session_id = ctx.session_id().await?;
    let transport = RealtimeTransport::over_http(ctx.client()?, session_id, ctx.config.transport);
    let mut events = transport.events();

    let subscriptions: Vec<_> = conversation_ids
        .iter()
        .map(|id| {
            transport.subscribe_with_typing(id, |m: ChatMessage| print_message(&m), |t: TypingIndicator| {
                let state = if t.is_typing { "is typing" } else { "stopped typing" };
                eprintln!("[{}] {} {state}", t.conversation_id, t.name);
            })
        })
        .collect();
    eprintln!("watching {} conversation(s); Ctrl-C to stop", subscriptions.len());

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            result = &mut shutdown => {
                result?;
                break;
            }
            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "transport events lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    for subscription in &subscriptions {
        subscription.unsubscribe();
    }
    transport.disconnect();
    Ok(())
}

fn print_event(event: &TransportEvent) {
    match event {
        TransportEvent::ModeChanged(mode) => eprintln!("delivery: {mode:?}"),
        TransportEvent::Disconnected => eprintln!("push connection lost"),
        TransportEvent::ReconnectScheduled { attempt, delay } => {
            eprintln!("reconnect attempt {attempt} in {}ms", delay.as_millis());
        }
        TransportEvent::PushExhausted => eprintln!("push unavailable; polling"),
        TransportEvent::PollFailed { conversation_id, consecutive_failures } => {
            eprintln!("poll failed for {conversation_id} ({consecutive_failures} in a row)");
        }
    }
}

fn print_message(message: &ChatMessage) {
    let sender = message
        .sender_name
        .clone()
        .unwrap_or_else(|| format!("{:?}", message.sender_type).to_lowercase());
    println!("[{}] {} {}: {}", message.conversation_id, message.created_at, sender, message.content);
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;
