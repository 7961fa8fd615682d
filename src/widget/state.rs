//! Widget view state and the pure rules that derive it.
//!
//! DESIGN
//! ======
//! Everything here is synchronous and side-effect free so the controller's
//! transitions can be tested without a network. The controller owns one
//! [`WidgetState`] and calls into these helpers after every mutation.

#[cfg(test)]
#[path = "state_test.rs"]
mod state_test;

use envelopes::{ChatMessage, TypingIndicator};
use serde::{Deserialize, Serialize};

use crate::config::PrechatRequirements;
use crate::session::AnonymousSession;

/// What the widget is showing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum View {
    #[default]
    Closed,
    /// Collect name/email before chatting.
    Prechat,
    /// Directory search for someone to talk to.
    Search,
    Conversations,
    Chat,
}

/// A conversation as listed in the widget.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub id: String,
    #[serde(default)]
    pub participant_id: Option<String>,
    #[serde(default)]
    pub participant_name: Option<String>,
    #[serde(default)]
    pub last_message: Option<String>,
    #[serde(default)]
    pub last_message_at: Option<String>,
    #[serde(default)]
    pub unread_count: u32,
}

/// A business user returned by directory search.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryUser {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct WidgetState {
    pub is_open: bool,
    pub view: View,
    pub is_loading: bool,
    pub error: Option<String>,
    pub session: Option<AnonymousSession>,
    pub conversations: Vec<ConversationSummary>,
    pub current_conversation: Option<ConversationSummary>,
    /// Messages of `current_conversation`, oldest first.
    pub messages: Vec<ChatMessage>,
    pub search_results: Vec<DirectoryUser>,
    /// Sum of every listed conversation's unread count.
    pub unread_count: u32,
    /// Live typing notice for `current_conversation`.
    pub typing: Option<TypingIndicator>,
}

impl WidgetState {
    pub fn recompute_unread(&mut self) {
        self.unread_count = self.conversations.iter().map(|c| c.unread_count).sum();
    }

    fn is_current(&self, conversation_id: &str) -> bool {
        self.current_conversation.as_ref().is_some_and(|c| c.id == conversation_id)
    }

    /// Append unless a message with the same id is already present.
    pub fn append_message(&mut self, message: ChatMessage) -> bool {
        if self.messages.iter().any(|m| m.id == message.id) {
            return false;
        }
        self.messages.push(message);
        true
    }

    /// Apply a delivered message: append it to the open chat, or count it as
    /// unread on its conversation.
    pub fn apply_incoming(&mut self, message: ChatMessage) {
        let current = self.is_current(&message.conversation_id);
        if let Some(summary) = self.conversations.iter_mut().find(|c| c.id == message.conversation_id) {
            summary.last_message = Some(message.content.clone());
            summary.last_message_at = Some(message.created_at.clone());
            if !current {
                summary.unread_count += 1;
            }
        }
        if current {
            self.typing = None;
            self.append_message(message);
        }
        self.recompute_unread();
    }

    /// Track typing for the open chat; other conversations are ignored.
    pub fn apply_typing(&mut self, indicator: TypingIndicator) {
        if !self.is_current(&indicator.conversation_id) {
            return;
        }
        self.typing = indicator.is_typing.then_some(indicator);
    }

    /// Insert or replace a conversation, keeping list order.
    pub fn upsert_conversation(&mut self, conversation: ConversationSummary) {
        match self.conversations.iter_mut().find(|c| c.id == conversation.id) {
            Some(existing) => *existing = conversation,
            None => self.conversations.insert(0, conversation),
        }
        self.recompute_unread();
    }

    /// Zero the unread count of `conversation_id`.
    pub fn mark_read(&mut self, conversation_id: &str) {
        if let Some(summary) = self.conversations.iter_mut().find(|c| c.id == conversation_id) {
            summary.unread_count = 0;
        }
        self.recompute_unread();
    }
}

/// Pre-chat is shown only while some field is configured and the session
/// carries neither a name nor an email. Either one is enough to skip it.
#[must_use]
pub fn needs_prechat(prechat: PrechatRequirements, session: Option<&AnonymousSession>) -> bool {
    let has_name = session.is_some_and(AnonymousSession::has_name);
    let has_email = session.is_some_and(AnonymousSession::has_email);
    (prechat.collect_name || prechat.collect_email) && !has_name && !has_email
}

/// View to show once a session is available.
#[must_use]
pub fn resolve_initial_view(
    prechat: PrechatRequirements,
    target_user_id: Option<&str>,
    session: Option<&AnonymousSession>,
) -> View {
    if needs_prechat(prechat, session) {
        View::Prechat
    } else if target_user_id.is_some() {
        View::Conversations
    } else {
        View::Search
    }
}
