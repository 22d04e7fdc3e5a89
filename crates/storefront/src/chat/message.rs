use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use storefront_llm::AssistantKind;
use storefront_storage::{MessageId, ThreadId};

/// Characters of the first message kept in a derived thread title.
pub const DERIVED_TITLE_MAX_CHARS: usize = 50;

/// Chat speaker role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Only the short-lived assistant placeholder ever carries `true`.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_loading: bool,
}

impl ChatMessage {
    /// New message with a fresh id, timestamped now.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: MessageId::new_v7(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            is_loading: false,
        }
    }

    /// Message typed by the user.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Assistant placeholder shown while a reply is produced.
    pub fn loading_placeholder() -> Self {
        Self {
            is_loading: true,
            ..Self::new(Role::Assistant, String::new())
        }
    }
}

/// One conversation with one assistant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatThread {
    pub id: ThreadId,
    pub assistant_id: String,
    pub assistant_name: String,
    pub assistant: AssistantKind,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub is_pinned: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_title: Option<String>,
}

impl ChatThread {
    /// Empty thread bound to one assistant.
    pub fn new(assistant_id: impl Into<String>, assistant_name: impl Into<String>) -> Self {
        let assistant_id = assistant_id.into();
        let assistant_name = assistant_name.into();
        let now = Utc::now();
        Self {
            id: ThreadId::new_v7(),
            assistant: AssistantKind::classify(&assistant_id, &assistant_name),
            assistant_id,
            assistant_name,
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
            is_pinned: false,
            custom_title: None,
        }
    }

    /// Custom title, else the first message truncated, else a per-assistant default.
    pub fn title(&self) -> String {
        if let Some(title) = self
            .custom_title
            .as_deref()
            .map(str::trim)
            .filter(|title| !title.is_empty())
        {
            return title.to_string();
        }

        if let Some(first) = self
            .messages
            .first()
            .map(|message| message.content.trim())
            .filter(|content| !content.is_empty())
        {
            return truncate_title(first);
        }

        format!("Chat with {}", self.assistant_name)
    }

    /// Bumps `updated_at`, which orders the thread list.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Position of the message in the thread.
    pub fn message_index(&self, message_id: MessageId) -> Option<usize> {
        self.messages
            .iter()
            .position(|message| message.id == message_id)
    }

    pub fn has_loading_message(&self) -> bool {
        self.messages.iter().any(|message| message.is_loading)
    }

    pub fn last_message(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }
}

fn truncate_title(text: &str) -> String {
    let single_line = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if single_line.chars().count() <= DERIVED_TITLE_MAX_CHARS {
        return single_line;
    }

    let mut truncated = single_line
        .chars()
        .take(DERIVED_TITLE_MAX_CHARS)
        .collect::<String>()
        .trim_end()
        .to_string();
    truncated.push_str("...");
    truncated
}
