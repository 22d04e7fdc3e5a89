use serde::{Deserialize, Serialize};

/// Id prefix the Assistants API uses for its assistant objects.
pub const REMOTE_ASSISTANT_PREFIX: &str = "asst_";

/// How replies for an assistant are produced, decided once when a thread is created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum AssistantKind {
    /// Backed by a remote Assistants API object with this id.
    Remote(String),
    /// Local persona answered from the canned reply bank under this name.
    Simulated(String),
}

impl AssistantKind {
    pub fn classify(assistant_id: &str, assistant_name: &str) -> Self {
        let assistant_id = assistant_id.trim();
        if assistant_id.starts_with(REMOTE_ASSISTANT_PREFIX) {
            Self::Remote(assistant_id.to_string())
        } else {
            Self::Simulated(assistant_name.trim().to_string())
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_))
    }

    pub fn remote_id(&self) -> Option<&str> {
        match self {
            Self::Remote(id) => Some(id),
            Self::Simulated(_) => None,
        }
    }
}
